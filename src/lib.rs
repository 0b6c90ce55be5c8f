#![forbid(unsafe_code)]

pub mod catalog;
pub mod config;
pub mod cookies;
pub mod error;
pub mod itunes;
pub mod phase;
pub mod pipeline;
pub mod provisioner;
pub mod proxy;
pub mod range;
pub mod resolver;
pub mod utility;
