#![forbid(unsafe_code)]

//! Provider cookie jar written to scratch storage for yt-dlp's `--cookies`.
//!
//! The file is shared by every request in the process. Resolutions hold a
//! read lease while the subprocess runs; the file is only (re)written under
//! the write lock, and always via rename, so a reader never sees a partial
//! jar.

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use base64::Engine as _;
use tempfile::NamedTempFile;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{debug, warn};

use crate::error::{MediaError, MediaResult};

pub const COOKIES_FILE: &str = "cookies.txt";
const BASE64_PREFIX: &str = "base64:";

pub struct CookieJar {
    payload: Option<Vec<u8>>,
    path: PathBuf,
    lock: RwLock<()>,
}

/// Keeps the jar from being rewritten while a subprocess reads it.
pub struct CookieLease<'a> {
    path: &'a Path,
    _guard: RwLockReadGuard<'a, ()>,
}

impl CookieLease<'_> {
    pub fn path(&self) -> &Path {
        self.path
    }
}

impl CookieJar {
    /// `raw` is either a Netscape cookie file or `base64:` followed by one.
    pub fn new(scratch_dir: &Path, raw: Option<&str>) -> Result<Self> {
        let payload = raw
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(decode_payload)
            .transpose()?;
        Ok(Self {
            payload,
            path: scratch_dir.join(COOKIES_FILE),
            lock: RwLock::new(()),
        })
    }

    pub fn disabled() -> Self {
        Self {
            payload: None,
            path: PathBuf::new(),
            lock: RwLock::new(()),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.payload.is_some()
    }

    /// Returns `None` when no cookies are configured.
    pub async fn lease(&self) -> MediaResult<Option<CookieLease<'_>>> {
        let Some(payload) = &self.payload else {
            return Ok(None);
        };

        let read = self.lock.read().await;
        if self.path.is_file() {
            return Ok(Some(CookieLease {
                path: &self.path,
                _guard: read,
            }));
        }
        drop(read);

        let write = self.lock.write().await;
        if !self.path.is_file() {
            write_atomic(&self.path, payload).map_err(|err| {
                warn!(error = %format!("{err:#}"), "writing cookie jar failed");
                MediaError::ResolutionFailed("cookie jar unavailable".to_string())
            })?;
            debug!(path = %self.path.display(), "cookie jar written");
        }
        Ok(Some(CookieLease {
            path: &self.path,
            _guard: write.downgrade(),
        }))
    }
}

fn decode_payload(raw: &str) -> Result<Vec<u8>> {
    match raw.strip_prefix(BASE64_PREFIX) {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .context("YTDLP_COOKIES is not valid base64"),
        None => {
            // Env files flatten newlines; restore them so yt-dlp can parse the jar.
            Ok(raw.replace("\\n", "\n").replace("\\t", "\t").into_bytes())
        }
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let mut staged = NamedTempFile::new_in(parent)?;
    staged.write_all(payload)?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("moving cookie jar into {}", path.display()))?;
    Ok(())
}
