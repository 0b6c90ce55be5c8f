#![forbid(unsafe_code)]

//! Turns a candidate into a short-lived direct media URL using yt-dlp.

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use mime_guess::MimeGuess;
use reqwest::Url;
use tracing::{info, warn};

use crate::{
    catalog::CandidateItem,
    cookies::CookieJar,
    error::{MediaError, MediaResult},
    provisioner::BinaryProvisioner,
    utility::{log_stderr, run_utility},
};

pub const FALLBACK_AUDIO_FORMAT: &str = "audio/mpeg";

/// Direct URL for one request. Time-limited and bound to the identity that
/// requested it, so it is never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub direct_url: String,
    /// Best guess at the stream's content type, always `audio/*`.
    pub approximate_format: String,
}

impl ResolvedMedia {
    pub fn new(direct_url: impl Into<String>) -> Self {
        let direct_url = direct_url.into();
        Self {
            approximate_format: approximate_format(&direct_url),
            direct_url,
        }
    }
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, candidate: &CandidateItem) -> MediaResult<ResolvedMedia>;
}

pub struct YtDlpResolver {
    provisioner: Arc<BinaryProvisioner>,
    cookies: Arc<CookieJar>,
    user_agent: String,
    timeout: Duration,
}

impl YtDlpResolver {
    pub fn new(
        provisioner: Arc<BinaryProvisioner>,
        cookies: Arc<CookieJar>,
        user_agent: String,
        timeout: Duration,
    ) -> Self {
        Self {
            provisioner,
            cookies,
            user_agent,
            timeout,
        }
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(&self, candidate: &CandidateItem) -> MediaResult<ResolvedMedia> {
        let binary = self.provisioner.ensure().await?;
        let lease = self.cookies.lease().await?;
        let args = resolve_args(
            &self.user_agent,
            lease.as_ref().map(|lease| lease.path()),
            &candidate.canonical_url,
        );

        let output = run_utility(&binary.path, &args, self.timeout)
            .await
            .map_err(|err| {
                warn!(error = %err, id = %candidate.external_id, "resolve subprocess failed");
                MediaError::ResolutionFailed(err.to_string())
            })?;
        drop(lease);
        log_stderr("resolve", &output.stderr);

        if !output.success {
            return Err(MediaError::ResolutionFailed(format!(
                "yt-dlp exited with {}",
                output.exit
            )));
        }
        let direct_url = first_media_url(&output.stdout).ok_or_else(|| {
            MediaError::ResolutionFailed("yt-dlp produced no media url".to_string())
        })?;

        let media = ResolvedMedia::new(direct_url);
        info!(
            id = %candidate.external_id,
            format = %media.approximate_format,
            "resolved direct url"
        );
        Ok(media)
    }
}

fn resolve_args(user_agent: &str, cookies: Option<&Path>, url: &str) -> Vec<String> {
    let mut args = vec![
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "-f".to_string(),
        "bestaudio".to_string(),
        "-g".to_string(),
        "--user-agent".to_string(),
        user_agent.to_string(),
    ];
    if let Some(path) = cookies {
        args.push("--cookies".to_string());
        args.push(path.display().to_string());
    }
    args.push("--".to_string());
    args.push(url.to_string());
    args
}

fn first_media_url(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("https://") || line.starts_with("http://"))
}

/// googlevideo URLs carry `mime=audio/webm`; otherwise guess from the path.
fn approximate_format(direct_url: &str) -> String {
    let Ok(url) = Url::parse(direct_url) else {
        return FALLBACK_AUDIO_FORMAT.to_string();
    };
    if let Some((_, mime)) = url.query_pairs().find(|(key, _)| key == "mime")
        && mime.starts_with("audio/")
    {
        return mime.into_owned();
    }
    match MimeGuess::from_path(url.path()).first() {
        Some(guess) if matches!(guess.type_().as_str(), "audio" | "video") => {
            format!("audio/{}", guess.subtype())
        }
        _ => FALLBACK_AUDIO_FORMAT.to_string(),
    }
}
