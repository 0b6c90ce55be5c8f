#![forbid(unsafe_code)]

//! Turns a free-text query into candidate media items.
//!
//! Only the first candidate is ever played. No re-ranking happens here: a
//! cover or remix that the provider lists first wins over the original.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{MediaError, MediaResult},
    provisioner::BinaryProvisioner,
    utility::{log_stderr, run_utility},
};

const SEARCH_PAGE_SIZE: usize = 5;
const MAX_QUERY_LEN: usize = 300;
const MAX_ID_LEN: usize = 64;

/// What the client asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaQuery {
    /// Typically `"{title} {artist} audio"`.
    Text(String),
    /// Provider-native id; skips the search step.
    ProviderId(String),
}

impl MediaQuery {
    /// An id wins when both are supplied.
    pub fn from_params(query: Option<String>, id: Option<String>) -> MediaResult<Self> {
        if let Some(id) = id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()) {
            return Self::provider_id(id);
        }
        match query {
            Some(text) => Self::text(text),
            None => Err(MediaError::InvalidRequest(
                "Query 'query' or 'id' is required".to_string(),
            )),
        }
    }

    pub fn text(text: impl Into<String>) -> MediaResult<Self> {
        let text = text.into();
        let text = text.trim();
        if text.is_empty() {
            return Err(MediaError::InvalidRequest(
                "search text must not be empty".to_string(),
            ));
        }
        if text.len() > MAX_QUERY_LEN {
            return Err(MediaError::InvalidRequest(format!(
                "search text longer than {MAX_QUERY_LEN} bytes"
            )));
        }
        Ok(Self::Text(text.to_string()))
    }

    pub fn provider_id(id: impl Into<String>) -> MediaResult<Self> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_ID_LEN
            && id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        if !valid {
            return Err(MediaError::InvalidRequest("malformed track id".to_string()));
        }
        Ok(Self::ProviderId(id))
    }
}

impl fmt::Display for MediaQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "query:{text}"),
            Self::ProviderId(id) => write!(f, "id:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateItem {
    pub external_id: String,
    pub title: String,
    pub canonical_url: String,
}

#[async_trait]
pub trait CatalogSearcher: Send + Sync {
    /// Candidates in provider order. Zero results is `NotFound`.
    async fn search(&self, query: &str) -> MediaResult<Vec<CandidateItem>>;

    /// Builds a candidate straight from a provider id.
    fn candidate_for_id(&self, id: &str) -> CandidateItem;
}

pub fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={id}")
}

/// Searches YouTube through yt-dlp's `ytsearchN:` pseudo-URL.
pub struct YtDlpSearch {
    provisioner: Arc<BinaryProvisioner>,
    user_agent: String,
    timeout: Duration,
}

impl YtDlpSearch {
    pub fn new(provisioner: Arc<BinaryProvisioner>, user_agent: String, timeout: Duration) -> Self {
        Self {
            provisioner,
            user_agent,
            timeout,
        }
    }

    fn args(&self, query: &str) -> Vec<String> {
        vec![
            "--flat-playlist".to_string(),
            "--dump-single-json".to_string(),
            "--no-warnings".to_string(),
            "--user-agent".to_string(),
            self.user_agent.clone(),
            "--".to_string(),
            format!("ytsearch{SEARCH_PAGE_SIZE}:{query}"),
        ]
    }
}

#[async_trait]
impl CatalogSearcher for YtDlpSearch {
    async fn search(&self, query: &str) -> MediaResult<Vec<CandidateItem>> {
        let binary = self.provisioner.ensure().await?;
        let output = run_utility(&binary.path, &self.args(query), self.timeout)
            .await
            .map_err(|err| {
                warn!(error = %err, "search subprocess failed");
                MediaError::SearchFailed(err.to_string())
            })?;
        log_stderr("search", &output.stderr);
        if !output.success {
            return Err(MediaError::SearchFailed(format!(
                "yt-dlp exited with {}",
                output.exit
            )));
        }

        let candidates = parse_search_listing(&output.stdout)?;
        debug!(count = candidates.len(), "search finished");
        if candidates.is_empty() {
            return Err(MediaError::NotFound {
                query: query.to_string(),
            });
        }
        Ok(candidates)
    }

    fn candidate_for_id(&self, id: &str) -> CandidateItem {
        CandidateItem {
            external_id: id.to_string(),
            title: id.to_string(),
            canonical_url: watch_url(id),
        }
    }
}

/// Subset of `yt-dlp --flat-playlist --dump-single-json` output.
#[derive(Deserialize)]
struct SearchListing {
    #[serde(default)]
    entries: Vec<SearchEntry>,
}

#[derive(Deserialize)]
struct SearchEntry {
    id: Option<String>,
    title: Option<String>,
    url: Option<String>,
}

fn parse_search_listing(stdout: &str) -> MediaResult<Vec<CandidateItem>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let listing: SearchListing = serde_json::from_str(trimmed)
        .map_err(|err| MediaError::SearchFailed(format!("parsing search listing: {err}")))?;

    Ok(listing
        .entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry.id.filter(|id| !id.trim().is_empty())?;
            let canonical_url = entry
                .url
                .filter(|url| url.starts_with("http"))
                .unwrap_or_else(|| watch_url(&id));
            Some(CandidateItem {
                title: entry.title.unwrap_or_else(|| id.clone()),
                external_id: id,
                canonical_url,
            })
        })
        .collect())
}
