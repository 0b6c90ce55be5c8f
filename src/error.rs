#![forbid(unsafe_code)]

//! Failure taxonomy shared by every stage of the media pipeline.
//!
//! Each variant carries an operator-facing detail string that is logged but
//! never returned to clients; `public_message` is what the HTTP layer sends.

use axum::http::StatusCode;

pub type MediaResult<T> = Result<T, MediaError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    /// Missing parameters or a malformed provider id.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The catalog returned zero candidates.
    #[error("no candidates for {query:?}")]
    NotFound { query: String },

    /// The catalog provider itself failed (non-zero exit, bad JSON, timeout).
    #[error("catalog search failed: {0}")]
    SearchFailed(String),

    /// yt-dlp could not be downloaded, staged or marked executable.
    #[error("provisioning yt-dlp failed: {0}")]
    ProvisioningFailed(String),

    /// yt-dlp ran but did not yield a usable direct URL in time.
    #[error("media resolution failed: {0}")]
    ResolutionFailed(String),

    /// The direct URL refused the request or broke before streaming started.
    #[error("upstream stream error: {0}")]
    UpstreamStreamError(String),
}

impl MediaError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::SearchFailed(_)
            | Self::ProvisioningFailed(_)
            | Self::ResolutionFailed(_)
            | Self::UpstreamStreamError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short message safe to show to a browser. Subprocess output and
    /// upstream URLs stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidRequest(reason) => reason.clone(),
            Self::NotFound { .. } => "Song not found".to_string(),
            Self::SearchFailed(_) => "Failed to search".to_string(),
            Self::ProvisioningFailed(_) => "Media tool unavailable, try again".to_string(),
            Self::ResolutionFailed(_) => "Could not resolve a playable stream".to_string(),
            Self::UpstreamStreamError(_) => "Stream failed".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            MediaError::NotFound {
                query: "x".into()
            }
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            MediaError::InvalidRequest("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        for err in [
            MediaError::SearchFailed("a".into()),
            MediaError::ProvisioningFailed("b".into()),
            MediaError::ResolutionFailed("c".into()),
            MediaError::UpstreamStreamError("d".into()),
        ] {
            assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    #[test]
    fn public_message_hides_details() {
        let err = MediaError::ResolutionFailed("Traceback (most recent call last)".into());
        assert!(!err.public_message().contains("Traceback"));
        assert!(err.to_string().contains("Traceback"));
    }
}
