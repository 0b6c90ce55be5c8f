#![forbid(unsafe_code)]

//! Streams a resolved media URL back to the client, honoring `Range`.
//!
//! Nothing is buffered: the upstream body is forwarded chunk by chunk. If
//! the client disconnects, the body stream is dropped along with the
//! upstream response, which closes the provider socket.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, stream};
use tracing::{debug, info};

use crate::{
    error::{MediaError, MediaResult},
    phase::{PhaseTracker, RequestPhase},
    range::{RangeWindow, range_header},
    resolver::{FALLBACK_AUDIO_FORMAT, ResolvedMedia},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RangeProxy {
    client: reqwest::Client,
    user_agent: String,
    chunk_size: u64,
}

impl RangeProxy {
    pub fn new(user_agent: String, chunk_size: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self::with_client(client, user_agent, chunk_size))
    }

    pub fn with_client(client: reqwest::Client, user_agent: String, chunk_size: u64) -> Self {
        Self {
            client,
            user_agent,
            chunk_size,
        }
    }

    /// Inclusive byte window to request upstream, if the client sent a
    /// usable `Range` header.
    pub fn upstream_window(&self, headers: &HeaderMap) -> Option<(u64, u64)> {
        headers
            .get(header::RANGE)
            .and_then(RangeWindow::parse)
            .map(|window| window.bounded(self.chunk_size))
    }

    /// Consumes the tracker: once the body is handed to the client the
    /// tracker rides along inside it.
    pub async fn proxy(
        &self,
        headers: &HeaderMap,
        media: &ResolvedMedia,
        mut tracker: PhaseTracker,
    ) -> MediaResult<Response> {
        let window = self.upstream_window(headers);
        let mut request = self
            .client
            .get(&media.direct_url)
            .header(header::USER_AGENT, &self.user_agent);
        if let Some((start, end)) = window {
            request = request.header(header::RANGE, range_header(start, end));
        }
        debug!(?window, "requesting upstream");

        let upstream = match request.send().await {
            Ok(upstream) => upstream,
            Err(err) => {
                let err = MediaError::UpstreamStreamError(format!("connecting upstream: {err}"));
                tracker.fail(&err);
                return Err(err);
            }
        };
        let status = upstream.status();
        info!(%status, ranged = window.is_some(), "upstream answered");

        if status == StatusCode::RANGE_NOT_SATISFIABLE && window.is_some() {
            tracker.advance(RequestPhase::Streaming);
            tracker.complete();
            return Ok(unsatisfiable(upstream.headers()));
        }
        if !status.is_success() {
            let err = MediaError::UpstreamStreamError(format!("upstream answered {status}"));
            tracker.fail(&err);
            return Err(err);
        }

        let partial = status == StatusCode::PARTIAL_CONTENT;
        let mut response_headers = HeaderMap::new();
        response_headers.insert(header::CONTENT_TYPE, content_type(upstream.headers(), media));
        response_headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        if let Some(length) = upstream.headers().get(header::CONTENT_LENGTH) {
            response_headers.insert(header::CONTENT_LENGTH, length.clone());
        }
        if partial {
            let content_range = upstream
                .headers()
                .get(header::CONTENT_RANGE)
                .cloned()
                .or_else(|| {
                    window.and_then(|(start, end)| {
                        HeaderValue::from_str(&format!("bytes {start}-{end}/*")).ok()
                    })
                });
            if let Some(content_range) = content_range {
                response_headers.insert(header::CONTENT_RANGE, content_range);
            }
        }

        tracker.advance(RequestPhase::Streaming);
        // The state goes to `None` after an error so the stream ends there.
        let body = stream::unfold(
            Some((upstream.bytes_stream(), tracker)),
            |state| async move {
                let (mut chunks, mut tracker) = state?;
                match chunks.next().await {
                    Some(Ok(bytes)) => {
                        tracker.record_bytes(bytes.len());
                        Some((Ok(bytes), Some((chunks, tracker))))
                    }
                    Some(Err(err)) => {
                        // Headers are already out; erroring the body aborts
                        // the connection instead of writing a new status.
                        tracker.fail(&err);
                        Some((Err(std::io::Error::other(err)), None))
                    }
                    None => {
                        tracker.complete();
                        None
                    }
                }
            },
        );

        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

fn unsatisfiable(upstream: &HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
    if let Some(content_range) = upstream.get(header::CONTENT_RANGE) {
        response
            .headers_mut()
            .insert(header::CONTENT_RANGE, content_range.clone());
    }
    response
        .headers_mut()
        .insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    response
}

/// Always `audio/*`: upstream's type when it already is one, the resolver's
/// guess otherwise.
fn content_type(upstream: &HeaderMap, media: &ResolvedMedia) -> HeaderValue {
    let upstream_type = upstream
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::trim);
    if let Some(value) = upstream_type
        && value.starts_with("audio/")
        && let Ok(value) = HeaderValue::from_str(value)
    {
        return value;
    }
    HeaderValue::from_str(&media.approximate_format)
        .ok()
        .filter(|_| media.approximate_format.starts_with("audio/"))
        .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_AUDIO_FORMAT))
}
