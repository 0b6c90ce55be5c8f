#![forbid(unsafe_code)]

//! Search → resolve → proxy, strictly in that order, once per request.
//! Nothing is retried; a failed request is retried by the client.

use std::sync::Arc;

use axum::{http::HeaderMap, response::Response};
use tracing::info;

use crate::{
    catalog::{CandidateItem, CatalogSearcher, MediaQuery, YtDlpSearch},
    config::RuntimeSettings,
    cookies::CookieJar,
    error::{MediaError, MediaResult},
    phase::{PhaseTracker, RequestPhase},
    provisioner::BinaryProvisioner,
    proxy::RangeProxy,
    resolver::{MediaResolver, ResolvedMedia, YtDlpResolver},
};

/// A catalog paired with the resolver that understands its candidates.
#[derive(Clone)]
pub struct MediaProvider {
    pub searcher: Arc<dyn CatalogSearcher>,
    pub resolver: Arc<dyn MediaResolver>,
}

impl MediaProvider {
    pub fn new(searcher: Arc<dyn CatalogSearcher>, resolver: Arc<dyn MediaResolver>) -> Self {
        Self { searcher, resolver }
    }

    /// YouTube through yt-dlp for both search and resolution.
    pub fn ytdlp(
        provisioner: Arc<BinaryProvisioner>,
        cookies: Arc<CookieJar>,
        settings: &RuntimeSettings,
    ) -> Self {
        Self::new(
            Arc::new(YtDlpSearch::new(
                Arc::clone(&provisioner),
                settings.user_agent.clone(),
                settings.resolve_timeout,
            )),
            Arc::new(YtDlpResolver::new(
                provisioner,
                cookies,
                settings.user_agent.clone(),
                settings.resolve_timeout,
            )),
        )
    }
}

pub struct MediaEngine {
    provider: MediaProvider,
    proxy: RangeProxy,
}

impl MediaEngine {
    pub fn new(provider: MediaProvider, proxy: RangeProxy) -> Self {
        Self { provider, proxy }
    }

    /// First candidate for text, or a direct candidate for a provider id.
    pub async fn locate(&self, query: &MediaQuery) -> MediaResult<CandidateItem> {
        match query {
            MediaQuery::ProviderId(id) => Ok(self.provider.searcher.candidate_for_id(id)),
            MediaQuery::Text(text) => self
                .provider
                .searcher
                .search(text)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| MediaError::NotFound {
                    query: text.clone(),
                }),
        }
    }

    pub async fn resolve(&self, query: &MediaQuery) -> MediaResult<ResolvedMedia> {
        let candidate = self.locate(query).await?;
        info!(
            id = %candidate.external_id,
            title = %candidate.title,
            "selected candidate"
        );
        self.provider.resolver.resolve(&candidate).await
    }

    /// Runs the whole pipeline. Errors are returned before any byte is
    /// written, so the caller answers with exactly one status.
    pub async fn play(&self, query: &MediaQuery, headers: &HeaderMap) -> MediaResult<Response> {
        let mut tracker = PhaseTracker::new();
        tracker.advance(RequestPhase::Resolving);
        let media = match self.resolve(query).await {
            Ok(media) => media,
            Err(err) => {
                tracker.fail(&err);
                return Err(err);
            }
        };
        self.proxy.proxy(headers, &media, tracker).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct ListSearcher {
        results: Vec<CandidateItem>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CatalogSearcher for ListSearcher {
        async fn search(&self, _query: &str) -> MediaResult<Vec<CandidateItem>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results.clone())
        }

        fn candidate_for_id(&self, id: &str) -> CandidateItem {
            item(id)
        }
    }

    struct RecordingResolver {
        url: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MediaResolver for RecordingResolver {
        async fn resolve(&self, candidate: &CandidateItem) -> MediaResult<ResolvedMedia> {
            self.seen.lock().push(candidate.external_id.clone());
            Ok(ResolvedMedia::new(self.url.clone()))
        }
    }

    fn item(id: &str) -> CandidateItem {
        CandidateItem {
            external_id: id.into(),
            title: format!("title {id}"),
            canonical_url: format!("https://www.youtube.com/watch?v={id}"),
        }
    }

    fn engine(results: Vec<CandidateItem>, url: &str) -> (MediaEngine, Arc<ListSearcher>, Arc<RecordingResolver>) {
        let searcher = Arc::new(ListSearcher {
            results,
            ..ListSearcher::default()
        });
        let resolver = Arc::new(RecordingResolver {
            url: url.into(),
            seen: Mutex::new(Vec::new()),
        });
        let engine = MediaEngine::new(
            MediaProvider::new(searcher.clone(), resolver.clone()),
            RangeProxy::new("UA".into(), 1_000).unwrap(),
        );
        (engine, searcher, resolver)
    }

    #[tokio::test]
    async fn first_candidate_wins() {
        let (engine, _, resolver) = engine(vec![item("cover"), item("original")], "http://unused");
        let media = engine
            .resolve(&MediaQuery::Text("shape of you audio".into()))
            .await
            .unwrap();
        assert_eq!(media.direct_url, "http://unused");
        assert_eq!(*resolver.seen.lock(), vec!["cover".to_string()]);
    }

    #[tokio::test]
    async fn empty_results_are_not_found() {
        let (engine, _, resolver) = engine(Vec::new(), "http://unused");
        let err = engine
            .resolve(&MediaQuery::Text("asdkfjhq934hrfq93".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert!(resolver.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn provider_id_bypasses_search() {
        let (engine, searcher, resolver) = engine(vec![item("other")], "http://unused");
        engine
            .resolve(&MediaQuery::ProviderId("JGwWNGJdvx8".into()))
            .await
            .unwrap();
        assert_eq!(searcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(*resolver.seen.lock(), vec!["JGwWNGJdvx8".to_string()]);
    }

    #[tokio::test]
    async fn play_streams_resolved_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "audio/mp4")
                    .set_body_bytes(vec![9u8; 64]),
            )
            .mount(&server)
            .await;

        let (engine, _, _) = engine(vec![item("hit")], &format!("{}/media", server.uri()));
        let response = engine
            .play(&MediaQuery::Text("anything".into()), &HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body.len(), 64);
    }
}
