#![forbid(unsafe_code)]

//! HTTP front for the media engine.
//!
//! `/media` is the only route that touches YouTube: it searches, resolves a
//! direct URL with yt-dlp and proxies the bytes back honoring `Range`. The
//! remaining routes are iTunes metadata (search, home shelves, artist radio),
//! diagnostics and health.

use std::{
    fs,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use groove_stream::{
    catalog::MediaQuery,
    config::{RuntimeOverrides, RuntimeSettings, resolve_runtime_settings},
    cookies::CookieJar,
    error::MediaError,
    itunes::{DEFAULT_LIMIT, ItunesCatalog, Shelf, TrackSummary},
    pipeline::{MediaEngine, MediaProvider},
    provisioner::{BinaryDiagnostics, BinaryProvisioner},
    proxy::RangeProxy,
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,groove_stream=debug";

#[derive(Debug, Parser)]
#[command(name = "backend", version, about = "Streams music through a range-aware proxy")]
struct BackendArgs {
    /// Writable directory for the yt-dlp binary and cookie jar.
    #[arg(long, value_name = "DIR")]
    scratch_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Window served for open-ended `Range` requests.
    #[arg(long, value_name = "BYTES")]
    chunk_size: Option<u64>,
    #[arg(long, value_name = "SECS")]
    resolve_timeout: Option<u64>,
    /// Use an installed yt-dlp instead of downloading one.
    #[arg(long, value_name = "PATH")]
    ytdlp_bin: Option<PathBuf>,
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            scratch_dir: self.scratch_dir,
            host: self.host,
            port: self.port,
            chunk_size: self.chunk_size,
            resolve_timeout_secs: self.resolve_timeout,
            ytdlp_bin: self.ytdlp_bin,
            env_path: self.env_file,
        }
    }
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .trim()
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/GROOVE_HOST")
}

#[derive(Clone)]
struct AppState {
    engine: Arc<MediaEngine>,
    provisioner: Arc<BinaryProvisioner>,
    itunes: Arc<ItunesCatalog>,
}

impl AppState {
    fn from_settings(settings: &RuntimeSettings) -> Result<Self> {
        fs::create_dir_all(&settings.scratch_dir).with_context(|| {
            format!("creating scratch dir {}", settings.scratch_dir.display())
        })?;
        let provisioner = Arc::new(BinaryProvisioner::from_settings(settings));
        let cookies = Arc::new(
            CookieJar::new(&settings.scratch_dir, settings.cookies.as_deref())
                .context("loading YTDLP_COOKIES")?,
        );
        info!(cookies = cookies.is_configured(), "cookie jar loaded");
        let proxy = RangeProxy::new(settings.user_agent.clone(), settings.chunk_size)
            .context("building upstream client")?;
        let provider = MediaProvider::ytdlp(Arc::clone(&provisioner), cookies, settings);
        let itunes = ItunesCatalog::new(settings.itunes_search_url.clone())?;

        Ok(Self {
            engine: Arc::new(MediaEngine::new(provider, proxy)),
            provisioner,
            itunes: Arc::new(itunes),
        })
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// Creates a 400 error with the provided message.
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// Creates a 500 error with the provided message.
    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<MediaError> for ApiError {
    fn from(err: MediaError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            error!(error = %err, "media request failed");
        } else {
            info!(error = %err, "media request rejected");
        }
        Self {
            status,
            message: err.public_message(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let settings = resolve_runtime_settings(BackendArgs::parse().into_overrides())?;
    let host = parse_host_arg(&settings.host)?;
    let state = AppState::from_settings(&settings)?;
    info!(
        scratch = %settings.scratch_dir.display(),
        platform = state.provisioner.platform_key(),
        chunk_size = settings.chunk_size,
        "engine ready"
    );

    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/media", get(stream_media))
        .route("/api/song", get(stream_song))
        .route("/api/search", get(search_tracks))
        .route("/api/home", get(home_shelves))
        .route("/api/radio", get(artist_radio))
        .route("/api/version", get(version))
        .route("/api/debug", get(debug_binary))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

#[derive(Debug, Default, Deserialize)]
struct MediaParams {
    query: Option<String>,
    id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SongParams {
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RadioParams {
    artist: Option<String>,
}

async fn stream_media(
    State(state): State<AppState>,
    Query(params): Query<MediaParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let query = MediaQuery::from_params(params.query, params.id)?;
    play(&state, query, &headers).await
}

/// Older clients call `/api/song?name=`.
async fn stream_song(
    State(state): State<AppState>,
    Query(params): Query<SongParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let name = params
        .name
        .ok_or_else(|| ApiError::bad_request("Query 'name' is required"))?;
    play(&state, MediaQuery::text(name)?, &headers).await
}

async fn play(state: &AppState, query: MediaQuery, headers: &HeaderMap) -> ApiResult<Response> {
    let span = info_span!("media", %query);
    let response = state
        .engine
        .play(&query, headers)
        .instrument(span)
        .await?;
    Ok(response)
}

async fn search_tracks(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<TrackSummary>>> {
    let term = params
        .q
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::bad_request("Query 'q' is required"))?;
    let tracks = state
        .itunes
        .search(&term, None, DEFAULT_LIMIT)
        .await
        .map_err(|err| {
            error!(error = %format!("{err:#}"), "catalog search failed");
            ApiError::internal("Failed to search")
        })?;
    Ok(Json(tracks))
}

/// Shelves that failed to load are left out.
async fn home_shelves(State(state): State<AppState>) -> Json<Vec<Shelf>> {
    Json(state.itunes.home().await)
}

async fn artist_radio(
    State(state): State<AppState>,
    Query(params): Query<RadioParams>,
) -> ApiResult<Json<Vec<TrackSummary>>> {
    let artist = params
        .artist
        .map(|artist| artist.trim().to_string())
        .filter(|artist| !artist.is_empty())
        .ok_or_else(|| ApiError::bad_request("Query 'artist' is required"))?;
    let songs = state.itunes.radio(&artist).await.map_err(|err| {
        error!(error = %format!("{err:#}"), "radio lookup failed");
        ApiError::internal("Failed to generate radio")
    })?;
    Ok(Json(songs))
}

#[derive(Debug, Serialize, PartialEq)]
struct VersionInfo {
    version: &'static str,
    context: String,
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        context: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
    })
}

/// Never provisions; reports what is on disk.
async fn debug_binary(State(state): State<AppState>) -> Json<BinaryDiagnostics> {
    Json(state.provisioner.diagnostics().await)
}

async fn healthz() -> &'static str {
    "ok"
}
