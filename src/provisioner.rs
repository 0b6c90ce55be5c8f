#![forbid(unsafe_code)]

//! Lazily provisions the yt-dlp executable into scratch storage.
//!
//! Serverless hosts may wipe `/tmp` between invocations, so every `ensure()`
//! re-checks that the file exists. When it is missing, exactly one download
//! runs at a time; concurrent callers await the same shared future. The
//! download is a spawned task that clears its own guard entry when it
//! settles, whatever the outcome and whether or not anyone is still waiting,
//! so a failed download is retried by the next request.

use std::{
    fs::{self, Metadata},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{
    config::RuntimeSettings,
    error::{MediaError, MediaResult},
    utility::run_utility,
};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// A yt-dlp executable known to exist at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryHandle {
    pub path: PathBuf,
    pub platform_key: String,
    pub is_executable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    pub os: &'static str,
    pub arch: &'static str,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS,
            arch: std::env::consts::ARCH,
        }
    }

    pub fn key(self) -> String {
        format!("{}-{}", self.os, self.arch)
    }

    /// Release asset published by yt-dlp for this platform.
    pub fn asset_name(self) -> Option<&'static str> {
        match (self.os, self.arch) {
            ("linux", "x86_64") => Some("yt-dlp_linux"),
            ("linux", "aarch64") => Some("yt-dlp_linux_aarch64"),
            ("linux", "arm") => Some("yt-dlp_linux_armv7l"),
            ("macos", _) => Some("yt-dlp_macos"),
            ("windows", "x86") => Some("yt-dlp_x86.exe"),
            ("windows", _) => Some("yt-dlp.exe"),
            _ => None,
        }
    }
}

/// Blocking download step. Split out so tests can count invocations.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64>;
}

pub struct HttpAssetFetcher {
    agent: ureq::Agent,
}

impl HttpAssetFetcher {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(DOWNLOAD_TIMEOUT)
                .build(),
        }
    }
}

impl Default for HttpAssetFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetFetcher for HttpAssetFetcher {
    fn fetch(&self, url: &str, dest: &mut dyn Write) -> Result<u64> {
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("requesting {url}"))?;
        let mut reader = response.into_reader();
        let copied = std::io::copy(&mut reader, dest).with_context(|| format!("reading {url}"))?;
        if copied == 0 {
            bail!("{url} returned an empty body");
        }
        Ok(copied)
    }
}

enum BinarySource {
    /// Operator supplied an existing executable; never downloaded.
    Pinned(PathBuf),
    Download { path: PathBuf, url: String },
    Unsupported,
}

type ProvisionFlight = Shared<BoxFuture<'static, Result<BinaryHandle, String>>>;

/// `generation` identifies the flight currently in `flight`, so a finished
/// download only clears its own entry.
#[derive(Default)]
struct FlightSlot {
    generation: u64,
    flight: Option<ProvisionFlight>,
}

pub struct BinaryProvisioner {
    source: BinarySource,
    platform_key: String,
    fetcher: Arc<dyn AssetFetcher>,
    inflight: Arc<Mutex<FlightSlot>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryDiagnostics {
    pub platform: String,
    pub binary_path: Option<String>,
    pub exists: bool,
    pub size: i64,
    pub version_output: Option<String>,
    pub version_error: Option<String>,
}

impl BinaryProvisioner {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        match &settings.ytdlp_bin {
            Some(path) => Self::pinned(path.clone()),
            None => Self::with_fetcher(
                &settings.scratch_dir,
                &settings.ytdlp_download_base,
                Platform::current(),
                Arc::new(HttpAssetFetcher::new()),
            ),
        }
    }

    pub fn with_fetcher(
        scratch_dir: &Path,
        download_base: &str,
        platform: Platform,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        let source = match platform.asset_name() {
            Some(asset) => BinarySource::Download {
                path: scratch_dir.join(asset),
                url: format!("{}/{asset}", download_base.trim_end_matches('/')),
            },
            None => BinarySource::Unsupported,
        };
        Self {
            source,
            platform_key: platform.key(),
            fetcher,
            inflight: Arc::default(),
        }
    }

    pub fn pinned(path: PathBuf) -> Self {
        Self {
            source: BinarySource::Pinned(path),
            platform_key: Platform::current().key(),
            fetcher: Arc::new(HttpAssetFetcher::new()),
            inflight: Arc::default(),
        }
    }

    pub fn platform_key(&self) -> &str {
        &self.platform_key
    }

    pub fn binary_path(&self) -> Option<&Path> {
        match &self.source {
            BinarySource::Pinned(path) | BinarySource::Download { path, .. } => Some(path),
            BinarySource::Unsupported => None,
        }
    }

    /// Existence check only; never downloads.
    pub fn current(&self) -> Option<BinaryHandle> {
        let path = self.binary_path()?;
        let metadata = fs::metadata(path).ok()?;
        if !metadata.is_file() {
            return None;
        }
        let is_executable = is_executable(&metadata);
        if !is_executable && matches!(self.source, BinarySource::Download { .. }) {
            return None;
        }
        Some(BinaryHandle {
            path: path.to_path_buf(),
            platform_key: self.platform_key.clone(),
            is_executable,
        })
    }

    pub async fn ensure(&self) -> MediaResult<BinaryHandle> {
        let (path, url) = match &self.source {
            BinarySource::Pinned(path) => {
                return self.current().ok_or_else(|| {
                    MediaError::ProvisioningFailed(format!(
                        "configured yt-dlp {} does not exist",
                        path.display()
                    ))
                });
            }
            BinarySource::Unsupported => {
                return Err(MediaError::ProvisioningFailed(format!(
                    "no yt-dlp build published for {}",
                    self.platform_key
                )));
            }
            BinarySource::Download { path, url } => (path, url),
        };

        if let Some(handle) = self.current() {
            return Ok(handle);
        }

        let flight = {
            let mut slot = self.inflight.lock();
            // A settled flight already cleared itself; never join one.
            let joinable = slot
                .flight
                .as_ref()
                .filter(|flight| flight.peek().is_none())
                .cloned();
            match joinable {
                Some(flight) => flight,
                None => {
                    // A flight may have finished between the check above and
                    // taking the lock.
                    if let Some(handle) = self.current() {
                        return Ok(handle);
                    }
                    slot.generation += 1;
                    let flight = self.start_download(slot.generation, path.clone(), url.clone());
                    slot.flight = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await.map_err(MediaError::ProvisioningFailed)
    }

    /// Spawns the download. The caller holds the slot lock while installing
    /// the returned flight, so the task cannot clear the slot before then.
    fn start_download(&self, generation: u64, path: PathBuf, url: String) -> ProvisionFlight {
        let fetcher = Arc::clone(&self.fetcher);
        let platform_key = self.platform_key.clone();
        let slot = Arc::clone(&self.inflight);
        let task = tokio::spawn(async move {
            info!(%url, path = %path.display(), "downloading yt-dlp");
            let staged_path = path.clone();
            let staged = tokio::task::spawn_blocking(move || {
                stage_download(fetcher.as_ref(), &url, &staged_path)
            })
            .await;
            let outcome = match staged {
                Ok(Ok(bytes)) => {
                    info!(bytes, path = %path.display(), "yt-dlp ready");
                    Ok(BinaryHandle {
                        path,
                        platform_key,
                        is_executable: true,
                    })
                }
                Ok(Err(err)) => {
                    warn!(error = %format!("{err:#}"), "yt-dlp download failed");
                    Err(format!("{err:#}"))
                }
                Err(err) => {
                    warn!(error = %err, "yt-dlp download task panicked");
                    Err(format!("download task failed: {err}"))
                }
            };
            {
                let mut slot = slot.lock();
                if slot.generation == generation {
                    slot.flight = None;
                }
            }
            outcome
        });
        async move {
            task.await
                .unwrap_or_else(|err| Err(format!("download task failed: {err}")))
        }
        .boxed()
        .shared()
    }

    /// Reports what is on disk right now plus `--version` output when possible.
    pub async fn diagnostics(&self) -> BinaryDiagnostics {
        let binary_path = self.binary_path().map(Path::to_path_buf);
        let size = binary_path
            .as_deref()
            .and_then(|path| fs::metadata(path).ok())
            .map(|metadata| i64::try_from(metadata.len()).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let mut diagnostics = BinaryDiagnostics {
            platform: self.platform_key.clone(),
            binary_path: binary_path
                .as_deref()
                .map(|path| path.display().to_string()),
            exists: size >= 0,
            size,
            version_output: None,
            version_error: None,
        };

        if let Some(handle) = self.current() {
            match run_utility(&handle.path, &["--version".to_string()], VERSION_TIMEOUT).await {
                Ok(output) if output.success => {
                    diagnostics.version_output = Some(output.stdout.trim().to_string());
                }
                Ok(output) => diagnostics.version_error = Some(format!("exited with {}", output.exit)),
                Err(err) => diagnostics.version_error = Some(err.to_string()),
            }
        }
        diagnostics
    }
}

/// Downloads into a sibling temp file, marks it executable, then renames it
/// into place so no caller ever observes a partial binary.
fn stage_download(fetcher: &dyn AssetFetcher, url: &str, path: &Path) -> Result<u64> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;

    let mut staged =
        NamedTempFile::new_in(parent).with_context(|| format!("staging in {}", parent.display()))?;
    let bytes = fetcher.fetch(url, staged.as_file_mut())?;
    staged.as_file_mut().flush()?;
    staged
        .as_file()
        .sync_all()
        .context("flushing staged binary")?;
    mark_executable(staged.path())?;
    staged
        .persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("moving binary into {}", path.display()))?;
    debug!(bytes, path = %path.display(), "binary persisted");
    Ok(bytes)
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("chmod 755 {}", path.display()))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(metadata: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;

    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &Metadata) -> bool {
    true
}
