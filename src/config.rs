#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_GROOVE_PORT: u16 = 3000;
pub const DEFAULT_GROOVE_HOST: &str = "127.0.0.1";
pub const DEFAULT_CHUNK_SIZE: u64 = 1_000_000;
pub const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 25;
pub const DEFAULT_YTDLP_DOWNLOAD_BASE: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download";
pub const DEFAULT_ITUNES_SEARCH_URL: &str = "https://itunes.apple.com/search";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Everything the engine reads from its host environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Writable (possibly ephemeral) storage for the yt-dlp binary and cookie jar.
    pub scratch_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Window size used when a client asks for an open-ended range.
    pub chunk_size: u64,
    pub resolve_timeout: Duration,
    /// Raw cookie payload, Netscape format or `base64:`-prefixed.
    pub cookies: Option<String>,
    /// Pre-installed yt-dlp; disables on-demand provisioning when set.
    pub ytdlp_bin: Option<PathBuf>,
    pub ytdlp_download_base: String,
    pub user_agent: String,
    pub itunes_search_url: String,
}

/// Values supplied on the command line. They beat both the process
/// environment and the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub scratch_dir: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub chunk_size: Option<u64>,
    pub resolve_timeout_secs: Option<u64>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeSettings {
    build_runtime_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let scratch_dir = overrides
        .scratch_dir
        .or_else(|| lookup("SCRATCH_DIR").map(PathBuf::from))
        .unwrap_or_else(env::temp_dir);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("GROOVE_HOST"))
        .unwrap_or_else(|| DEFAULT_GROOVE_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| {
            lookup("GROOVE_PORT")
                .or_else(|| lookup("PORT"))
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_GROOVE_PORT);
    let chunk_size = overrides
        .chunk_size
        .filter(|value| *value > 0)
        .or_else(|| lookup_positive("STREAM_CHUNK_SIZE", &lookup))
        .unwrap_or(DEFAULT_CHUNK_SIZE);
    let resolve_timeout_secs = overrides
        .resolve_timeout_secs
        .filter(|value| *value > 0)
        .or_else(|| lookup_positive("YTDLP_TIMEOUT_SECS", &lookup))
        .unwrap_or(DEFAULT_RESOLVE_TIMEOUT_SECS);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("YTDLP_BIN").map(PathBuf::from));
    let ytdlp_download_base = lookup("YTDLP_DOWNLOAD_BASE")
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_YTDLP_DOWNLOAD_BASE.to_string());

    RuntimeSettings {
        scratch_dir,
        host,
        port,
        chunk_size,
        resolve_timeout: Duration::from_secs(resolve_timeout_secs),
        cookies: lookup("YTDLP_COOKIES"),
        ytdlp_bin,
        ytdlp_download_base,
        user_agent: lookup("GROOVE_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
        itunes_search_url: lookup("ITUNES_SEARCH_URL")
            .unwrap_or_else(|| DEFAULT_ITUNES_SEARCH_URL.to_string()),
    }
}

fn lookup_positive(key: &str, lookup: &impl Fn(&str) -> Option<String>) -> Option<u64> {
    lookup(key)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None)
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = settings_from("");
        assert_eq!(settings.port, DEFAULT_GROOVE_PORT);
        assert_eq!(settings.host, DEFAULT_GROOVE_HOST);
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            settings.resolve_timeout,
            Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SECS)
        );
        assert_eq!(settings.scratch_dir, env::temp_dir());
        assert!(settings.cookies.is_none());
        assert!(settings.ytdlp_bin.is_none());
        assert_eq!(settings.ytdlp_download_base, DEFAULT_YTDLP_DOWNLOAD_BASE);
    }

    #[test]
    fn reads_scratch_dir_and_chunk_size() {
        let settings = settings_from("SCRATCH_DIR=\"/scratch\"\nSTREAM_CHUNK_SIZE=\"4096\"\n");
        assert_eq!(settings.scratch_dir, PathBuf::from("/scratch"));
        assert_eq!(settings.chunk_size, 4096);
    }

    #[test]
    fn zero_or_garbage_numbers_fall_back_to_defaults() {
        let settings = settings_from(
            "STREAM_CHUNK_SIZE=\"0\"\nYTDLP_TIMEOUT_SECS=\"soon\"\nGROOVE_PORT=\"nope\"\n",
        );
        assert_eq!(settings.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(
            settings.resolve_timeout,
            Duration::from_secs(DEFAULT_RESOLVE_TIMEOUT_SECS)
        );
        assert_eq!(settings.port, DEFAULT_GROOVE_PORT);
    }

    #[test]
    fn plain_port_is_used_when_groove_port_missing() {
        let settings = settings_from("PORT=\"8081\"\n");
        assert_eq!(settings.port, 8081);
        let settings = settings_from("PORT=\"8081\"\nGROOVE_PORT=\"9091\"\n");
        assert_eq!(settings.port, 9091);
    }

    #[test]
    fn download_base_drops_trailing_slash() {
        let settings = settings_from("YTDLP_DOWNLOAD_BASE=\"https://mirror.example/yt/\"\n");
        assert_eq!(settings.ytdlp_download_base, "https://mirror.example/yt");
    }

    #[test]
    fn env_beats_file() {
        let vars = read_env_file(make_config("SCRATCH_DIR=\"/file\"\n").path()).unwrap();
        let settings = build_runtime_settings(&vars, |key| {
            if key == "SCRATCH_DIR" {
                Some("/env".to_string())
            } else {
                None
            }
        });
        assert_eq!(settings.scratch_dir, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export SCRATCH_DIR="/scratch"
            YTDLP_COOKIES='base64:abc='
            GROOVE_HOST =  "0.0.0.0"
            GROOVE_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("SCRATCH_DIR").unwrap(), "/scratch");
        assert_eq!(vars.get("YTDLP_COOKIES").unwrap(), "base64:abc=");
        assert_eq!(vars.get("GROOVE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("GROOVE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn overrides_take_precedence() {
        let mut vars = HashMap::new();
        vars.insert("SCRATCH_DIR".to_string(), "/file-scratch".to_string());
        vars.insert("GROOVE_HOST".to_string(), "file-host".to_string());
        vars.insert("GROOVE_PORT".to_string(), "7000".to_string());
        vars.insert("STREAM_CHUNK_SIZE".to_string(), "10".to_string());

        let overrides = RuntimeOverrides {
            scratch_dir: Some(PathBuf::from("/override-scratch")),
            host: Some("override-host".into()),
            port: Some(9000),
            chunk_size: Some(2048),
            resolve_timeout_secs: Some(3),
            ytdlp_bin: Some(PathBuf::from("/opt/yt-dlp")),
            env_path: None,
        };

        let settings = build_runtime_settings_with_overrides(
            &vars,
            |key| {
                if key == "GROOVE_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(settings.scratch_dir, PathBuf::from("/override-scratch"));
        assert_eq!(settings.host, "override-host");
        assert_eq!(settings.port, 9000);
        assert_eq!(settings.chunk_size, 2048);
        assert_eq!(settings.resolve_timeout, Duration::from_secs(3));
        assert_eq!(settings.ytdlp_bin, Some(PathBuf::from("/opt/yt-dlp")));
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let settings = build_runtime_settings_with_overrides(
            &HashMap::new(),
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(settings.host, DEFAULT_GROOVE_HOST);
    }
}
