use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tastemakers-env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_URL: &str = "https://www.googleapis.com/youtube/v3/";
pub const DEFAULT_REGION: &str = "US";
pub const DEFAULT_API_RETRY_SECONDS: u64 = 10;

#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    pub database_path: Option<PathBuf>,
    pub api_key: Option<String>,
    pub api_key_file: Option<PathBuf>,
    pub api_url: Option<String>,
    pub region: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub api_retry_seconds: Option<u64>,
}

/// Fully resolved settings for the backend.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub api_key: String,
    pub api_url: String,
    pub region: String,
    pub host: String,
    pub port: u16,
    pub api_retry: Duration,
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value_raw)) = trimmed.split_once('=') else {
            continue;
        };
        let value = value_raw.trim().trim_matches('"');
        if value.is_empty() {
            continue;
        }
        match key.trim() {
            "DATABASE_PATH" => cfg.database_path = Some(PathBuf::from(value)),
            "YOUTUBE_API_KEY" => cfg.api_key = Some(value.to_string()),
            "YOUTUBE_API_KEY_FILE" => cfg.api_key_file = Some(PathBuf::from(value)),
            "YOUTUBE_API_URL" => cfg.api_url = Some(value.to_string()),
            "YOUTUBE_REGION" => cfg.region = Some(value.to_string()),
            "TASTEMAKERS_HOST" => cfg.host = Some(value.to_string()),
            "TASTEMAKERS_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing TASTEMAKERS_PORT from {}", path.display()))?;
                cfg.port = Some(port);
            }
            "API_RETRY_SECONDS" => {
                let seconds: u64 = value.parse().with_context(|| {
                    format!("Parsing API_RETRY_SECONDS from {}", path.display())
                })?;
                cfg.api_retry_seconds = Some(seconds);
            }
            _ => {}
        }
    }
    Ok(Some(cfg))
}

pub fn load_settings() -> Result<Settings> {
    load_settings_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_settings_from(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let cfg = read_env_config(path)?
        .ok_or_else(|| anyhow!("Missing config file at {}", path.display()))?;
    let database_path = cfg
        .database_path
        .ok_or_else(|| anyhow!("DATABASE_PATH not set in {}", path.display()))?;
    let api_key = match (cfg.api_key, cfg.api_key_file) {
        (Some(key), _) => key,
        (None, Some(key_file)) => fs::read_to_string(&key_file)
            .with_context(|| format!("Reading API key from {}", key_file.display()))?
            .trim()
            .to_string(),
        (None, None) => {
            return Err(anyhow!(
                "YOUTUBE_API_KEY or YOUTUBE_API_KEY_FILE must be set in {}",
                path.display()
            ));
        }
    };
    if api_key.is_empty() {
        return Err(anyhow!("YouTube API key from {} is empty", path.display()));
    }
    let api_url = cfg.api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string());
    Ok(Settings {
        database_path,
        api_key,
        api_url,
        region: cfg.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
        host: cfg.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: cfg.port.unwrap_or(DEFAULT_PORT),
        api_retry: Duration::from_secs(
            cfg.api_retry_seconds.unwrap_or(DEFAULT_API_RETRY_SECONDS),
        ),
    })
}
