// Service configuration, read once at startup from the environment

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DOWNLOADS_DIR: &str = "./downloads";
pub const DEFAULT_YTDLP_RELEASE: &str = "2025.01.26";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub downloads_dir: PathBuf,
    /// Explicit yt-dlp executable, checked before any search
    pub ytdlp_path: Option<PathBuf>,
    /// Where a provisioned yt-dlp is installed
    pub ytdlp_bin_dir: PathBuf,
    pub ytdlp_release: String,
    pub proxy: Option<String>,
    pub cookies: Option<PathBuf>,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
    /// Limit on a stream backend producing its first byte
    pub first_byte_timeout_secs: u64,
    pub temp_cleanup_delay: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_var_string)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            host: lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: parse_or("PORT", &lookup, DEFAULT_PORT)?,
            downloads_dir: lookup("DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADS_DIR)),
            ytdlp_path: lookup("YTDLP_PATH").map(PathBuf::from),
            ytdlp_bin_dir: lookup("YTDLP_BIN_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(default_bin_dir),
            ytdlp_release: lookup("YTDLP_RELEASE").unwrap_or_else(|| DEFAULT_YTDLP_RELEASE.to_string()),
            proxy: lookup("YTDLP_PROXY"),
            cookies: lookup("YTDLP_COOKIES").map(PathBuf::from),
            metadata_timeout_secs: parse_or("METADATA_TIMEOUT_SECS", &lookup, 30)?,
            download_timeout_secs: parse_or("DOWNLOAD_TIMEOUT_SECS", &lookup, 1800)?,
            first_byte_timeout_secs: parse_or("FIRST_BYTE_TIMEOUT_SECS", &lookup, 60)?,
            temp_cleanup_delay: Duration::from_secs(parse_or("TEMP_CLEANUP_DELAY_SECS", &lookup, 5)?),
        })
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

fn parse_or<T>(key: &str, lookup: &impl Fn(&str) -> Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("{} has an invalid value: {:?}", key, value)),
        None => Ok(default),
    }
}

fn default_bin_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("youtube-downloader").join("bin"))
        .unwrap_or_else(|| PathBuf::from("./bin"))
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
