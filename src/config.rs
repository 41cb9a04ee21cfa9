//! Settings for the feed location and the HTTP client, read from
//! `~/.config/blogfeed/config.toml`. Every key is optional.
use serde::Deserialize;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Default feed location.
pub const DEFAULT_FEED_URL: &str = "https://www.personalcapital.com/blog/feed/";

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The feed to load. Also used as the cache key for the item list.
    pub feed_url: String,

    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Read timeout in milliseconds, applied to each read of the response body.
    pub read_timeout_ms: u64,

    /// Largest response body accepted, for feeds and images alike.
    pub max_body_bytes: usize,

    /// Fail non-2xx responses with a network error instead of handing the
    /// body to the decoder.
    pub reject_error_status: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_url: DEFAULT_FEED_URL.to_string(),
            connect_timeout_ms: 15_000,
            read_timeout_ms: 15_000,
            max_body_bytes: 10 * 1024 * 1024,
            reject_error_status: false,
        }
    }
}

impl Config {
    /// Config files above 1 MiB are refused rather than parsed.
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KEYS: [&'static str; 5] = [
        "feed_url",
        "connect_timeout_ms",
        "read_timeout_ms",
        "max_body_bytes",
        "reject_error_status",
    ];

    /// Reads `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let Some(content) = read_capped(path, Self::MAX_FILE_SIZE)? else {
            tracing::debug!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        };
        let config = Self::from_toml(&content)?;
        tracing::info!(path = %path.display(), feed_url = %config.feed_url, "Loaded configuration");
        Ok(config)
    }

    /// Parses TOML text. Blank text gives the defaults; keys this crate does
    /// not know are reported and otherwise ignored.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let table: toml::Table = content.parse()?;
        for key in table.keys().filter(|key| !Self::KEYS.contains(&key.as_str())) {
            tracing::warn!(key = %key, "Unknown key in config file, ignoring");
        }
        Ok(toml::Value::Table(table).try_into()?)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Returns the file's text, `None` if it does not exist, or `TooLarge` once
/// more than `limit` bytes have been read.
fn read_capped(path: &Path, limit: u64) -> Result<Option<String>, ConfigError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut content = String::new();
    file.take(limit + 1).read_to_string(&mut content)?;
    if content.len() as u64 > limit {
        return Err(ConfigError::TooLarge(format!(
            "{} exceeds {limit} bytes",
            path.display()
        )));
    }
    Ok(Some(content))
}

// ============================================================================
// Tests
// ============================================================================
