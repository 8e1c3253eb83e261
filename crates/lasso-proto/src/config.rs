use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub lastfm: LastFmConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub feed: FeedConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origin of the web UI allowed to call the API (CORS).  Empty allows any.
    #[serde(default)]
    pub allowed_origin: String,
}

/// Last.fm endpoint and application keys.  The user's session key is never
/// stored here; it comes from the environment (`LASSO_SESSION_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastFmConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    /// Seconds between poll cycles while a session is active.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Upper bound for any single fetch or submit.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum plays requested per fetch.
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Two plays of the same track closer than this are the same play.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_age_mins")]
    pub max_age_mins: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_capacity")]
    pub capacity: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tcp_port: default_tcp_port(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_http_enabled(),
            bind_address: default_bind_address(),
            port: default_port(),
            allowed_origin: String::new(),
        }
    }
}

impl Default for LastFmConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            fetch_limit: default_fetch_limit(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            tolerance_secs: default_tolerance_secs(),
            capacity: default_dedup_capacity(),
            max_age_mins: default_max_age_mins(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            capacity: default_feed_capacity(),
        }
    }
}

fn default_tcp_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_http_enabled() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_api_url() -> String {
    "https://ws.audioscrobbler.com/2.0/".to_string()
}

fn default_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_fetch_limit() -> u32 {
    50
}

fn default_tolerance_secs() -> u64 {
    60
}

fn default_dedup_capacity() -> usize {
    500
}

fn default_max_age_mins() -> u64 {
    120
}

fn default_feed_capacity() -> usize {
    50
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load from `path`, writing defaults there first if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save_to(path)?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
