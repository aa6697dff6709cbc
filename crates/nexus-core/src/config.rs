use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8089;
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Wire-format revision of the `/v1/messages` passthrough contract (spec §3/§9).
pub const PROTOCOL_VERSION: u32 = 1;

/// Top-level config (`nexus.toml` + `NEXUS_*` env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NexusConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub linker: LinkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Hard per-request deadline in ms (default 11 minutes; spec §5).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    /// `UPSTREAM_TIMEOUT_MS` — total call timeout (default 10 minutes; spec §4.5).
    #[serde(default = "default_upstream_timeout_ms")]
    pub timeout_ms: u64,
    /// Time-to-first-byte timeout; strictly less than `timeout_ms`.
    #[serde(default = "default_upstream_ttfb_ms")]
    pub ttfb_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            timeout_ms: default_upstream_timeout_ms(),
            ttfb_timeout_ms: default_upstream_ttfb_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// `STORAGE_BATCH_SIZE` (default 50; spec §4.7).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// `STORAGE_FLUSH_MS` (default 100; spec §4.7).
    #[serde(default = "default_flush_ms")]
    pub flush_interval_ms: u64,
    /// Retry backoff for a failed flush: initial 100ms, cap 5s, max 5 attempts.
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_ms(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            retry_max_attempts: default_retry_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// `CREDENTIALS_DIR` — root directory holding `<domain>.credentials.json` files.
    #[serde(default = "default_credentials_dir")]
    pub dir: String,
    /// Refresh tokens whose expiry is within this many seconds of "now" (spec §4.2).
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: i64,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dir: default_credentials_dir(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// `TOKEN_WINDOW_MINUTES` (default 300 = 5 hours; spec §4.8).
    #[serde(default = "default_token_window_minutes")]
    pub window_minutes: i64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_token_window_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkerConfig {
    /// `TASK_CACHE_WINDOW_MS` (default 30000; spec §4.3 step 5).
    #[serde(default = "default_task_cache_window_ms")]
    pub task_cache_window_ms: i64,
    /// `TASK_CACHE_TTL_MS` (default 300000; spec §4.4).
    #[serde(default = "default_task_cache_ttl_ms")]
    pub task_cache_ttl_ms: i64,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            task_cache_window_ms: default_task_cache_window_ms(),
            task_cache_ttl_ms: default_task_cache_ttl_ms(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_request_timeout_ms() -> u64 {
    11 * 60 * 1000
}
fn default_upstream_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_upstream_timeout_ms() -> u64 {
    10 * 60 * 1000
}
fn default_upstream_ttfb_ms() -> u64 {
    60 * 1000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.nexus/nexus.db")
}
fn default_batch_size() -> usize {
    50
}
fn default_flush_ms() -> u64 {
    100
}
fn default_retry_initial_ms() -> u64 {
    100
}
fn default_retry_cap_ms() -> u64 {
    5000
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_credentials_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.nexus/credentials")
}
fn default_refresh_skew_secs() -> i64 {
    60
}
fn default_token_window_minutes() -> i64 {
    300
}
fn default_task_cache_window_ms() -> i64 {
    30_000
}
fn default_task_cache_ttl_ms() -> i64 {
    300_000
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.nexus/nexus.toml")
}

impl NexusConfig {
    /// Load config from a TOML file with `NEXUS_*` env var overrides, matching
    /// the figment layering the rest of the corpus uses.
    ///
    /// Falls back to `~/.nexus/nexus.toml` when no path is given; the file
    /// need not exist, since every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("NEXUS_").split("_"))
            .extract()
            .map_err(|e| crate::error::ProxyError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file_on_disk() {
        let config = NexusConfig::load(Some("/nonexistent/nexus.toml")).unwrap();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.storage.batch_size, 50);
        assert_eq!(config.tokens.window_minutes, 300);
    }

    #[test]
    fn env_override_wins_over_default() {
        std::env::set_var("NEXUS_SERVER_PORT", "9999");
        let config = NexusConfig::load(Some("/nonexistent/nexus.toml")).unwrap();
        assert_eq!(config.server.port, 9999);
        std::env::remove_var("NEXUS_SERVER_PORT");
    }
}
