use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const MESSAGE_QUEUE: &str = "message-processing";
pub const SCHEDULED_QUEUE: &str = "scheduled-messages";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub instagram: InstagramConfig,
    pub queue: QueueConfig,
    pub vault: VaultConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8092,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub sqlite_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            sqlite_path: "~/.dm-pilot/state.sqlite".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstagramConfig {
    pub graph_api_url: String,
    /// Shared secret for `x-hub-signature-256`. Unset means signatures cannot be checked.
    pub app_secret: Option<String>,
    pub verify_token: Option<String>,
    pub rate_limit_ms: u64,
    pub request_timeout_secs: u64,
    pub webhook_path: String,
}

impl Default for InstagramConfig {
    fn default() -> Self {
        Self {
            graph_api_url: "https://graph.instagram.com/v18.0".to_string(),
            app_secret: None,
            verify_token: None,
            rate_limit_ms: 1000,
            request_timeout_secs: 10,
            webhook_path: "/v1/instagram/webhook".to_string(),
        }
    }
}

/// Retry policy for one named queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: i64,
    pub backoff_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub message_workers: usize,
    pub scheduled_workers: usize,
    pub stall_timeout_secs: i64,
    pub message_retry: RetryPolicy,
    pub scheduled_retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            batch_size: 10,
            message_workers: 4,
            scheduled_workers: 2,
            stall_timeout_secs: 300,
            message_retry: RetryPolicy::default(),
            scheduled_retry: RetryPolicy {
                attempts: 3,
                backoff_ms: 2000,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub encryption_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            database: DatabaseConfig::default(),
            instagram: InstagramConfig::default(),
            queue: QueueConfig::default(),
            vault: VaultConfig::default(),
        }
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn resolve_config_path() -> PathBuf {
    env::var("DM_PILOT_CONFIG")
        .ok()
        .map(PathBuf::from)
        .unwrap_or_else(|| expand_tilde("~/.dm-pilot/dm-pilot.json"))
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn load_config() -> Config {
    let config_path = resolve_config_path();
    let mut cfg = Config::default();

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(file_cfg) => cfg = file_cfg,
                Err(err) => tracing::warn!(path = %config_path.display(), "ignoring malformed config: {err}"),
            },
            Err(err) => tracing::warn!(path = %config_path.display(), "cannot read config: {err}"),
        }
    }

    apply_env_overrides(&mut cfg);
    cfg
}

pub fn apply_env_overrides(cfg: &mut Config) {
    if let Some(token) = non_empty_env("DM_PILOT_TOKEN") {
        cfg.auth.token = Some(token);
    }
    if let Some(url) = non_empty_env("DM_PILOT_DATABASE_URL") {
        cfg.database.url = Some(url);
    }
    if let Some(path) = non_empty_env("DM_PILOT_SQLITE_PATH") {
        cfg.database.sqlite_path = path;
    }
    if let Some(secret) = non_empty_env("INSTAGRAM_APP_SECRET") {
        cfg.instagram.app_secret = Some(secret);
    }
    if let Some(token) = non_empty_env("INSTAGRAM_WEBHOOK_VERIFY_TOKEN") {
        cfg.instagram.verify_token = Some(token);
    }
    if let Some(key) = non_empty_env("DM_PILOT_ENCRYPTION_KEY") {
        cfg.vault.encryption_key = Some(key);
    }
}

pub fn resolve_database_url(cfg: &Config) -> String {
    if let Some(url) = cfg.database.url.as_ref() {
        return url.to_string();
    }

    let path = expand_tilde(&cfg.database.sqlite_path);
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    format!("sqlite://{}?mode=rwc", path.to_string_lossy())
}
