//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Local cache settings.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Remote replica settings. Absent means no remote replication.
    #[serde(default)]
    pub remote: Option<RemoteConfig>,

    /// Identity provider settings.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Voice provider settings.
    #[serde(default)]
    pub voice: VoiceConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Local durable cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Path to the SQLite cache file.
    #[serde(default = "default_cache_path")]
    pub path: String,
}

/// Remote replica (Postgres-backed REST) configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the remote replica API.
    pub base_url: String,

    /// API key sent with every replica request.
    #[serde(default)]
    pub api_key: String,
}

/// Identity provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// Base URL of the identity provider API.
    #[serde(default = "default_identity_url")]
    pub base_url: String,

    /// Secret key for server-to-provider API calls.
    #[serde(default)]
    pub secret_key: String,

    /// Webhook signing secret (`whsec_...`).
    #[serde(default)]
    pub webhook_secret: String,
}

/// Voice provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceConfig {
    /// Base URL of the voice provider API.
    #[serde(default = "default_voice_url")]
    pub base_url: String,

    /// API key for configuration provisioning.
    #[serde(default)]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "murmur_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_cache_path() -> String {
    "murmur-cache.db".to_string()
}

fn default_identity_url() -> String {
    "https://api.clerk.com".to_string()
}

fn default_voice_url() -> String {
    "https://api.hume.ai".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            base_url: default_identity_url(),
            secret_key: String::new(),
            webhook_secret: String::new(),
        }
    }
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_voice_url(),
            api_key: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `MURMUR_HOST` overrides `server.host`
/// - `MURMUR_PORT` overrides `server.port`
/// - `MURMUR_CACHE_PATH` overrides `cache.path`
/// - `MURMUR_REMOTE_URL` / `MURMUR_REMOTE_API_KEY` override (or enable) the
///   remote replica
/// - `MURMUR_IDENTITY_SECRET` overrides `identity.secret_key`
/// - `MURMUR_WEBHOOK_SECRET` overrides `identity.webhook_secret`
/// - `MURMUR_VOICE_API_KEY` overrides `voice.api_key`
/// - `MURMUR_LOG_LEVEL` overrides `logging.level`
/// - `MURMUR_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("MURMUR_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("MURMUR_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(cache_path) = std::env::var("MURMUR_CACHE_PATH") {
        config.cache.path = cache_path;
    }
    if let Ok(remote_url) = std::env::var("MURMUR_REMOTE_URL") {
        let remote = config.remote.get_or_insert_with(|| RemoteConfig {
            base_url: String::new(),
            api_key: String::new(),
        });
        remote.base_url = remote_url;
    }
    if let Ok(remote_key) = std::env::var("MURMUR_REMOTE_API_KEY") {
        if let Some(remote) = config.remote.as_mut() {
            remote.api_key = remote_key;
        }
    }
    if let Ok(secret) = std::env::var("MURMUR_IDENTITY_SECRET") {
        config.identity.secret_key = secret;
    }
    if let Ok(secret) = std::env::var("MURMUR_WEBHOOK_SECRET") {
        config.identity.webhook_secret = secret;
    }
    if let Ok(key) = std::env::var("MURMUR_VOICE_API_KEY") {
        config.voice.api_key = key;
    }
    if let Ok(level) = std::env::var("MURMUR_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("MURMUR_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}
