//! Configuration system for waypost.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $WAYPOST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/waypost/config.toml
//!   3. ~/.config/waypost/config.toml

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaypostConfig {
    pub server: ServerConfig,
    pub sessions: SessionsConfig,
    pub psk: PskConfig,
    pub stats: StatsConfig,
    pub discovery: DiscoveryConfig,
    pub sponsors: Vec<SponsorConfig>,
    pub upgrades: Vec<UpgradeConfig>,
    pub geo: GeoConfig,
    pub auth: AuthConfig,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the HTTP listener binds to.
    pub listen_addr: String,
    /// This server's public network address. Scope of the rotating PSK.
    pub ip_address: String,
    /// Hex secret every client request must present.
    pub web_server_secret: String,
    /// Request body cap, bytes.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub store: StoreBackend,
    pub sqlite_path: PathBuf,
    /// Idle window before an open fragment is flushed.
    pub fragment_ttl_secs: u64,
    /// Window left on a fragment after an explicit disconnect.
    pub disconnect_ttl_secs: u64,
    /// How often the expiry timer looks for due keys.
    pub sweep_interval_ms: u64,
    /// Lifetime of region data recorded at authentication.
    pub geo_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PskConfig {
    /// Random bytes per key (hex doubles the length on the wire).
    pub length_bytes: usize,
    /// Transport secrets file to rewrite on rotation. None = log only.
    pub secrets_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Append stats events here as JSON lines, in addition to the log.
    pub records_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub servers: Vec<ServerEntryConfig>,
}

/// One peer server handed out in handshake responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntryConfig {
    pub ip_address: String,
    pub web_server_port: u16,
    pub web_server_secret: String,
    pub certificate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorConfig {
    pub sponsor_id: String,
    #[serde(default)]
    pub home_pages: Vec<HomePageConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HomePageConfig {
    /// Region code, or "*" for every region without its own entry.
    pub region: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeConfig {
    pub propagation_channel_id: String,
    /// Latest client build published on this channel.
    pub client_version: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    /// Dotted IPv4 prefix → region code, e.g. "10.1." = "CA".
    pub prefixes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Only these users go through session-id extraction.
    pub user_prefix: String,
    /// User name → hex BLAKE3 digest of the password.
    pub users: BTreeMap<String, String>,
    /// Random bytes in a session id.
    pub session_id_bytes: usize,
    /// Random bytes in a tunnel password.
    pub password_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub path: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            ip_address: "127.0.0.1".to_string(),
            web_server_secret: String::new(),
            max_body_bytes: 64 * 1024,
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            store: StoreBackend::Memory,
            sqlite_path: data_dir().join("fragments.db"),
            fragment_ttl_secs: 15 * 60,
            disconnect_ttl_secs: 1,
            sweep_interval_ms: 500,
            geo_ttl_secs: 5 * 60,
        }
    }
}

impl Default for PskConfig {
    fn default() -> Self {
        Self {
            length_bytes: 16,
            secrets_path: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            user_prefix: "waypost".to_string(),
            users: BTreeMap::new(),
            session_id_bytes: 16,
            password_bytes: 32,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            path: data_dir().join("download"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("waypost")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("waypost")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid setting {0}: {1}")]
    Invalid(&'static str, String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl WaypostConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml(&path, &text)?
        } else {
            WaypostConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(path: &std::path::Path, text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("WAYPOST_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&WaypostConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.web_server_secret.is_empty()
            && !crate::validate::is_hex(&self.server.web_server_secret)
        {
            return Err(ConfigError::Invalid(
                "server.web_server_secret",
                "must be hex".to_string(),
            ));
        }
        if self.sessions.fragment_ttl_secs <= self.sessions.disconnect_ttl_secs {
            return Err(ConfigError::Invalid(
                "sessions.fragment_ttl_secs",
                "must exceed disconnect_ttl_secs".to_string(),
            ));
        }
        if self.sessions.sweep_interval_ms == 0 || self.sessions.geo_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "sessions",
                "sweep_interval_ms and geo_ttl_secs must be positive".to_string(),
            ));
        }
        if self.psk.length_bytes == 0 {
            return Err(ConfigError::Invalid(
                "psk.length_bytes",
                "must be positive".to_string(),
            ));
        }
        for entry in &self.discovery.servers {
            if !crate::validate::is_ipv4(&entry.ip_address) {
                return Err(ConfigError::Invalid(
                    "discovery.servers.ip_address",
                    entry.ip_address.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Apply WAYPOST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WAYPOST_SERVER__LISTEN_ADDR") {
            self.server.listen_addr = v;
        }
        if let Ok(v) = std::env::var("WAYPOST_SERVER__IP_ADDRESS") {
            self.server.ip_address = v;
        }
        if let Ok(v) = std::env::var("WAYPOST_SERVER__WEB_SERVER_SECRET") {
            self.server.web_server_secret = v;
        }
        if let Ok(v) = std::env::var("WAYPOST_SESSIONS__STORE") {
            match v.as_str() {
                "memory" => self.sessions.store = StoreBackend::Memory,
                "sqlite" => self.sessions.store = StoreBackend::Sqlite,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("WAYPOST_SESSIONS__SQLITE_PATH") {
            self.sessions.sqlite_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WAYPOST_SESSIONS__FRAGMENT_TTL_SECS") {
            if let Ok(ttl) = v.parse() {
                self.sessions.fragment_ttl_secs = ttl;
            }
        }
        if let Ok(v) = std::env::var("WAYPOST_STATS__RECORDS_PATH") {
            self.stats.records_path = Some(PathBuf::from(v));
        }
    }
}
