use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::RoomDescriptor;

/// File read when no path is given explicitly.
pub const DEFAULT_CONFIG_FILE: &str = "livesync.conf";
/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "LIVESYNC_";

/// Resolved client configuration. Every field has a value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    pub api_base_url: String,
    pub socket_url: String,
    pub heartbeat_outgoing_ms: u64,
    pub heartbeat_incoming_ms: u64,
    pub liveness_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub default_room_capacity: usize,
    pub auth_token: Option<String>,
    pub log_dir: PathBuf,
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/".to_string(),
            socket_url: "ws://localhost:8080/chat-socket".to_string(),
            heartbeat_outgoing_ms: 4000,
            heartbeat_incoming_ms: 4000,
            liveness_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            reconnect_delay_ms: 5000,
            default_room_capacity: RoomDescriptor::MIN_CAPACITY,
            auth_token: None,
            log_dir: PathBuf::from("./logs"),
            log_level: "info".to_string(),
        }
    }
}

impl fmt::Display for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncConfig
    API: {},
    Socket: {},
    Heart-beat out/in: {}ms/{}ms,
    Liveness: {}ms, Handshake: {}ms, Reconnect: {}ms,
    Room capacity: {},
    Auth token: {},
    Logs: {} ({})
",
            self.api_base_url,
            self.socket_url,
            self.heartbeat_outgoing_ms,
            self.heartbeat_incoming_ms,
            self.liveness_timeout_ms,
            self.handshake_timeout_ms,
            self.reconnect_delay_ms,
            self.default_room_capacity,
            if self.auth_token.is_some() { "set" } else { "none" },
            self.log_dir.display(),
            self.log_level,
        )
    }
}

/// One configuration layer. `None` leaves the value below untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverlay {
    pub api_base_url: Option<String>,
    pub socket_url: Option<String>,
    pub heartbeat_outgoing_ms: Option<u64>,
    pub heartbeat_incoming_ms: Option<u64>,
    pub liveness_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub default_room_capacity: Option<usize>,
    pub auth_token: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    /// Only meaningful for the env and CLI layers.
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl ConfigOverlay {
    /// `other` wins wherever it has a value.
    pub fn merge(self, other: ConfigOverlay) -> ConfigOverlay {
        ConfigOverlay {
            api_base_url: other.api_base_url.or(self.api_base_url),
            socket_url: other.socket_url.or(self.socket_url),
            heartbeat_outgoing_ms: other.heartbeat_outgoing_ms.or(self.heartbeat_outgoing_ms),
            heartbeat_incoming_ms: other.heartbeat_incoming_ms.or(self.heartbeat_incoming_ms),
            liveness_timeout_ms: other.liveness_timeout_ms.or(self.liveness_timeout_ms),
            handshake_timeout_ms: other.handshake_timeout_ms.or(self.handshake_timeout_ms),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            default_room_capacity: other.default_room_capacity.or(self.default_room_capacity),
            auth_token: other.auth_token.or(self.auth_token),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            config_path: other.config_path.or(self.config_path),
        }
    }

    /// Reads a JSON config file. A missing file is not an error.
    pub fn from_file(path: &Path) -> Result<Option<ConfigOverlay>, ConfigError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found; using defaults and environment");
            return Ok(None);
        }
        let raw = fs::read_to_string(path)?;
        let overlay = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Some(overlay))
    }

    /// Reads `LIVESYNC_*` variables through `lookup`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<ConfigOverlay, ConfigError> {
        let text = |key: &str| lookup(&format!("{}{}", ENV_PREFIX, key)).filter(|v| !v.trim().is_empty());
        let number = |key: &str| -> Result<Option<u64>, ConfigError> {
            let name = format!("{}{}", ENV_PREFIX, key);
            match lookup(&name).filter(|v| !v.trim().is_empty()) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidEnvVar { name, value }),
            }
        };

        Ok(ConfigOverlay {
            api_base_url: text("API_BASE_URL"),
            socket_url: text("SOCKET_URL"),
            heartbeat_outgoing_ms: number("HEARTBEAT_OUTGOING_MS")?,
            heartbeat_incoming_ms: number("HEARTBEAT_INCOMING_MS")?,
            liveness_timeout_ms: number("LIVENESS_TIMEOUT_MS")?,
            handshake_timeout_ms: number("HANDSHAKE_TIMEOUT_MS")?,
            reconnect_delay_ms: number("RECONNECT_DELAY_MS")?,
            default_room_capacity: number("DEFAULT_ROOM_CAPACITY")?.map(|n| usize::try_from(n).unwrap_or(usize::MAX)),
            auth_token: text("AUTH_TOKEN"),
            log_dir: text("LOG_DIR").map(PathBuf::from),
            log_level: text("LOG_LEVEL"),
            config_path: text("CONFIG_PATH").map(PathBuf::from),
        })
    }

    /// Process environment, after loading a `.env` file if there is one.
    pub fn from_env() -> Result<ConfigOverlay, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env");
        }
        Self::from_vars(|name| std::env::var(name).ok())
    }
}

impl SyncConfig {
    /// Defaults, then the config file, then the environment, then `cli`.
    pub fn load(cli: ConfigOverlay) -> Result<SyncConfig, ConfigError> {
        let env = ConfigOverlay::from_env()?;
        Self::load_layers(env, cli)
    }

    /// Same as [`SyncConfig::load`] with the environment layer supplied.
    pub fn load_layers(env: ConfigOverlay, cli: ConfigOverlay) -> Result<SyncConfig, ConfigError> {
        let path = cli
            .config_path
            .clone()
            .or_else(|| env.config_path.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

        let file = ConfigOverlay::from_file(&path)?.unwrap_or_default();
        Self::default().apply(file.merge(env).merge(cli))
    }

    /// Applies an overlay on top of `self` and validates the result.
    pub fn apply(self, overlay: ConfigOverlay) -> Result<SyncConfig, ConfigError> {
        let config = SyncConfig {
            api_base_url: overlay.api_base_url.unwrap_or(self.api_base_url),
            socket_url: overlay.socket_url.unwrap_or(self.socket_url),
            heartbeat_outgoing_ms: overlay.heartbeat_outgoing_ms.unwrap_or(self.heartbeat_outgoing_ms),
            heartbeat_incoming_ms: overlay.heartbeat_incoming_ms.unwrap_or(self.heartbeat_incoming_ms),
            liveness_timeout_ms: overlay.liveness_timeout_ms.unwrap_or(self.liveness_timeout_ms),
            handshake_timeout_ms: overlay.handshake_timeout_ms.unwrap_or(self.handshake_timeout_ms),
            reconnect_delay_ms: overlay.reconnect_delay_ms.unwrap_or(self.reconnect_delay_ms),
            default_room_capacity: overlay.default_room_capacity.unwrap_or(self.default_room_capacity),
            auth_token: overlay.auth_token.or(self.auth_token),
            log_dir: overlay.log_dir.unwrap_or(self.log_dir),
            log_level: overlay.log_level.unwrap_or(self.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("apiBaseUrl", &self.api_base_url, &["http", "https"])?;
        check_url("socketUrl", &self.socket_url, &["ws", "wss"])?;

        for (name, value) in [
            ("livenessTimeoutMs", self.liveness_timeout_ms),
            ("handshakeTimeoutMs", self.handshake_timeout_ms),
            ("reconnectDelayMs", self.reconnect_delay_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", name)));
            }
        }

        let capacity = RoomDescriptor::MIN_CAPACITY..=RoomDescriptor::MAX_CAPACITY;
        if !capacity.contains(&self.default_room_capacity) {
            return Err(ConfigError::Invalid(format!(
                "defaultRoomCapacity {} is outside {}..={}",
                self.default_room_capacity,
                capacity.start(),
                capacity.end()
            )));
        }
        Ok(())
    }

    /// The configuration as flat `key -> value` pairs, token masked.
    pub fn options(&self) -> HashMap<String, String> {
        let mut options = HashMap::new();
        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(self) {
            for (key, value) in map {
                let shown = match (key.as_str(), value) {
                    ("authToken", serde_json::Value::String(_)) => "***".to_string(),
                    (_, serde_json::Value::String(s)) => s,
                    (_, other) => other.to_string(),
                };
                options.insert(key, shown);
            }
        }
        options
    }
}

fn check_url(name: &str, raw: &str, schemes: &[&str]) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::Invalid(format!("{} `{}`: {}", name, raw, e)))?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigError::Invalid(format!(
            "{} `{}` must use one of: {}",
            name,
            raw,
            schemes.join(", ")
        )));
    }
    Ok(())
}
