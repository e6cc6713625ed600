use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::push::ActorConfig;
use crate::session::{NUM_SESSIONS, SESSION_CHECK_INTERVAL, SESSION_TTL};

/// Server configuration, loaded from TOML. Every field has a default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Address to listen on (host:port).
    pub bind: String,
    /// Realm announced for Basic authentication.
    pub realm: String,
    pub sessions: SessionConfig,
    pub websocket: WebSocketConfig,
    pub ticker: TickerConfig,
    pub command: CommandConfig,
    /// Credentials accepted for login and Basic authentication.
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
    pub check_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    pub queue_capacity: usize,
    pub lock_timeout_ms: u64,
    /// Overflows that trigger a full resync; 0 disables it.
    pub resync_after: usize,
    pub max_clients: usize,
    /// Refuse WebSocket upgrades without a valid session cookie.
    pub require_session: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TickerConfig {
    pub update_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub queue_capacity: usize,
    /// Shell used to run commands. Falls back to `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            realm: "telemetry".to_string(),
            sessions: SessionConfig::default(),
            websocket: WebSocketConfig::default(),
            ticker: TickerConfig::default(),
            command: CommandConfig::default(),
            users: Vec::new(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: NUM_SESSIONS,
            ttl_secs: SESSION_TTL.as_secs(),
            check_interval_secs: SESSION_CHECK_INTERVAL.as_secs(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        let actor = ActorConfig::default();
        Self {
            queue_capacity: actor.queue_capacity,
            lock_timeout_ms: actor.lock_timeout.as_millis() as u64,
            resync_after: actor.resync_after,
            max_clients: 8,
            require_session: false,
        }
    }
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 20,
            shell: None,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl WebSocketConfig {
    pub fn actor_config(&self) -> ActorConfig {
        ActorConfig {
            queue_capacity: self.queue_capacity,
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            resync_after: self.resync_after,
        }
    }
}

impl TickerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms.max(1))
    }
}

impl WebConfig {
    /// Default config file location (`~/.config/telemetry-web/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("telemetry-web").join("config.toml"))
    }

    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// Checks file permissions and warns if world-readable.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        if !config.users.is_empty() {
            check_config_permissions(path);
        }
        config.validate()?;
        Ok(Some(config))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions.capacity == 0 {
            return Err(ConfigError::Invalid("sessions.capacity must be at least 1"));
        }
        if self.sessions.ttl_secs == 0 {
            return Err(ConfigError::Invalid("sessions.ttl_secs must be at least 1"));
        }
        if self.websocket.queue_capacity == 0 {
            return Err(ConfigError::Invalid("websocket.queue_capacity must be at least 1"));
        }
        if self.websocket.max_clients > crate::metrics::MAX_MODIFIERS {
            return Err(ConfigError::Invalid("websocket.max_clients must not exceed 64"));
        }
        Ok(())
    }
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Check file permissions on a config file and warn if world-readable.
#[cfg(unix)]
pub fn check_config_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return,
    };

    let mode = metadata.permissions().mode();
    if is_world_readable(mode) {
        tracing::warn!(
            "Config file {} is world-readable (mode {:o}). \
             It contains passwords -- consider restricting permissions to 600.",
            path.display(),
            mode & 0o7777,
        );
    }
}

#[cfg(not(unix))]
pub fn check_config_permissions(_path: &Path) {}

/// Returns true if the given file mode has the world-readable bit set.
pub fn is_world_readable(mode: u32) -> bool {
    mode & 0o004 != 0
}
