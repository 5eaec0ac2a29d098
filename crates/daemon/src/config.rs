// Daemon configuration file.
//
// Location: `~/.slotsync/config.toml`. Every section is optional; missing
// keys fall back to the built-in defaults.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::snapshot::{SNAPSHOT_INTERVAL_MINUTES, SNAPSHOT_INTERVAL_MUTATIONS};
use crate::store::vacuum::{
    DEFAULT_CLIENT_TTL, DEFAULT_KEEP_DELTAS, DEFAULT_KEEP_SNAPSHOTS, DEFAULT_MAX_DELTA_AGE,
};
use crate::store::{SnapshotPolicy, VacuumPolicy};
use crate::sync::GAP_THRESHOLD;

pub const DEFAULT_BIND: &str = "127.0.0.1:7878";
const DB_FILE_NAME: &str = "sync.db";

/// Root directory for slotsync state: `~/.slotsync/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".slotsync"))
}

/// Path to the config file: `~/.slotsync/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("config.toml"))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub snapshot: SnapshotConfig,
    pub vacuum: VacuumConfig,
}

impl DaemonConfig {
    /// Load from `~/.slotsync/config.toml`. A missing file yields defaults;
    /// a present but invalid file is an error.
    pub fn load() -> Result<Self, ConfigError> {
        match global_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        let config: Self = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, contents).map_err(ConfigError::Io)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;
        if self.vacuum.interval_secs == 0 {
            return Err(ConfigError::Invalid("vacuum.interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// `storage.db_path`, or `sync.db` under `base_dir`.
    pub fn db_path(&self, base_dir: &Path) -> PathBuf {
        self.storage.db_path.clone().unwrap_or_else(|| base_dir.join(DB_FILE_NAME))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Listen address for the WebSocket endpoint.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: DEFAULT_BIND.into() }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|error| ConfigError::Invalid(format!("server.bind `{}`: {error}", self.bind)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Database file; defaults to `~/.slotsync/sync.db`.
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Widest version gap answered with deltas instead of a snapshot.
    pub gap_threshold: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { gap_threshold: GAP_THRESHOLD }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotConfig {
    /// Versions between automatic snapshots (0 = time trigger only).
    pub interval_mutations: u64,
    pub interval_secs: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_mutations: SNAPSHOT_INTERVAL_MUTATIONS,
            interval_secs: SNAPSHOT_INTERVAL_MINUTES * 60,
        }
    }
}

impl SnapshotConfig {
    pub fn policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            interval_mutations: self.interval_mutations,
            interval: Duration::from_secs(self.interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct VacuumConfig {
    /// How often the vacuum task runs.
    pub interval_secs: u64,
    pub keep_deltas: u64,
    pub keep_snapshots: u64,
    pub max_delta_age_secs: u64,
    pub client_ttl_secs: u64,
}

impl Default for VacuumConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60 * 60,
            keep_deltas: DEFAULT_KEEP_DELTAS,
            keep_snapshots: DEFAULT_KEEP_SNAPSHOTS,
            max_delta_age_secs: DEFAULT_MAX_DELTA_AGE.as_secs(),
            client_ttl_secs: DEFAULT_CLIENT_TTL.as_secs(),
        }
    }
}

impl VacuumConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn policy(&self) -> VacuumPolicy {
        VacuumPolicy {
            keep_deltas: self.keep_deltas,
            keep_snapshots: self.keep_snapshots,
            max_delta_age: Duration::from_secs(self.max_delta_age_secs),
            client_ttl: Duration::from_secs(self.client_ttl_secs),
        }
    }
}

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {e}"),
            Self::Parse(e) => write!(f, "config parse error: {e}"),
            Self::Serialize(e) => write!(f, "config serialize error: {e}"),
            Self::Invalid(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
