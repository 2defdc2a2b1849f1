//! Server configuration: TOML file, per-section defaults, environment
//! overrides for the knobs that differ per machine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse error at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub wal: WalConfig,
    pub apply: ApplyConfig,
    pub store: StoreConfig,
    pub archive: ArchiveConfig,
    pub snapshot: SnapshotConfig,
    pub registry: RegistryConfig,
    pub objstore: ObjStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root under which all local state lives unless overridden per
    /// section: stores, wal, dead-letter, object-store root.
    pub data_root: PathBuf,
    pub deadline_default_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./entdb-data"),
            deadline_default_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub filter: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            filter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WalBackendKind {
    /// Durable partitioned disk log (single-node stand-in for a broker
    /// cluster; same interface, same positions).
    Log,
    /// In-process, for tests and throwaway development.
    Memory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Fsync (quorum) before acknowledging.
    All,
    /// Acknowledge after the leader write; faster, weaker.
    Leader,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub backend: WalBackendKind,
    pub partitions: u32,
    pub acks: AckPolicy,
    /// Minimum in-sync replicas a broker deployment must satisfy;
    /// recorded here so the adapter and the operators agree.
    pub min_insync: u32,
    pub max_record_bytes: usize,
    pub batch_bytes: usize,
    pub batch_linger_ms: u64,
    pub segment_max_bytes: u64,
    pub dir: Option<PathBuf>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            backend: WalBackendKind::Log,
            partitions: 4,
            acks: AckPolicy::All,
            min_insync: 2,
            max_record_bytes: 1024 * 1024,
            batch_bytes: 64 * 1024,
            batch_linger_ms: 5,
            segment_max_bytes: 64 * 1024 * 1024,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// None = one worker per partition (auto).
    pub parallelism_per_node: Option<u32>,
    pub max_retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    pub deadletter_dir: Option<PathBuf>,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            parallelism_per_node: None,
            max_retry_backoff_ms: 5_000,
            poll_interval_ms: 100,
            deadletter_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub segment_bytes: usize,
    pub segment_seconds: u64,
    pub object_prefix: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 256 * 1024 * 1024,
            segment_seconds: 600,
            object_prefix: "archive".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub interval_hours: u64,
    pub retention_days: u64,
    pub object_prefix: String,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_hours: 6,
            retention_days: 30,
            object_prefix: "snapshots".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RegistryConfig {
    /// Path to the schema document (JSON) registered and frozen at
    /// startup.
    pub schema_module: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObjStoreConfig {
    /// Root of the filesystem object store; a bucket in deployments.
    pub root: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Config::default();
                config.apply_env_overrides();
                Ok(config)
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os("ENTDB_DATA_ROOT") {
            self.server.data_root = PathBuf::from(root);
        }
        if let Ok(filter) = std::env::var("ENTDB_LOG") {
            self.logging.filter = Some(filter);
        }
    }

    pub fn store_data_dir(&self) -> PathBuf {
        self.store
            .data_dir
            .clone()
            .unwrap_or_else(|| self.server.data_root.join("tenants"))
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.wal
            .dir
            .clone()
            .unwrap_or_else(|| self.server.data_root.join("wal"))
    }

    pub fn deadletter_dir(&self) -> PathBuf {
        self.apply
            .deadletter_dir
            .clone()
            .unwrap_or_else(|| self.server.data_root.join("deadletter"))
    }

    pub fn objstore_root(&self) -> PathBuf {
        self.objstore
            .root
            .clone()
            .unwrap_or_else(|| self.server.data_root.join("objects"))
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.server.deadline_default_ms)
    }
}
