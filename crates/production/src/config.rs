//! Replica configuration loaded from TOML.
//!
//! Every section is optional and falls back to its defaults. Example:
//!
//! ```toml
//! [node]
//! replica_id = 0
//! cluster_size = 4
//!
//! [storage]
//! snapshot_dir = "./data/snapshots"
//! log_dir = "./data/logs"
//!
//! [execution]
//! checkpoint_interval = 10000
//!
//! [recovery]
//! pending_log_ceiling = 100
//! duplicate_manifest = "ignore"
//! retransmit_interval_ms = 1000
//!
//! [checkpoint]
//! snapshot_chunk_size = 1048576
//! retained_checkpoints = 2
//!
//! [telemetry]
//! metrics_enabled = true
//! metrics_port = 9090
//! ```

use crate::checkpoint::CheckpointConfig;
use crate::recovery::{DuplicatePolicy, RecoveryConfig};
use crate::telemetry::TelemetryConfig;
use bulwark_execution::PipelineConfig;
use bulwark_types::{ReplicaId, DEFAULT_PENDING_LOG_CEILING};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level replica configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ReplicaConfig {
    /// Replica identity
    #[serde(default)]
    pub node: NodeConfig,

    /// Snapshot and log file locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Execution pipeline
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Recovery protocol
    #[serde(default)]
    pub recovery: RecoverySection,

    /// Checkpoint publication and release
    #[serde(default)]
    pub checkpoint: CheckpointSection,

    /// Logging and metrics
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Replica identity.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Index of this replica in the cluster
    #[serde(default)]
    pub replica_id: u32,

    /// Number of replicas (3f + 1)
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replica_id: 0,
            cluster_size: default_cluster_size(),
        }
    }
}

fn default_cluster_size() -> usize {
    4
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory for snapshot files
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Directory for log segment files
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./data/snapshots")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./data/logs")
}

/// Execution configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Batches between application snapshots
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
        }
    }
}

fn default_checkpoint_interval() -> u64 {
    10_000
}

/// Recovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySection {
    /// Queued log tokens beyond which an incremental load becomes a full one
    #[serde(default = "default_pending_log_ceiling")]
    pub pending_log_ceiling: usize,

    /// What to do with a manifest identical to the local one
    #[serde(default)]
    pub duplicate_manifest: DuplicatePolicy,

    /// How often unanswered fragment requests are sent again
    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            pending_log_ceiling: default_pending_log_ceiling(),
            duplicate_manifest: DuplicatePolicy::default(),
            retransmit_interval_ms: default_retransmit_interval_ms(),
        }
    }
}

fn default_retransmit_interval_ms() -> u64 {
    1000
}

fn default_pending_log_ceiling() -> usize {
    DEFAULT_PENDING_LOG_CEILING
}

/// Checkpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    /// Bytes of snapshot covered by one token
    #[serde(default = "default_snapshot_chunk_size")]
    pub snapshot_chunk_size: usize,

    /// Released manifests kept before the oldest is garbage-collected
    #[serde(default = "default_retained_checkpoints")]
    pub retained_checkpoints: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            snapshot_chunk_size: default_snapshot_chunk_size(),
            retained_checkpoints: default_retained_checkpoints(),
        }
    }
}

fn default_snapshot_chunk_size() -> usize {
    1024 * 1024
}

fn default_retained_checkpoints() -> usize {
    2
}

/// Telemetry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetrySection {
    /// Serve /metrics, /health and /ready
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Port for the metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name reported in logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            metrics_enabled: false,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_service_name() -> String {
    "bulwark-replica".to_string()
}

impl ReplicaConfig {
    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ReplicaConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.cluster_size == 0 {
            return Err(ConfigError::Invalid("cluster_size must be positive".into()));
        }
        if self.node.replica_id as usize >= self.node.cluster_size {
            return Err(ConfigError::Invalid(format!(
                "replica_id {} outside cluster of {}",
                self.node.replica_id, self.node.cluster_size
            )));
        }
        // Half the interval is the admission threshold; it must not be zero.
        if self.execution.checkpoint_interval < 2 {
            return Err(ConfigError::Invalid(format!(
                "checkpoint_interval {} must be at least 2",
                self.execution.checkpoint_interval
            )));
        }
        if self.checkpoint.snapshot_chunk_size == 0
            || self.checkpoint.snapshot_chunk_size > u32::MAX as usize
        {
            return Err(ConfigError::Invalid(format!(
                "snapshot_chunk_size {} out of range",
                self.checkpoint.snapshot_chunk_size
            )));
        }
        if self.recovery.retransmit_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "retransmit_interval_ms must be positive".into(),
            ));
        }
        if self.recovery.pending_log_ceiling == 0 {
            return Err(ConfigError::Invalid(
                "pending_log_ceiling must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId(self.node.replica_id)
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            checkpoint_interval: self.execution.checkpoint_interval,
        }
    }

    pub fn recovery(&self) -> RecoveryConfig {
        RecoveryConfig {
            checkpoint_interval: self.execution.checkpoint_interval,
            pending_log_ceiling: self.recovery.pending_log_ceiling,
            duplicate_policy: self.recovery.duplicate_manifest,
        }
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.recovery.retransmit_interval_ms)
    }

    pub fn checkpoint(&self) -> CheckpointConfig {
        CheckpointConfig {
            snapshot_chunk_size: self.checkpoint.snapshot_chunk_size,
            retained_checkpoints: self.checkpoint.retained_checkpoints,
        }
    }

    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            service_name: self.telemetry.service_name.clone(),
            prometheus_enabled: self.telemetry.metrics_enabled,
            prometheus_port: self.telemetry.metrics_port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ReplicaConfig::from_toml_str("").unwrap();
        assert_eq!(config.node.cluster_size, 4);
        assert_eq!(config.execution.checkpoint_interval, 10_000);
        assert_eq!(config.recovery.pending_log_ceiling, 100);
        assert_eq!(config.recovery.duplicate_manifest, DuplicatePolicy::Ignore);
        assert_eq!(config.recovery.retransmit_interval_ms, 1000);
        assert_eq!(config.checkpoint.snapshot_chunk_size, 1024 * 1024);
        assert_eq!(config.checkpoint.retained_checkpoints, 2);
        assert!(!config.telemetry.metrics_enabled);
    }

    #[test]
    fn test_full_config() {
        let config = ReplicaConfig::from_toml_str(
            r#"
            [node]
            replica_id = 2
            cluster_size = 7

            [storage]
            snapshot_dir = "/var/lib/bulwark/snap"
            log_dir = "/var/lib/bulwark/log"

            [execution]
            checkpoint_interval = 500

            [recovery]
            pending_log_ceiling = 10
            duplicate_manifest = "reject"
            retransmit_interval_ms = 250

            [checkpoint]
            snapshot_chunk_size = 4096
            retained_checkpoints = 3

            [telemetry]
            metrics_enabled = true
            metrics_port = 9100
            "#,
        )
        .unwrap();

        assert_eq!(config.replica_id(), ReplicaId(2));
        assert_eq!(config.storage.log_dir, PathBuf::from("/var/lib/bulwark/log"));
        assert_eq!(config.pipeline().checkpoint_interval, 500);
        assert_eq!(config.pipeline().admission_threshold(), 250);

        let recovery = config.recovery();
        assert_eq!(recovery.pending_log_ceiling, 10);
        assert_eq!(recovery.duplicate_policy, DuplicatePolicy::Reject);
        assert_eq!(config.retransmit_interval(), Duration::from_millis(250));
        assert_eq!(config.checkpoint().snapshot_chunk_size, 4096);
        assert!(config.telemetry().prometheus_enabled);
        assert_eq!(config.telemetry().prometheus_port, 9100);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            ReplicaConfig::from_toml_str("[node]\nreplica_id = 4\ncluster_size = 4"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ReplicaConfig::from_toml_str("[execution]\ncheckpoint_interval = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ReplicaConfig::from_toml_str("[execution]\ncheckpoint_interval = 1"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(ReplicaConfig::from_toml_str("[execution]\ncheckpoint_interval = 2").is_ok());
        assert!(matches!(
            ReplicaConfig::from_toml_str("[recovery]\nduplicate_manifest = \"explode\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("replica.toml");
        std::fs::write(&path, "[execution]\ncheckpoint_interval = 42\n").unwrap();
        let config = ReplicaConfig::load(&path).unwrap();
        assert_eq!(config.execution.checkpoint_interval, 42);

        assert!(matches!(
            ReplicaConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
