//! Production replica: recovery, fragment exchange and checkpointing around
//! the execution pipeline.
//!
//! # Architecture
//!
//! A single task owns the [`Replica`] and receives every input as an
//! [`Event`](bulwark_core::Event) through an mpsc channel, so recovery and
//! checkpoint bookkeeping never contend on locks with each other.
//!
//! ```text
//! ReplicaHandle ──► Replica loop { event = recv(); handle(event) }
//!                        │
//!     ┌──────────────────┼─────────────────────┬───────────────────────┐
//!     ▼                  ▼                     ▼                       ▼
//! ExecutionPipeline  RecoveryCoordinator  FragmentFetchService  CheckpointPublisher
//! (worker task)      (in-loop)            (worker task)         (in-loop)
//!     │                  │                     │                       │
//!     └──────────────────┴──────── FileStorage ┴───────────────────────┘
//!                         snapshot_<seq> / log_<seq>
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bulwark_production::{FileStorage, FileStorageConfig, Replica, ReplicaConfig};
//! # use std::sync::Arc;
//! # async fn example(
//! #     app: Arc<dyn bulwark_core::Application>,
//! #     transport: Arc<dyn bulwark_core::FragmentTransport>,
//! #     ordering: Arc<dyn bulwark_core::OrderingLayer>,
//! # ) -> Result<(), Box<dyn std::error::Error>> {
//! let config = ReplicaConfig::load("replica.toml".as_ref())?;
//! let storage = FileStorage::open(FileStorageConfig::new(
//!     &config.storage.snapshot_dir,
//!     &config.storage.log_dir,
//! ))?;
//!
//! let mut replica = Replica::builder()
//!     .config(config)
//!     .app(app)
//!     .storage(Arc::new(storage))
//!     .transport(transport)
//!     .ordering(ordering)
//!     .build()?;
//! let handle = replica.handle();
//! let shutdown = replica.shutdown_handle();
//! tokio::spawn(replica.run());
//! # let _ = (handle, shutdown);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod config;
pub mod fetch;
pub mod metrics;
pub mod recovery;
mod replica;
mod storage;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use checkpoint::{tokenize_snapshot, CheckpointConfig, CheckpointError, CheckpointPublisher};
pub use config::{ConfigError, ReplicaConfig};
pub use fetch::{serve_fragment, FetchServiceStats, FragmentFetchService};
pub use recovery::{
    CoordinatorStatus, DuplicatePolicy, RecoveryConfig, RecoveryCoordinator, RecoveryError,
    RecoveryProgress,
};
pub use replica::{Replica, ReplicaBuilder, ReplicaError, ReplicaHandle, ShutdownHandle};
pub use storage::{FileStorage, FileStorageConfig};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryError, TelemetryGuard};
