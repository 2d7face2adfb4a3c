//! Execution layer for the Bulwark checkpoint core.
//!
//! This crate applies ordered batches to the application and keeps the
//! state that execution and recovery share:
//!
//! - [`SharedRecoveryState`]: last manifest, highest executed sequence
//!   number, recovery and sync flags
//! - [`apply_batch`]: the deterministic dispatch used by both live
//!   execution and log replay
//! - [`BatchLog`]: the execution log written at every log checkpoint
//! - [`ExecutionPipeline`]: the single worker that drains the job queue,
//!   with admission control and cooperative cancellation

mod dispatch;
mod log;
mod pipeline;
mod shared;

#[cfg(test)]
mod test_support;

pub use dispatch::apply_batch;
pub use log::{read_segment, BatchLog, SegmentError};
pub use pipeline::{
    AdmissionControl, ExecutionError, ExecutionPipeline, Job, PipelineConfig, PipelineContext,
    PipelineStats,
};
pub use shared::{RecoveryStatus, SharedRecoveryState};
