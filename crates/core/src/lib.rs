//! Collaborator interfaces for the Bulwark checkpoint core.
//!
//! This crate defines the seams between the core and the outside world:
//!
//! - [`Application`]: the replicated state machine
//! - [`DurableStorage`]: named byte ranges for snapshot and log files
//! - [`FragmentTransport`]: requests and replies for state fragments
//! - [`OrderingLayer`]: the consensus protocol that feeds ordered batches
//! - [`Event`]: every input the replica runner reacts to
//!
//! # Architecture
//!
//! ```text
//! OrderingLayer ──► Event ──► Replica ──► ExecutionPipeline ──► Application
//!                               │
//!                               └──► RecoveryCoordinator ──► FragmentTransport
//! ```
//!
//! Collaborators report asynchronous completions back as events through
//! [`ApplicationCallbacks`] or the replica handle.

mod error;
mod event;
mod traits;

pub use error::StorageError;
pub use event::Event;
pub use traits::{
    Application, ApplicationCallbacks, ApplicationError, DurableStorage, FragmentResponse,
    FragmentTransport, OrderingLayer,
};
