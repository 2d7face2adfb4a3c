//! Event types for the replica loop.

use bulwark_types::{OrderedBatch, ReadOnlyRequest, ReplicaId, RequestInfo, SeqNo};

/// All possible inputs a replica reacts to.
///
/// Events are **passive data** - they describe something that happened.
#[derive(Debug, Clone)]
pub enum Event {
    // ═══════════════════════════════════════════════════════════════════════
    // Ordering Layer
    // ═══════════════════════════════════════════════════════════════════════
    /// The next batch in the total order.
    OrderedBatchSubmitted { batch: OrderedBatch },

    /// A request to run outside the total order.
    ReadOnlySubmitted { request: ReadOnlyRequest },

    /// Converge to the state described by an encoded manifest.
    ///
    /// A newer trigger supersedes any unfinished recovery.
    RecoveryTriggered { manifest: Vec<u8>, target: SeqNo },

    /// The ordering layer no longer needs this encoded manifest.
    CheckpointReleased { manifest: Vec<u8> },

    // ═══════════════════════════════════════════════════════════════════════
    // Transport
    // ═══════════════════════════════════════════════════════════════════════
    /// A peer answered one of our fragment requests.
    ///
    /// May be duplicated, reordered or stale.
    FragmentArrived { token: Vec<u8>, data: Vec<u8> },

    /// A peer asks for one of our fragments.
    FragmentRequested { from: ReplicaId, token: Vec<u8> },

    // ═══════════════════════════════════════════════════════════════════════
    // Application
    // ═══════════════════════════════════════════════════════════════════════
    /// An ordered command finished executing.
    ExecutionComplete { reply: Vec<u8>, info: RequestInfo },

    /// The application finished the snapshot for `seq`.
    SyncComplete { seq: SeqNo, file_name: String },

    // ═══════════════════════════════════════════════════════════════════════
    // Internal
    // ═══════════════════════════════════════════════════════════════════════
    /// The execution worker hit an unrecoverable error and stopped.
    PipelineFailed { reason: String },
}

impl Event {
    /// Get the event type name for telemetry.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::OrderedBatchSubmitted { .. } => "OrderedBatchSubmitted",
            Event::ReadOnlySubmitted { .. } => "ReadOnlySubmitted",
            Event::RecoveryTriggered { .. } => "RecoveryTriggered",
            Event::CheckpointReleased { .. } => "CheckpointReleased",
            Event::FragmentArrived { .. } => "FragmentArrived",
            Event::FragmentRequested { .. } => "FragmentRequested",
            Event::ExecutionComplete { .. } => "ExecutionComplete",
            Event::SyncComplete { .. } => "SyncComplete",
            Event::PipelineFailed { .. } => "PipelineFailed",
        }
    }

    /// Whether the event came from inside the replica.
    pub fn is_internal(&self) -> bool {
        matches!(self, Event::PipelineFailed { .. })
    }
}
