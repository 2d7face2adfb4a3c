//! Ordering layer stand-in that records every signal from the core.

use bulwark_core::OrderingLayer;
use bulwark_types::{CheckpointManifest, ClientId, RequestInfo, SeqNo};
use parking_lot::Mutex;

/// One call into the ordering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderingSignal {
    Ready,
    AdmissionPause,
    AdmissionResume,
    Reply { info: RequestInfo, reply: Vec<u8> },
    ReadOnlyReply { client: ClientId, request_id: u64, reply: Vec<u8> },
    CheckpointReady { seq: SeqNo, manifest: Vec<u8> },
}

#[derive(Debug, Default)]
pub struct RecordingOrdering {
    signals: Mutex<Vec<OrderingSignal>>,
}

impl RecordingOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signals(&self) -> Vec<OrderingSignal> {
        self.signals.lock().clone()
    }

    pub fn ready_count(&self) -> usize {
        self.count(|s| matches!(s, OrderingSignal::Ready))
    }

    pub fn count(&self, f: impl Fn(&OrderingSignal) -> bool) -> usize {
        self.signals.lock().iter().filter(|s| f(s)).count()
    }

    /// Replies delivered for ordered requests, in delivery order.
    pub fn replies(&self) -> Vec<(RequestInfo, Vec<u8>)> {
        self.signals
            .lock()
            .iter()
            .filter_map(|s| match s {
                OrderingSignal::Reply { info, reply } => Some((*info, reply.clone())),
                _ => None,
            })
            .collect()
    }

    /// The most recent manifest announced at a snapshot checkpoint, i.e.
    /// one whose checkpoint number equals the announced sequence number.
    pub fn latest_checkpoint(&self) -> Option<CheckpointManifest> {
        self.signals.lock().iter().rev().find_map(|s| match s {
            OrderingSignal::CheckpointReady { seq, manifest } => CheckpointManifest::decode(manifest)
                .ok()
                .filter(|m| m.checkpoint_seq() == *seq),
            _ => None,
        })
    }

    /// Every announced manifest, log checkpoints included.
    pub fn announced(&self) -> Vec<(SeqNo, Vec<u8>)> {
        self.signals
            .lock()
            .iter()
            .filter_map(|s| match s {
                OrderingSignal::CheckpointReady { seq, manifest } => Some((*seq, manifest.clone())),
                _ => None,
            })
            .collect()
    }

    fn push(&self, signal: OrderingSignal) {
        self.signals.lock().push(signal);
    }
}

impl OrderingLayer for RecordingOrdering {
    fn ready_for_requests(&self) {
        self.push(OrderingSignal::Ready);
    }

    fn admission_pause(&self) {
        self.push(OrderingSignal::AdmissionPause);
    }

    fn admission_resume(&self) {
        self.push(OrderingSignal::AdmissionResume);
    }

    fn deliver_reply(&self, reply: Vec<u8>, info: RequestInfo) {
        self.push(OrderingSignal::Reply { info, reply });
    }

    fn read_only_reply(&self, client: ClientId, request_id: u64, reply: Vec<u8>) {
        self.push(OrderingSignal::ReadOnlyReply {
            client,
            request_id,
            reply,
        });
    }

    fn checkpoint_ready(&self, seq: SeqNo, manifest: Vec<u8>) {
        self.push(OrderingSignal::CheckpointReady { seq, manifest });
    }
}
