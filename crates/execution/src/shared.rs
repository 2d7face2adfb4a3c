//! Process-wide recovery state shared by execution and recovery.
//!
//! Every accessor takes the single mutex for the duration of one logical
//! operation. Readers get clones, never references into the guarded data.

use bulwark_types::{CheckpointManifest, CodecError, SeqNo, StateToken};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

/// Point-in-time view of the shared state, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryStatus {
    pub checkpoint_seq: u64,
    pub snapshot_tokens: usize,
    pub log_tokens: usize,
    pub highest_executed: u64,
    pub in_recovery: bool,
    pub sync_in_progress: Option<u64>,
    pub recovery_target: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    manifest: CheckpointManifest,
    highest_executed: SeqNo,
    in_recovery: bool,
    sync_in_progress: Option<SeqNo>,
    recovery_target: Option<SeqNo>,
}

/// The last adopted manifest, the highest executed sequence number and the
/// recovery/sync flags.
///
/// Outside recovery, `highest_executed >= manifest.checkpoint_seq()`.
#[derive(Debug, Default)]
pub struct SharedRecoveryState {
    inner: Mutex<Inner>,
}

impl SharedRecoveryState {
    pub fn new(manifest: CheckpointManifest, highest_executed: SeqNo) -> Self {
        Self {
            inner: Mutex::new(Inner {
                manifest,
                highest_executed,
                ..Default::default()
            }),
        }
    }

    pub fn manifest(&self) -> CheckpointManifest {
        self.inner.lock().manifest.clone()
    }

    pub fn highest_executed(&self) -> SeqNo {
        self.inner.lock().highest_executed
    }

    pub fn in_recovery(&self) -> bool {
        self.inner.lock().in_recovery
    }

    pub fn sync_in_progress(&self) -> Option<SeqNo> {
        self.inner.lock().sync_in_progress
    }

    pub fn status(&self) -> RecoveryStatus {
        let inner = self.inner.lock();
        RecoveryStatus {
            checkpoint_seq: inner.manifest.checkpoint_seq().0,
            snapshot_tokens: inner.manifest.snapshot_tokens().len(),
            log_tokens: inner.manifest.log_tokens().len(),
            highest_executed: inner.highest_executed.0,
            in_recovery: inner.in_recovery,
            sync_in_progress: inner.sync_in_progress.map(|s| s.0),
            recovery_target: inner.recovery_target.map(|s| s.0),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Execution side
    // ═══════════════════════════════════════════════════════════════════════

    /// Record that every batch up to `seq` has been applied.
    pub fn advance_executed(&self, seq: SeqNo) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.in_recovery || seq >= inner.manifest.checkpoint_seq(),
            "executed {seq} behind checkpoint {}",
            inner.manifest.checkpoint_seq()
        );
        inner.highest_executed = seq;
    }

    /// Append a newly durable log segment to the current manifest and return
    /// the updated manifest.
    pub fn append_log_token(&self, token: StateToken) -> Result<CheckpointManifest, CodecError> {
        let mut inner = self.inner.lock();
        inner.manifest.append_log_token(token)?;
        Ok(inner.manifest.clone())
    }

    /// The application was asked to snapshot the state after `seq`.
    pub fn start_sync(&self, seq: SeqNo) {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.sync_in_progress.replace(seq) {
            debug!(previous = previous.0, seq = seq.0, "Superseding unfinished sync");
        }
    }

    /// Clear the sync flag if it matches `seq`. Returns whether it did.
    pub fn finish_sync(&self, seq: SeqNo) -> bool {
        let mut inner = self.inner.lock();
        if inner.sync_in_progress == Some(seq) {
            inner.sync_in_progress = None;
            true
        } else {
            false
        }
    }

    /// Adopt a freshly published checkpoint: `snapshot_tokens` at `seq`, plus
    /// every current log token newer than `seq`.
    pub fn publish_checkpoint(
        &self,
        seq: SeqNo,
        snapshot_tokens: Vec<StateToken>,
    ) -> Result<CheckpointManifest, CodecError> {
        let mut inner = self.inner.lock();
        let logs = inner
            .manifest
            .log_tokens()
            .iter()
            .filter(|t| t.seq() > seq)
            .cloned()
            .collect();
        inner.manifest = CheckpointManifest::new(seq, snapshot_tokens, logs)?;
        Ok(inner.manifest.clone())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Recovery side
    // ═══════════════════════════════════════════════════════════════════════

    pub fn begin_recovery(&self, target: SeqNo) {
        let mut inner = self.inner.lock();
        inner.in_recovery = true;
        inner.recovery_target = Some(target);
    }

    pub fn end_recovery(&self) {
        let mut inner = self.inner.lock();
        inner.in_recovery = false;
        inner.recovery_target = None;
        debug_assert!(inner.highest_executed >= inner.manifest.checkpoint_seq());
    }

    /// Forget all local history ahead of a full load.
    pub fn reset_to_genesis(&self) {
        let mut inner = self.inner.lock();
        inner.manifest = CheckpointManifest::empty(SeqNo::GENESIS);
        inner.highest_executed = SeqNo::GENESIS;
        inner.sync_in_progress = None;
    }

    /// Replace the manifest wholesale after a snapshot load and rewind
    /// execution to its checkpoint.
    pub fn adopt_manifest(&self, manifest: CheckpointManifest) {
        let mut inner = self.inner.lock();
        info!(
            checkpoint = manifest.checkpoint_seq().0,
            previous = inner.manifest.checkpoint_seq().0,
            "Adopting manifest"
        );
        inner.highest_executed = manifest.checkpoint_seq();
        inner.manifest = manifest;
    }

    /// A replayed log segment: append its token and advance execution to it.
    pub fn record_replayed_log(&self, token: StateToken) -> Result<(), CodecError> {
        let mut inner = self.inner.lock();
        let seq = token.seq();
        inner.manifest.append_log_token(token)?;
        if seq > inner.highest_executed {
            inner.highest_executed = seq;
        }
        Ok(())
    }
}
