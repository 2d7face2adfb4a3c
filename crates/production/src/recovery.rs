//! Recovery coordinator: the load-checkpoint protocol.
//!
//! # Protocol
//!
//! ```text
//! trigger(manifest, target)
//!     │  diff against the local manifest (and any unfinished backlog)
//!     ├── up to date / duplicate ──────────────────────────────► Complete
//!     ├── incremental: queue the missing log segments
//!     └── full: forget local history, queue snapshot + every log segment
//!           │
//!           ▼  each fragment: local copy that validates? else request it
//! on_fragment(token, data)   (any order, duplicates, garbage)
//!     │  validate against the queued token's digest, persist, mark fetched
//!     ▼
//! try_progress
//!     ├── snapshot phase: all chunks fetched → load_snapshot, adopt manifest
//!     └── replay phase: strictly in queue order, each segment once fetched
//!                                                              ► Complete
//! ```
//!
//! The coordinator is synchronous and owned by the replica loop, so every
//! step is atomic with respect to other triggers. A newer trigger supersedes
//! an unfinished recovery: a full load discards all tracking, an incremental
//! one keeps the queued log segments and appends after them.
//!
//! Stopping and restarting the execution pipeline around a recovery is the
//! replica's job; the coordinator only ever applies batches while no
//! pipeline is running.

use crate::metrics;
use bulwark_core::{Application, ApplicationError, DurableStorage, FragmentTransport, StorageError};
use bulwark_execution::{
    apply_batch, read_segment, BatchLog, RecoveryStatus, SegmentError, SharedRecoveryState,
};
use bulwark_types::{CheckpointManifest, CodecError, ManifestDiff, SeqNo, StateToken, TokenKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Configuration and Errors
// ═══════════════════════════════════════════════════════════════════════════

/// What to do when the incoming manifest ends with the same log segment as
/// the local one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Treat it as a no-op recovery.
    #[default]
    Ignore,
    /// Report it as [`RecoveryError::DuplicateManifest`].
    Reject,
}

/// Configuration for the recovery coordinator.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Must match the execution pipeline so replay hits the same boundaries.
    pub checkpoint_interval: u64,
    /// Queued log segments beyond which an incremental load becomes full.
    pub pending_log_ceiling: usize,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10_000,
            pending_log_ceiling: bulwark_types::DEFAULT_PENDING_LOG_CEILING,
            duplicate_policy: DuplicatePolicy::Ignore,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("failed to decode recovery manifest: {0}")]
    ManifestDecode(#[source] CodecError),

    #[error("failed to persist recovered state: {0}")]
    Storage(#[from] StorageError),

    #[error("application failed to load snapshot {seq}: {source}")]
    SnapshotLoad {
        seq: SeqNo,
        #[source]
        source: ApplicationError,
    },

    #[error("failed to replay log segment: {0}")]
    LogReplay(#[from] SegmentError),

    #[error("recovered manifest is inconsistent: {0}")]
    ManifestUpdate(#[source] CodecError),

    #[error("manifest at checkpoint {checkpoint} duplicates local state")]
    DuplicateManifest { checkpoint: SeqNo },
}

impl RecoveryError {
    /// Whether the replica must stop. Only a rejected duplicate is benign.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RecoveryError::DuplicateManifest { .. })
    }
}

/// Where the coordinator stands after a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryProgress {
    /// No recovery is active.
    Idle,
    /// Waiting for fragments.
    InProgress,
    /// The replica has converged and may accept ordered work again.
    Complete,
}

// ═══════════════════════════════════════════════════════════════════════════
// Pending Fragments
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotPhase {
    /// Incremental load.
    NotNeeded,
    Fetching,
    Loaded,
}

/// Tracking for one active recovery.
#[derive(Debug)]
struct PendingFragmentSet {
    /// The manifest being converged to.
    incoming: CheckpointManifest,
    target: SeqNo,
    full_load: bool,
    snapshot: SnapshotPhase,
    /// Token as queued (with the digest arrivals are checked against) to
    /// whether it has been fetched.
    snapshot_tokens: HashMap<StateToken, bool>,
    log_tokens: HashMap<StateToken, bool>,
    /// Log segments still to replay, in replay order.
    replay: VecDeque<StateToken>,
    started: Instant,
}

impl PendingFragmentSet {
    fn new(incoming: CheckpointManifest, target: SeqNo, full_load: bool) -> Self {
        Self {
            incoming,
            target,
            full_load,
            snapshot: if full_load {
                SnapshotPhase::Fetching
            } else {
                SnapshotPhase::NotNeeded
            },
            snapshot_tokens: HashMap::new(),
            log_tokens: HashMap::new(),
            replay: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn tracking(&mut self, kind: TokenKind) -> &mut HashMap<StateToken, bool> {
        match kind {
            TokenKind::Snapshot => &mut self.snapshot_tokens,
            TokenKind::LogSegment => &mut self.log_tokens,
        }
    }

    fn backlog(&self) -> Vec<StateToken> {
        self.replay.iter().cloned().collect()
    }

    fn snapshot_outstanding(&self) -> usize {
        self.snapshot_tokens.values().filter(|f| !**f).count()
    }

    fn logs_outstanding(&self) -> usize {
        self.log_tokens.values().filter(|f| !**f).count()
    }
}

/// Serializable view of the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub active: bool,
    pub target: Option<u64>,
    pub incoming_checkpoint: Option<u64>,
    pub full_load: bool,
    pub snapshot_fragments_outstanding: usize,
    pub log_segments_outstanding: usize,
    pub log_segments_to_replay: usize,
    pub shared: RecoveryStatus,
}

// ═══════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════

pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    app: Arc<dyn Application>,
    storage: Arc<dyn DurableStorage>,
    transport: Arc<dyn FragmentTransport>,
    shared: Arc<SharedRecoveryState>,
    log: Arc<Mutex<BatchLog>>,
    pending: Option<PendingFragmentSet>,
}

impl RecoveryCoordinator {
    pub fn new(
        config: RecoveryConfig,
        app: Arc<dyn Application>,
        storage: Arc<dyn DurableStorage>,
        transport: Arc<dyn FragmentTransport>,
        shared: Arc<SharedRecoveryState>,
        log: Arc<Mutex<BatchLog>>,
    ) -> Self {
        Self {
            config,
            app,
            storage,
            transport,
            shared,
            log,
            pending: None,
        }
    }

    /// Whether a recovery is waiting on fragments.
    pub fn is_active(&self) -> bool {
        self.pending.is_some()
    }

    pub fn status(&self) -> CoordinatorStatus {
        let pending = self.pending.as_ref();
        CoordinatorStatus {
            active: pending.is_some(),
            target: pending.map(|p| p.target.0),
            incoming_checkpoint: pending.map(|p| p.incoming.checkpoint_seq().0),
            full_load: pending.is_some_and(|p| p.full_load),
            snapshot_fragments_outstanding: pending.map_or(0, |p| p.snapshot_outstanding()),
            log_segments_outstanding: pending.map_or(0, |p| p.logs_outstanding()),
            log_segments_to_replay: pending.map_or(0, |p| p.replay.len()),
            shared: self.shared.status(),
        }
    }

    /// Start converging to `manifest`, superseding any unfinished recovery.
    ///
    /// The execution pipeline must already be stopped.
    pub fn trigger(
        &mut self,
        manifest: &[u8],
        target: SeqNo,
    ) -> Result<RecoveryProgress, RecoveryError> {
        let incoming = CheckpointManifest::decode(manifest).map_err(RecoveryError::ManifestDecode)?;
        self.shared.begin_recovery(target);

        let local = self.shared.manifest();
        // An unfinished snapshot load leaves no local base to splice onto.
        let base_lost = self
            .pending
            .as_ref()
            .is_some_and(|p| p.snapshot == SnapshotPhase::Fetching);
        let backlog = self
            .pending
            .as_ref()
            .map(PendingFragmentSet::backlog)
            .unwrap_or_default();
        let diff = if base_lost {
            ManifestDiff::Full
        } else {
            local.diff_with_backlog(&incoming, &backlog, self.config.pending_log_ceiling)
        };

        info!(
            target = target.0,
            incoming = %incoming,
            local = %local,
            backlog = backlog.len(),
            diff = diff.as_str(),
            "Recovery triggered"
        );

        match diff {
            ManifestDiff::Duplicate => self.on_duplicate(&incoming),
            ManifestDiff::UpToDate => {
                if let Some(stale) = self.pending.take() {
                    debug!(target = stale.target.0, "Dropping superseded recovery");
                }
                Ok(self.complete(None))
            }
            ManifestDiff::Incremental(tokens) => {
                self.start_incremental(incoming, target, tokens);
                self.try_progress()
            }
            ManifestDiff::Full => {
                self.start_full(incoming, target);
                self.try_progress()
            }
        }
    }

    fn on_duplicate(
        &mut self,
        incoming: &CheckpointManifest,
    ) -> Result<RecoveryProgress, RecoveryError> {
        match self.config.duplicate_policy {
            DuplicatePolicy::Reject => {
                if self.pending.is_none() {
                    self.shared.end_recovery();
                }
                Err(RecoveryError::DuplicateManifest {
                    checkpoint: incoming.checkpoint_seq(),
                })
            }
            DuplicatePolicy::Ignore if self.pending.is_some() => {
                debug!("Duplicate manifest, continuing current recovery");
                Ok(RecoveryProgress::InProgress)
            }
            DuplicatePolicy::Ignore => {
                debug!("Duplicate manifest, nothing to load");
                Ok(self.complete(None))
            }
        }
    }

    fn start_full(&mut self, incoming: CheckpointManifest, target: SeqNo) {
        metrics::record_recovery_started("full");
        self.log.lock().clear();
        self.shared.reset_to_genesis();

        let mut pending = PendingFragmentSet::new(incoming.clone(), target, true);
        for token in incoming.snapshot_tokens() {
            let fetched = self.fetch_or_request(token);
            pending.snapshot_tokens.insert(token.clone(), fetched);
        }
        for token in incoming.log_tokens() {
            let fetched = self.fetch_or_request(token);
            pending.log_tokens.insert(token.clone(), fetched);
            pending.replay.push_back(token.clone());
        }
        info!(
            checkpoint = incoming.checkpoint_seq().0,
            snapshot = pending.snapshot_tokens.len(),
            snapshot_outstanding = pending.snapshot_outstanding(),
            logs = pending.replay.len(),
            logs_outstanding = pending.logs_outstanding(),
            "Full load started"
        );
        self.pending = Some(pending);
    }

    fn start_incremental(
        &mut self,
        incoming: CheckpointManifest,
        target: SeqNo,
        tokens: Vec<StateToken>,
    ) {
        metrics::record_recovery_started("incremental");
        self.log.lock().clear();

        let mut pending = match self.pending.take() {
            Some(mut previous) => {
                debug!(
                    previous_target = previous.target.0,
                    backlog = previous.replay.len(),
                    "Extending superseded recovery"
                );
                previous.incoming = incoming;
                previous.target = target;
                previous
            }
            None => PendingFragmentSet::new(incoming, target, false),
        };

        for token in tokens {
            if pending.log_tokens.contains_key(&token) {
                continue;
            }
            let fetched = self.fetch_or_request(&token);
            pending.log_tokens.insert(token.clone(), fetched);
            pending.replay.push_back(token);
        }
        info!(
            logs = pending.replay.len(),
            logs_outstanding = pending.logs_outstanding(),
            "Incremental load started"
        );
        self.pending = Some(pending);
    }

    /// Check local storage for an exact, valid copy; request it otherwise.
    /// Returns whether the fragment is already fetched.
    fn fetch_or_request(&self, token: &StateToken) -> bool {
        let local = self.storage.read_range(
            token.kind(),
            &token.file_name(),
            token.offset(),
            token.length(),
        );
        match local {
            Ok(Some(data)) if token.validate(&data) => {
                trace!(%token, "Fragment available locally");
                metrics::record_fragment_local_hit();
                return true;
            }
            Ok(_) => {}
            // Reads may race with writers; a failed check is just a miss.
            Err(e) => debug!(%token, error = %e, "Local fragment check failed"),
        }

        trace!(%token, "Requesting fragment");
        metrics::record_fragment_requested();
        self.transport.request_fragment(token.encode());
        false
    }

    /// Ask peers again for every fragment not yet fetched. Returns how many
    /// requests went out.
    pub fn request_outstanding(&self) -> usize {
        let Some(pending) = &self.pending else {
            return 0;
        };
        let mut sent = 0;
        for (token, _) in pending
            .snapshot_tokens
            .iter()
            .chain(pending.log_tokens.iter())
            .filter(|(_, fetched)| !**fetched)
        {
            metrics::record_fragment_requested();
            self.transport.request_fragment(token.encode());
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, target = pending.target.0, "Re-requested outstanding fragments");
        }
        sent
    }

    /// Handle a fragment returned by a peer.
    ///
    /// Invalid, unknown and repeated fragments are dropped. Only a failure
    /// to persist or apply state is an error.
    pub fn on_fragment(
        &mut self,
        token_bytes: &[u8],
        data: &[u8],
    ) -> Result<RecoveryProgress, RecoveryError> {
        let Some(pending) = self.pending.as_mut() else {
            trace!("Fragment arrived with no recovery active");
            metrics::record_fragment_rejected("unknown");
            return Ok(RecoveryProgress::Idle);
        };

        let arrived = match StateToken::decode(token_bytes) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Dropping fragment with undecodable token");
                metrics::record_fragment_rejected("undecodable");
                return Ok(RecoveryProgress::InProgress);
            }
        };

        let queued = match pending.tracking(arrived.kind()).get_key_value(&arrived) {
            None => {
                debug!(token = %arrived, "Dropping fragment not part of this recovery");
                metrics::record_fragment_rejected("unknown");
                return Ok(RecoveryProgress::InProgress);
            }
            Some((_, &true)) => {
                trace!(token = %arrived, "Dropping already fetched fragment");
                metrics::record_fragment_rejected("already_fetched");
                return Ok(RecoveryProgress::InProgress);
            }
            Some((queued, &false)) => queued.clone(),
        };

        if !queued.validate(data) {
            debug!(token = %queued, len = data.len(), "Dropping fragment that fails validation");
            metrics::record_fragment_rejected("digest_mismatch");
            return Ok(RecoveryProgress::InProgress);
        }

        persist_fragment(self.storage.as_ref(), &queued, data)?;
        pending.tracking(queued.kind()).insert(queued.clone(), true);
        metrics::record_fragment_received();
        debug!(token = %queued, "Fragment fetched");

        self.try_progress()
    }

    /// Load the snapshot and replay whatever has become eligible.
    pub fn try_progress(&mut self) -> Result<RecoveryProgress, RecoveryError> {
        let Some(mut pending) = self.pending.take() else {
            return Ok(RecoveryProgress::Idle);
        };
        match self.advance(&mut pending) {
            Ok(true) => Ok(self.complete(Some(pending.started))),
            Ok(false) => {
                self.pending = Some(pending);
                Ok(RecoveryProgress::InProgress)
            }
            Err(e) => {
                self.pending = Some(pending);
                Err(e)
            }
        }
    }

    /// Returns whether both phases are exhausted.
    fn advance(&self, pending: &mut PendingFragmentSet) -> Result<bool, RecoveryError> {
        if pending.snapshot == SnapshotPhase::Fetching {
            if pending.snapshot_outstanding() > 0 {
                return Ok(false);
            }
            load_snapshot(
                self.app.as_ref(),
                self.storage.as_ref(),
                &self.shared,
                &pending.incoming,
            )?;
            pending.snapshot = SnapshotPhase::Loaded;
        }

        while let Some(next) = pending.replay.front() {
            if pending.log_tokens.get(next) != Some(&true) {
                trace!(token = %next, "Waiting for next log segment");
                return Ok(false);
            }
            if let Some(token) = pending.replay.pop_front() {
                self.replay_segment(token)?;
            }
        }
        Ok(true)
    }

    fn replay_segment(&self, token: StateToken) -> Result<(), RecoveryError> {
        let batches = read_segment(self.storage.as_ref(), &token)?;
        let mut replayed = 0;
        for batch in &batches {
            if batch.seq <= self.shared.highest_executed() {
                continue;
            }
            apply_batch(
                self.app.as_ref(),
                &self.shared,
                batch,
                self.config.checkpoint_interval,
            );
            replayed += 1;
        }
        self.shared
            .record_replayed_log(token.clone())
            .map_err(RecoveryError::ManifestUpdate)?;
        metrics::record_batches_replayed(replayed);
        debug!(
            %token,
            batches = batches.len(),
            replayed,
            highest_executed = self.shared.highest_executed().0,
            "Replayed log segment"
        );
        Ok(())
    }

    fn complete(&mut self, started: Option<Instant>) -> RecoveryProgress {
        self.shared.end_recovery();
        let elapsed = started.map(|s| s.elapsed().as_secs_f64()).unwrap_or(0.0);
        metrics::record_recovery_completed(elapsed);
        info!(
            manifest = %self.shared.manifest(),
            highest_executed = self.shared.highest_executed().0,
            elapsed_secs = elapsed,
            "Recovery complete"
        );
        RecoveryProgress::Complete
    }
}

/// Write a validated fragment where its token says it belongs. Log segments
/// are rewritten from the token's offset on.
fn persist_fragment(
    storage: &dyn DurableStorage,
    token: &StateToken,
    data: &[u8],
) -> Result<(), StorageError> {
    let name = token.file_name();
    if token.kind() == TokenKind::LogSegment {
        storage.set_len(token.kind(), &name, token.offset())?;
    }
    storage.write_range(token.kind(), &name, token.offset(), data)
}

/// Size the assembled snapshot file, point the application at it and adopt a
/// manifest with the incoming snapshot and no log segments yet.
fn load_snapshot(
    app: &dyn Application,
    storage: &dyn DurableStorage,
    shared: &SharedRecoveryState,
    incoming: &CheckpointManifest,
) -> Result<(), RecoveryError> {
    let seq = incoming.checkpoint_seq();
    let name = TokenKind::Snapshot.file_name(seq);
    let size = incoming.snapshot_file_size();

    storage.set_len(TokenKind::Snapshot, &name, size)?;
    app.load_snapshot(seq, &name)
        .map_err(|source| RecoveryError::SnapshotLoad { seq, source })?;

    let adopted = CheckpointManifest::new(seq, incoming.snapshot_tokens().to_vec(), Vec::new())
        .map_err(RecoveryError::ManifestUpdate)?;
    shared.adopt_manifest(adopted);
    info!(seq = seq.0, bytes = size, "Snapshot loaded");
    Ok(())
}
