//! Deterministic batch dispatch, shared by live execution and log replay.

use crate::SharedRecoveryState;
use bulwark_core::Application;
use bulwark_types::{OrderedBatch, RequestInfo};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

/// Hand every command of `batch` to the application, then advance the
/// shared state past it.
///
/// Each command gets one `u64` from a `ChaCha8Rng` seeded with the batch
/// seed, so replicas and replays see identical randomness. When the batch
/// closes a checkpoint interval the application is asked to snapshot.
///
/// The caller is responsible for skipping batches already executed.
pub fn apply_batch(
    app: &dyn Application,
    shared: &SharedRecoveryState,
    batch: &OrderedBatch,
    checkpoint_interval: u64,
) {
    execute_batch(app, batch);
    complete_batch(app, shared, batch, checkpoint_interval);
}

/// Execute the commands of `batch` without touching shared state.
pub(crate) fn execute_batch(app: &dyn Application, batch: &OrderedBatch) {
    let mut rng = ChaCha8Rng::seed_from_u64(batch.nondeterminism.seed);
    let last = batch.entries.len().saturating_sub(1);

    for (i, entry) in batch.entries.iter().enumerate() {
        let info = RequestInfo {
            client: entry.client,
            request_id: entry.request_id,
            seq: batch.seq,
            time: batch.nondeterminism.time,
            random: rng.gen(),
            last_before_checkpoint: batch.take_checkpoint && i == last,
        };
        app.execute(&entry.command, info);
    }
}

/// Start the snapshot if `batch` closes a checkpoint interval, then mark it
/// executed. The live pipeline flushes the log segment in between.
pub(crate) fn complete_batch(
    app: &dyn Application,
    shared: &SharedRecoveryState,
    batch: &OrderedBatch,
    checkpoint_interval: u64,
) {
    if batch.seq.is_checkpoint_boundary(checkpoint_interval) {
        debug!(seq = batch.seq.0, "Checkpoint boundary, starting sync");
        shared.start_sync(batch.seq);
        app.begin_sync(batch.seq);
    }

    shared.advance_executed(batch.seq);
    trace!(seq = batch.seq.0, commands = batch.entries.len(), "Applied batch");
}
