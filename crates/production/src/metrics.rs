//! Replica metrics using the native Prometheus client.
//!
//! Metrics are domain-specific rather than generic event counters.
//! Use traces for event-level granularity during investigations.

use bulwark_execution::{PipelineStats, RecoveryStatus};
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram, Counter,
    CounterVec, Gauge, Histogram,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Domain-specific metrics for replica monitoring.
pub struct Metrics {
    // === Execution ===
    pub batches_executed: Counter,
    pub batches_skipped: Counter,
    pub batches_out_of_order: Counter,
    pub read_only_served: Counter,
    pub read_only_dropped: Counter,
    pub pipeline_queue_depth: Gauge,
    pub admission_pauses: Counter,
    pub highest_executed: Gauge,

    // === Checkpoints ===
    pub log_checkpoints: Counter,
    pub checkpoints_published: Counter,
    pub checkpoint_seq: Gauge,
    pub checkpoints_collected: Counter,

    // === Recovery ===
    pub recoveries_started: CounterVec,
    pub recoveries_completed: Counter,
    pub recovery_duration: Histogram,
    pub recovery_in_progress: Gauge,
    pub batches_replayed: Counter,

    // === Fragments ===
    pub fragments_requested: Counter,
    pub fragments_local_hits: Counter,
    pub fragments_received: Counter,
    pub fragments_rejected: CounterVec,
    pub fragments_served: Counter,
    pub fragments_denied: Counter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            // Execution
            batches_executed: register_counter!(
                "bulwark_batches_executed_total",
                "Ordered batches applied by the execution pipeline"
            )
            .unwrap(),

            batches_skipped: register_counter!(
                "bulwark_batches_skipped_total",
                "Ordered batches skipped because they were already executed"
            )
            .unwrap(),

            batches_out_of_order: register_counter!(
                "bulwark_batches_out_of_order_total",
                "Ordered batches refused because they skipped ahead of the next sequence number"
            )
            .unwrap(),

            read_only_served: register_counter!(
                "bulwark_read_only_served_total",
                "Read-only requests answered"
            )
            .unwrap(),

            read_only_dropped: register_counter!(
                "bulwark_read_only_dropped_total",
                "Read-only requests dropped during recovery or paused admission"
            )
            .unwrap(),

            pipeline_queue_depth: register_gauge!(
                "bulwark_pipeline_queue_depth",
                "Jobs waiting in the execution queue"
            )
            .unwrap(),

            admission_pauses: register_counter!(
                "bulwark_admission_pauses_total",
                "Times the ordering layer was asked to pause admission"
            )
            .unwrap(),

            highest_executed: register_gauge!(
                "bulwark_highest_executed_seq",
                "Highest executed sequence number"
            )
            .unwrap(),

            // Checkpoints
            log_checkpoints: register_counter!(
                "bulwark_log_checkpoints_total",
                "Log segments flushed to durable storage"
            )
            .unwrap(),

            checkpoints_published: register_counter!(
                "bulwark_checkpoints_published_total",
                "Snapshot checkpoints adopted into the manifest"
            )
            .unwrap(),

            checkpoint_seq: register_gauge!(
                "bulwark_checkpoint_seq",
                "Checkpoint sequence number of the current manifest"
            )
            .unwrap(),

            checkpoints_collected: register_counter!(
                "bulwark_checkpoints_collected_total",
                "Released manifests garbage-collected"
            )
            .unwrap(),

            // Recovery
            recoveries_started: register_counter_vec!(
                "bulwark_recoveries_started_total",
                "Recoveries started, by load kind",
                &["kind"]
            )
            .unwrap(),

            recoveries_completed: register_counter!(
                "bulwark_recoveries_completed_total",
                "Recoveries that converged"
            )
            .unwrap(),

            recovery_duration: register_histogram!(
                "bulwark_recovery_duration_seconds",
                "Time from recovery trigger to ready",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0]
            )
            .unwrap(),

            recovery_in_progress: register_gauge!(
                "bulwark_recovery_in_progress",
                "Whether recovery is currently active (0 or 1)"
            )
            .unwrap(),

            batches_replayed: register_counter!(
                "bulwark_batches_replayed_total",
                "Batches re-applied from fetched log segments"
            )
            .unwrap(),

            // Fragments
            fragments_requested: register_counter!(
                "bulwark_fragments_requested_total",
                "Fragment requests sent to peers"
            )
            .unwrap(),

            fragments_local_hits: register_counter!(
                "bulwark_fragments_local_hits_total",
                "Fragments satisfied from local storage without a request"
            )
            .unwrap(),

            fragments_received: register_counter!(
                "bulwark_fragments_received_total",
                "Valid fragments accepted from peers"
            )
            .unwrap(),

            fragments_rejected: register_counter_vec!(
                "bulwark_fragments_rejected_total",
                "Fragments dropped on arrival",
                &["reason"]
            )
            .unwrap(),

            fragments_served: register_counter!(
                "bulwark_fragments_served_total",
                "Fragment requests answered with data"
            )
            .unwrap(),

            fragments_denied: register_counter!(
                "bulwark_fragments_denied_total",
                "Fragment requests answered with not-available"
            )
            .unwrap(),
        }
    }
}

/// Get or initialize the global metrics instance.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Fold the pipeline counters accumulated since `previous` into the
/// Prometheus counters. Returns `current` to be passed next time.
pub fn record_pipeline_stats(previous: PipelineStats, current: PipelineStats) -> PipelineStats {
    let m = metrics();
    let delta = |now: u64, before: u64| now.saturating_sub(before) as f64;
    m.batches_executed
        .inc_by(delta(current.executed, previous.executed));
    m.batches_skipped
        .inc_by(delta(current.skipped, previous.skipped));
    m.batches_out_of_order
        .inc_by(delta(current.out_of_order, previous.out_of_order));
    m.read_only_served
        .inc_by(delta(current.read_only, previous.read_only));
    m.read_only_dropped
        .inc_by(delta(current.read_only_dropped, previous.read_only_dropped));
    m.log_checkpoints
        .inc_by(delta(current.log_checkpoints, previous.log_checkpoints));
    m.pipeline_queue_depth.set(current.queue_depth as f64);
    current
}

/// Record batches applied outside the pipeline's own counters.
pub fn record_batches_executed(count: u64) {
    metrics().batches_executed.inc_by(count as f64);
}

/// Update gauges from the shared recovery state.
pub fn set_recovery_status(status: &RecoveryStatus) {
    let m = metrics();
    m.highest_executed.set(status.highest_executed as f64);
    m.checkpoint_seq.set(status.checkpoint_seq as f64);
    m.recovery_in_progress
        .set(if status.in_recovery { 1.0 } else { 0.0 });
}

/// Record an admission pause signal.
pub fn record_admission_pause() {
    metrics().admission_pauses.inc();
}

/// Record a published snapshot checkpoint.
pub fn record_checkpoint_published(seq: u64) {
    let m = metrics();
    m.checkpoints_published.inc();
    m.checkpoint_seq.set(seq as f64);
}

/// Record a garbage-collected manifest.
pub fn record_checkpoint_collected() {
    metrics().checkpoints_collected.inc();
}

/// Record the start of a recovery.
///
/// `kind` is one of `"full"` or `"incremental"`.
pub fn record_recovery_started(kind: &str) {
    debug_assert!(matches!(kind, "full" | "incremental"));
    let m = metrics();
    m.recoveries_started.with_label_values(&[kind]).inc();
    m.recovery_in_progress.set(1.0);
}

/// Record a finished recovery.
pub fn record_recovery_completed(duration_secs: f64) {
    let m = metrics();
    m.recoveries_completed.inc();
    m.recovery_duration.observe(duration_secs);
    m.recovery_in_progress.set(0.0);
}

/// Record batches re-applied from a log segment.
pub fn record_batches_replayed(count: usize) {
    metrics().batches_replayed.inc_by(count as f64);
}

pub fn record_fragment_requested() {
    metrics().fragments_requested.inc();
}

pub fn record_fragment_local_hit() {
    metrics().fragments_local_hits.inc();
}

pub fn record_fragment_received() {
    metrics().fragments_received.inc();
}

/// Record a dropped fragment.
///
/// **Cardinality control**: use only `"undecodable"`, `"unknown"`,
/// `"already_fetched"` or `"digest_mismatch"`.
pub fn record_fragment_rejected(reason: &str) {
    debug_assert!(
        matches!(
            reason,
            "undecodable" | "unknown" | "already_fetched" | "digest_mismatch"
        ),
        "Unknown rejection reason: {}",
        reason
    );
    metrics()
        .fragments_rejected
        .with_label_values(&[reason])
        .inc();
}

pub fn record_fragment_served() {
    metrics().fragments_served.inc();
}

pub fn record_fragment_denied() {
    metrics().fragments_denied.inc();
}
