//! Single-consumer execution pipeline.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► Running ──stop()──► Draining ──► Stopped
//! ```
//!
//! A pipeline is never restarted. Recovery stops the current instance and
//! starts a fresh one once the replica has converged, so no two workers are
//! ever active at the same time.
//!
//! # Admission Control
//!
//! The queue is unbounded but its depth is tracked. When depth exceeds half
//! the checkpoint interval the ordering layer is told to pause, and when it
//! falls back below that threshold it is told to resume. A zero threshold
//! resumes once the queue is empty. Each transition signals exactly once.
//! Ordered batches are still accepted while paused.
//!
//! # Ordering
//!
//! Batches must arrive as `highest_executed + 1`. Older ones are skipped,
//! newer ones are refused and counted, and the ordering layer is expected
//! to resubmit from the gap.

use crate::dispatch::{complete_batch, execute_batch};
use crate::log::BatchLog;
use crate::SharedRecoveryState;
use bulwark_core::{Application, Event, OrderingLayer, StorageError};
use bulwark_types::{CodecError, OrderedBatch, ReadOnlyRequest};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

// ═══════════════════════════════════════════════════════════════════════════
// Configuration and Errors
// ═══════════════════════════════════════════════════════════════════════════

/// Configuration for the execution pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batches between application snapshots.
    pub checkpoint_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 10_000,
        }
    }
}

impl PipelineConfig {
    /// Queue depth above which admission is paused.
    pub fn admission_threshold(&self) -> usize {
        (self.checkpoint_interval / 2) as usize
    }
}

/// Errors that stop the execution worker. All of them are fatal to the
/// replica: durable state may no longer match executed state.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to persist log segment: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to encode log record: {0}")]
    Record(CodecError),

    #[error("manifest update rejected: {0}")]
    Manifest(#[from] CodecError),

    #[error("execution worker panicked: {0}")]
    WorkerPanicked(String),
}

/// Work accepted by the pipeline.
#[derive(Debug)]
pub enum Job {
    Ordered(OrderedBatch),
    ReadOnly(ReadOnlyRequest),
}

/// Collaborators the worker needs.
#[derive(Clone)]
pub struct PipelineContext {
    pub app: Arc<dyn Application>,
    pub ordering: Arc<dyn OrderingLayer>,
    pub shared: Arc<SharedRecoveryState>,
    pub log: Arc<Mutex<BatchLog>>,
    /// Where the worker reports a fatal failure.
    pub events: mpsc::UnboundedSender<Event>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Admission Control
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct AdmissionState {
    depth: usize,
    paused: bool,
}

/// Queue-depth tracker that signals the ordering layer on threshold
/// crossings.
pub struct AdmissionControl {
    state: Mutex<AdmissionState>,
    threshold: usize,
    ordering: Arc<dyn OrderingLayer>,
}

impl AdmissionControl {
    pub fn new(threshold: usize, ordering: Arc<dyn OrderingLayer>) -> Self {
        Self {
            state: Mutex::new(AdmissionState::default()),
            threshold,
            ordering,
        }
    }

    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    fn on_enqueue(&self) {
        let mut state = self.state.lock();
        state.depth += 1;
        if state.depth > self.threshold && !state.paused {
            state.paused = true;
            info!(depth = state.depth, threshold = self.threshold, "Pausing admission");
            self.ordering.admission_pause();
        }
    }

    fn on_dequeue(&self, count: usize) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(count);
        let drained = state.depth < self.threshold || state.depth == 0;
        if drained && state.paused {
            state.paused = false;
            info!(depth = state.depth, threshold = self.threshold, "Resuming admission");
            self.ordering.admission_resume();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Statistics
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct PipelineCounters {
    executed: AtomicU64,
    skipped: AtomicU64,
    out_of_order: AtomicU64,
    read_only: AtomicU64,
    read_only_dropped: AtomicU64,
    log_checkpoints: AtomicU64,
}

/// Pipeline counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub executed: u64,
    pub skipped: u64,
    pub out_of_order: u64,
    pub read_only: u64,
    pub read_only_dropped: u64,
    pub log_checkpoints: u64,
    pub queue_depth: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════════

struct WorkerExit {
    jobs: mpsc::UnboundedReceiver<Job>,
    result: Result<(), ExecutionError>,
}

/// Handle to a running execution worker.
pub struct ExecutionPipeline {
    jobs: mpsc::UnboundedSender<Job>,
    admission: Arc<AdmissionControl>,
    counters: Arc<PipelineCounters>,
    shared: Arc<SharedRecoveryState>,
    cancel: CancellationToken,
    worker: JoinHandle<WorkerExit>,
}

impl ExecutionPipeline {
    /// Spawn the worker on the current tokio runtime.
    pub fn start(config: PipelineConfig, ctx: PipelineContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let admission = Arc::new(AdmissionControl::new(
            config.admission_threshold(),
            ctx.ordering.clone(),
        ));
        let counters = Arc::new(PipelineCounters::default());
        let cancel = CancellationToken::new();
        let shared = ctx.shared.clone();

        info!(
            checkpoint_interval = config.checkpoint_interval,
            highest_executed = shared.highest_executed().0,
            "Starting execution pipeline"
        );

        let worker = tokio::spawn(run_worker(
            config,
            ctx,
            rx,
            cancel.clone(),
            admission.clone(),
            counters.clone(),
        ));

        Self {
            jobs: tx,
            admission,
            counters,
            shared,
            cancel,
            worker,
        }
    }

    /// Queue an ordered batch. Returns `false` if the worker has exited.
    pub fn submit_ordered(&self, batch: OrderedBatch) -> bool {
        self.enqueue(Job::Ordered(batch))
    }

    /// Queue a read-only request. Dropped (returning `false`) while the
    /// replica is recovering or admission is paused.
    pub fn submit_read_only(&self, request: ReadOnlyRequest) -> bool {
        if self.shared.in_recovery() || self.admission.is_paused() {
            self.counters.read_only_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                client = request.client.0,
                request_id = request.request_id,
                "Dropping read-only request"
            );
            return false;
        }
        self.enqueue(Job::ReadOnly(request))
    }

    fn enqueue(&self, job: Job) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.admission.on_enqueue();
        if self.jobs.send(job).is_err() {
            self.admission.on_dequeue(1);
            return false;
        }
        true
    }

    pub fn queue_depth(&self) -> usize {
        self.admission.depth()
    }

    pub fn is_paused(&self) -> bool {
        self.admission.is_paused()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            executed: self.counters.executed.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            out_of_order: self.counters.out_of_order.load(Ordering::Relaxed),
            read_only: self.counters.read_only.load(Ordering::Relaxed),
            read_only_dropped: self.counters.read_only_dropped.load(Ordering::Relaxed),
            log_checkpoints: self.counters.log_checkpoints.load(Ordering::Relaxed),
            queue_depth: self.admission.depth(),
        }
    }

    /// Stop at the next job boundary, discard whatever is still queued and
    /// wait for the worker to exit.
    ///
    /// Returns the number of discarded jobs, or the error that killed the
    /// worker.
    pub async fn stop(self) -> Result<usize, ExecutionError> {
        self.cancel.cancel();
        let exit = self
            .worker
            .await
            .map_err(|e| ExecutionError::WorkerPanicked(e.to_string()))?;

        let mut jobs = exit.jobs;
        jobs.close();
        let mut discarded = 0;
        while jobs.try_recv().is_ok() {
            discarded += 1;
        }
        self.admission.on_dequeue(discarded);

        info!(discarded, "Execution pipeline stopped");
        exit.result.map(|()| discarded)
    }
}

async fn run_worker(
    config: PipelineConfig,
    ctx: PipelineContext,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
    admission: Arc<AdmissionControl>,
    counters: Arc<PipelineCounters>,
) -> WorkerExit {
    let result = loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break Ok(()),
            },
        };
        admission.on_dequeue(1);

        if let Err(e) = process_job(&config, &ctx, &counters, job) {
            error!(error = %e, "Execution worker failed");
            let _ = ctx.events.send(Event::PipelineFailed {
                reason: e.to_string(),
            });
            break Err(e);
        }
    };
    WorkerExit { jobs, result }
}

fn process_job(
    config: &PipelineConfig,
    ctx: &PipelineContext,
    counters: &PipelineCounters,
    job: Job,
) -> Result<(), ExecutionError> {
    match job {
        Job::Ordered(batch) => process_batch(config, ctx, counters, batch),
        Job::ReadOnly(request) => {
            if ctx.shared.in_recovery() {
                counters.read_only_dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            let reply = ctx.app.execute_read_only(&request);
            ctx.ordering
                .read_only_reply(request.client, request.request_id, reply);
            counters.read_only.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}

fn process_batch(
    config: &PipelineConfig,
    ctx: &PipelineContext,
    counters: &PipelineCounters,
    batch: OrderedBatch,
) -> Result<(), ExecutionError> {
    let highest = ctx.shared.highest_executed();
    if batch.seq <= highest {
        trace!(seq = batch.seq.0, highest = highest.0, "Skipping executed batch");
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }
    if batch.seq != highest.next() {
        warn!(
            seq = batch.seq.0,
            expected = highest.next().0,
            "Refusing out-of-order batch"
        );
        counters.out_of_order.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    ctx.log
        .lock()
        .append(&batch)
        .map_err(ExecutionError::Record)?;
    execute_batch(ctx.app.as_ref(), &batch);

    // The segment is durable before a snapshot at the same seq starts, so
    // that snapshot's manifest never lists it.
    if batch.take_checkpoint {
        let token = ctx.log.lock().flush(batch.seq)?;
        let manifest = ctx.shared.append_log_token(token)?;
        counters.log_checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(seq = batch.seq.0, %manifest, "Log checkpoint ready");
        ctx.ordering.checkpoint_ready(batch.seq, manifest.encode());
    }

    complete_batch(
        ctx.app.as_ref(),
        &ctx.shared,
        &batch,
        config.checkpoint_interval,
    );
    counters.executed.fetch_add(1, Ordering::Relaxed);
    Ok(())
}
