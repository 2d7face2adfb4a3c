//! Replica runner.
//!
//! Owns the event loop that ties the components together:
//!
//! - ordered and read-only work goes to the current [`ExecutionPipeline`]
//! - recovery triggers and fragment arrivals go to the [`RecoveryCoordinator`]
//! - peers' fragment requests go to the [`FragmentFetchService`]
//! - snapshot completions and released manifests go to the
//!   [`CheckpointPublisher`]
//!
//! The pipeline is stopped (and awaited) before a recovery starts and a
//! fresh one is started once the coordinator reports completion, so the
//! worker and recovery replay never execute batches at the same time.

use crate::checkpoint::CheckpointPublisher;
use crate::config::{ConfigError, ReplicaConfig};
use crate::fetch::FragmentFetchService;
use crate::metrics;
use crate::recovery::{RecoveryCoordinator, RecoveryError, RecoveryProgress};
use bulwark_core::{
    Application, ApplicationCallbacks, DurableStorage, Event, FragmentTransport, OrderingLayer,
};
use bulwark_execution::{
    BatchLog, ExecutionPipeline, PipelineConfig, PipelineContext, PipelineStats,
    SharedRecoveryState,
};
use bulwark_types::{ClientId, OrderedBatch, ReadOnlyRequest, ReplicaId, RequestInfo, SeqNo};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};

/// Errors from the replica runner.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Durable or executed state can no longer be trusted.
    #[error("fatal replica error: {0}")]
    Fatal(String),

    #[error("event channel closed")]
    ChannelClosed,

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl From<RecoveryError> for ReplicaError {
    fn from(e: RecoveryError) -> Self {
        ReplicaError::Fatal(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Handles
// ═══════════════════════════════════════════════════════════════════════════

/// Cloneable entry point for the ordering layer, the transport and the
/// application. Every method just queues an [`Event`].
#[derive(Debug, Clone)]
pub struct ReplicaHandle {
    events: mpsc::UnboundedSender<Event>,
}

impl ReplicaHandle {
    fn send(&self, event: Event) -> Result<(), ReplicaError> {
        self.events
            .send(event)
            .map_err(|_| ReplicaError::ChannelClosed)
    }

    pub fn submit_ordered_batch(&self, batch: OrderedBatch) -> Result<(), ReplicaError> {
        self.send(Event::OrderedBatchSubmitted { batch })
    }

    pub fn submit_read_only(&self, request: ReadOnlyRequest) -> Result<(), ReplicaError> {
        self.send(Event::ReadOnlySubmitted { request })
    }

    /// Converge to the encoded manifest, reaching at least `target`.
    pub fn trigger_recovery(&self, manifest: Vec<u8>, target: SeqNo) -> Result<(), ReplicaError> {
        self.send(Event::RecoveryTriggered { manifest, target })
    }

    pub fn fragment_arrived(&self, token: Vec<u8>, data: Vec<u8>) -> Result<(), ReplicaError> {
        self.send(Event::FragmentArrived { token, data })
    }

    pub fn fragment_requested(&self, from: ReplicaId, token: Vec<u8>) -> Result<(), ReplicaError> {
        self.send(Event::FragmentRequested { from, token })
    }

    pub fn execution_complete(&self, reply: Vec<u8>, info: RequestInfo) -> Result<(), ReplicaError> {
        self.send(Event::ExecutionComplete { reply, info })
    }

    pub fn sync_complete(&self, seq: SeqNo, file_name: String) -> Result<(), ReplicaError> {
        self.send(Event::SyncComplete { seq, file_name })
    }

    /// Hand back an encoded manifest the ordering layer no longer needs.
    pub fn release_checkpoint(&self, manifest: Vec<u8>) -> Result<(), ReplicaError> {
        self.send(Event::CheckpointReleased { manifest })
    }
}

impl ApplicationCallbacks for ReplicaHandle {
    fn execution_complete(&self, reply: Vec<u8>, info: RequestInfo) {
        if ReplicaHandle::execution_complete(self, reply, info).is_err() {
            trace!(seq = info.seq.0, "Replica gone, dropping reply");
        }
    }

    fn sync_complete(&self, seq: SeqNo, file_name: String) {
        if ReplicaHandle::sync_complete(self, seq, file_name).is_err() {
            trace!(seq = seq.0, "Replica gone, dropping snapshot");
        }
    }
}

/// Handle for shutting down a running [`Replica`].
///
/// When dropped, signals the replica to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Metered Ordering Layer
// ═══════════════════════════════════════════════════════════════════════════

/// Counts admission pauses on their way to the real ordering layer.
struct MeteredOrdering {
    inner: Arc<dyn OrderingLayer>,
}

impl OrderingLayer for MeteredOrdering {
    fn ready_for_requests(&self) {
        self.inner.ready_for_requests();
    }

    fn admission_pause(&self) {
        metrics::record_admission_pause();
        self.inner.admission_pause();
    }

    fn admission_resume(&self) {
        self.inner.admission_resume();
    }

    fn deliver_reply(&self, reply: Vec<u8>, info: RequestInfo) {
        self.inner.deliver_reply(reply, info);
    }

    fn read_only_reply(&self, client: ClientId, request_id: u64, reply: Vec<u8>) {
        self.inner.read_only_reply(client, request_id, reply);
    }

    fn checkpoint_ready(&self, seq: SeqNo, manifest: Vec<u8>) {
        self.inner.checkpoint_ready(seq, manifest);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════

/// Builder for constructing a [`Replica`].
///
/// Required fields:
/// - `app` - the replicated state machine
/// - `storage` - where snapshots and log segments live
/// - `transport` - fragment exchange with peers
/// - `ordering` - the consensus layer feeding ordered batches
///
/// Optional fields:
/// - `config` - defaults to [`ReplicaConfig::default`]
/// - `recovery_state` - state restored from a previous run (defaults to genesis)
/// - `ready_flag` - flipped off while recovering, e.g. for `/ready`
pub struct ReplicaBuilder {
    config: ReplicaConfig,
    app: Option<Arc<dyn Application>>,
    storage: Option<Arc<dyn DurableStorage>>,
    transport: Option<Arc<dyn FragmentTransport>>,
    ordering: Option<Arc<dyn OrderingLayer>>,
    shared: Option<Arc<SharedRecoveryState>>,
    ready_flag: Option<Arc<AtomicBool>>,
}

impl Default for ReplicaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplicaConfig::default(),
            app: None,
            storage: None,
            transport: None,
            ordering: None,
            shared: None,
            ready_flag: None,
        }
    }

    pub fn config(mut self, config: ReplicaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn app(mut self, app: Arc<dyn Application>) -> Self {
        self.app = Some(app);
        self
    }

    pub fn storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn FragmentTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn ordering(mut self, ordering: Arc<dyn OrderingLayer>) -> Self {
        self.ordering = Some(ordering);
        self
    }

    /// Start from an existing recovery state instead of genesis.
    pub fn recovery_state(mut self, shared: Arc<SharedRecoveryState>) -> Self {
        self.shared = Some(shared);
        self
    }

    pub fn ready_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.ready_flag = Some(flag);
        self
    }

    /// Build the replica and attach its handle to the application.
    ///
    /// # Errors
    ///
    /// Returns an error if a required collaborator is missing or the
    /// configuration does not validate.
    pub fn build(self) -> Result<Replica, ReplicaError> {
        self.config.validate()?;
        let app = self.app.ok_or(ReplicaError::Missing("app"))?;
        let storage = self.storage.ok_or(ReplicaError::Missing("storage"))?;
        let transport = self.transport.ok_or(ReplicaError::Missing("transport"))?;
        let ordering: Arc<dyn OrderingLayer> = Arc::new(MeteredOrdering {
            inner: self.ordering.ok_or(ReplicaError::Missing("ordering"))?,
        });
        let shared = self.shared.unwrap_or_default();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = ReplicaHandle {
            events: events_tx.clone(),
        };
        app.attach(Arc::new(handle.clone()));

        let log = Arc::new(Mutex::new(BatchLog::new(storage.clone())));
        let coordinator = RecoveryCoordinator::new(
            self.config.recovery(),
            app.clone(),
            storage.clone(),
            transport.clone(),
            shared.clone(),
            log.clone(),
        );
        let publisher = CheckpointPublisher::new(
            self.config.checkpoint(),
            storage.clone(),
            shared.clone(),
            ordering.clone(),
        );

        info!(
            replica = self.config.node.replica_id,
            cluster_size = self.config.node.cluster_size,
            checkpoint_interval = self.config.execution.checkpoint_interval,
            highest_executed = shared.highest_executed().0,
            "Replica built"
        );

        Ok(Replica {
            replica_id: self.config.replica_id(),
            pipeline_config: self.config.pipeline(),
            retransmit_interval: self.config.retransmit_interval(),
            app,
            storage,
            transport,
            ordering,
            shared,
            log,
            coordinator,
            publisher,
            pipeline: None,
            fetch: None,
            last_stats: PipelineStats::default(),
            ready_flag: self.ready_flag,
            handle,
            events_tx,
            events_rx,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Replica
// ═══════════════════════════════════════════════════════════════════════════

/// One replica's checkpoint and recovery core.
pub struct Replica {
    replica_id: ReplicaId,
    pipeline_config: PipelineConfig,
    retransmit_interval: Duration,
    app: Arc<dyn Application>,
    storage: Arc<dyn DurableStorage>,
    transport: Arc<dyn FragmentTransport>,
    ordering: Arc<dyn OrderingLayer>,
    shared: Arc<SharedRecoveryState>,
    log: Arc<Mutex<BatchLog>>,
    coordinator: RecoveryCoordinator,
    publisher: CheckpointPublisher,
    pipeline: Option<ExecutionPipeline>,
    fetch: Option<FragmentFetchService>,
    /// Pipeline counters already folded into metrics.
    last_stats: PipelineStats,
    ready_flag: Option<Arc<AtomicBool>>,
    handle: ReplicaHandle,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl Replica {
    pub fn builder() -> ReplicaBuilder {
        ReplicaBuilder::new()
    }

    pub fn handle(&self) -> ReplicaHandle {
        self.handle.clone()
    }

    /// Take the shutdown handle. Returns `None` if already taken.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    pub fn shared_state(&self) -> Arc<SharedRecoveryState> {
        self.shared.clone()
    }

    /// Run the event loop until shutdown or a fatal error.
    ///
    /// Must be called from within a tokio runtime. Shutdown is checked
    /// first, then events, then the retransmit and metrics ticks.
    pub async fn run(mut self) -> Result<(), ReplicaError> {
        info!(replica = self.replica_id.0, "Starting replica");

        self.fetch = Some(FragmentFetchService::spawn(
            self.storage.clone(),
            self.transport.clone(),
        ));
        self.start_pipeline();
        self.ordering.ready_for_requests();
        self.set_ready(true);

        let mut metrics_tick = tokio::time::interval(Duration::from_secs(1));
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut retransmit_tick = tokio::time::interval(self.retransmit_interval);
        retransmit_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("Shutdown signal received");
                    break Ok(());
                }

                Some(event) = self.events_rx.recv() => {
                    let event_span = span!(
                        Level::DEBUG,
                        "handle_event",
                        event.type = %event.type_name(),
                        replica = self.replica_id.0,
                    );
                    if let Err(e) = self.handle_event(event).instrument(event_span).await {
                        error!(error = %e, "Replica stopping");
                        break Err(e);
                    }
                }

                _ = retransmit_tick.tick() => {
                    self.coordinator.request_outstanding();
                }

                _ = metrics_tick.tick() => {
                    self.record_metrics();
                }
            }
        };

        self.set_ready(false);
        let stopped = self.stop_pipeline().await;
        if let Some(fetch) = self.fetch.take() {
            fetch.shutdown().await;
        }
        info!(replica = self.replica_id.0, "Replica stopped");
        result.and(stopped)
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), ReplicaError> {
        match event {
            Event::OrderedBatchSubmitted { batch } => {
                match &self.pipeline {
                    Some(pipeline) if !self.coordinator.is_active() => {
                        if !pipeline.submit_ordered(batch) {
                            warn!("Execution pipeline refused ordered batch");
                        }
                    }
                    _ => debug!(seq = batch.seq.0, "Dropping ordered batch during recovery"),
                }
                Ok(())
            }

            Event::ReadOnlySubmitted { request } => {
                if let Some(pipeline) = &self.pipeline {
                    pipeline.submit_read_only(request);
                } else {
                    debug!(client = request.client.0, "Dropping read-only request during recovery");
                }
                Ok(())
            }

            Event::RecoveryTriggered { manifest, target } => {
                self.set_ready(false);
                self.stop_pipeline().await?;
                let progress = self.coordinator.trigger(&manifest, target);
                self.on_recovery_progress(progress)
            }

            Event::FragmentArrived { token, data } => {
                let progress = self.coordinator.on_fragment(&token, &data);
                self.on_recovery_progress(progress)
            }

            Event::FragmentRequested { from, token } => {
                let queued = self
                    .fetch
                    .as_ref()
                    .is_some_and(|fetch| fetch.request(from, token));
                if !queued {
                    warn!(from = from.0, "Fetch service unavailable, dropping request");
                }
                Ok(())
            }

            Event::ExecutionComplete { reply, info } => {
                self.ordering.deliver_reply(reply, info);
                Ok(())
            }

            Event::SyncComplete { seq, file_name } => {
                self.publisher
                    .on_sync_complete(seq, &file_name)
                    .map_err(|e| ReplicaError::Fatal(e.to_string()))?;
                Ok(())
            }

            Event::CheckpointReleased { manifest } => {
                // Leftover files only cost space; the next release retries.
                if let Err(e) = self.publisher.release(&manifest) {
                    warn!(error = %e, "Failed to collect released checkpoint");
                }
                Ok(())
            }

            Event::PipelineFailed { reason } => Err(ReplicaError::Fatal(reason)),
        }
    }

    fn on_recovery_progress(
        &mut self,
        progress: Result<RecoveryProgress, RecoveryError>,
    ) -> Result<(), ReplicaError> {
        match progress {
            Ok(RecoveryProgress::Complete) => {
                self.resume();
                Ok(())
            }
            Ok(RecoveryProgress::InProgress) | Ok(RecoveryProgress::Idle) => Ok(()),
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "Recovery request rejected");
                if !self.coordinator.is_active() && self.pipeline.is_none() {
                    self.resume();
                }
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Converged: accept ordered work again.
    fn resume(&mut self) {
        self.start_pipeline();
        self.ordering.ready_for_requests();
        self.set_ready(true);
        info!(
            highest_executed = self.shared.highest_executed().0,
            checkpoint = self.shared.manifest().checkpoint_seq().0,
            "Replica ready for requests"
        );
    }

    fn start_pipeline(&mut self) {
        if self.pipeline.is_some() {
            return;
        }
        let ctx = PipelineContext {
            app: self.app.clone(),
            ordering: self.ordering.clone(),
            shared: self.shared.clone(),
            log: self.log.clone(),
            events: self.events_tx.clone(),
        };
        self.pipeline = Some(ExecutionPipeline::start(self.pipeline_config.clone(), ctx));
        self.last_stats = PipelineStats::default();
    }

    /// Stop the pipeline and wait for its worker to exit.
    async fn stop_pipeline(&mut self) -> Result<(), ReplicaError> {
        let Some(pipeline) = self.pipeline.take() else {
            return Ok(());
        };
        metrics::record_pipeline_stats(self.last_stats, pipeline.stats());
        self.last_stats = PipelineStats::default();
        match pipeline.stop().await {
            Ok(discarded) => {
                debug!(discarded, "Pipeline stopped");
                Ok(())
            }
            Err(e) => Err(ReplicaError::Fatal(e.to_string())),
        }
    }

    fn record_metrics(&mut self) {
        if let Some(pipeline) = &self.pipeline {
            self.last_stats = metrics::record_pipeline_stats(self.last_stats, pipeline.stats());
        }
        metrics::set_recovery_status(&self.shared.status());
    }

    fn set_ready(&self, ready: bool) {
        if let Some(flag) = &self.ready_flag {
            flag.store(ready, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        batch, log_token, segment, ChainApp, MemStore, RecordingOrdering, RecordingTransport,
        Signal,
    };
    use bulwark_core::FragmentResponse;
    use bulwark_types::{CheckpointManifest, TokenKind};
    use tokio::task::JoinHandle;

    struct Harness {
        app: Arc<ChainApp>,
        store: Arc<MemStore>,
        transport: Arc<RecordingTransport>,
        ordering: Arc<RecordingOrdering>,
        shared: Arc<SharedRecoveryState>,
        ready: Arc<AtomicBool>,
        handle: ReplicaHandle,
        shutdown: ShutdownHandle,
        task: JoinHandle<Result<(), ReplicaError>>,
    }

    fn start(interval: u64) -> Harness {
        let store = Arc::new(MemStore::default());
        let app = Arc::new(ChainApp::new(store.clone()));
        let transport = Arc::new(RecordingTransport::default());
        let ordering = Arc::new(RecordingOrdering::default());
        let ready = Arc::new(AtomicBool::new(false));

        let mut config = ReplicaConfig::default();
        config.execution.checkpoint_interval = interval;
        config.checkpoint.snapshot_chunk_size = 16;

        let mut replica = Replica::builder()
            .config(config)
            .app(app.clone())
            .storage(store.clone())
            .transport(transport.clone())
            .ordering(ordering.clone())
            .ready_flag(ready.clone())
            .build()
            .unwrap();
        let handle = replica.handle();
        let shared = replica.shared_state();
        let shutdown = replica.shutdown_handle().unwrap();
        let task = tokio::spawn(replica.run());

        Harness {
            app,
            store,
            transport,
            ordering,
            shared,
            ready,
            handle,
            shutdown,
            task,
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[test]
    fn test_build_requires_collaborators() {
        let result = Replica::builder()
            .app(Arc::new(ChainApp::new(Arc::new(MemStore::default()))))
            .storage(Arc::new(MemStore::default()))
            .ordering(Arc::new(RecordingOrdering::default()))
            .build();
        assert!(matches!(result, Err(ReplicaError::Missing("transport"))));
    }

    #[tokio::test]
    async fn test_executes_ordered_batches() {
        let h = start(100);
        wait_for(|| h.ready.load(Ordering::SeqCst)).await;

        for seq in 1..=5 {
            h.handle.submit_ordered_batch(batch(seq, false)).unwrap();
        }
        wait_for(|| h.shared.highest_executed() == SeqNo(5)).await;
        assert_eq!(h.ordering.count(|s| *s == Signal::Ready), 1);

        h.shutdown.shutdown();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_sync_complete_publishes_checkpoint() {
        let h = start(4);
        for seq in 1..=4 {
            h.handle.submit_ordered_batch(batch(seq, false)).unwrap();
        }
        wait_for(|| h.app.syncs() == vec![SeqNo(4)]).await;

        let name = h.app.write_snapshot(SeqNo(4));
        h.handle.sync_complete(SeqNo(4), name).unwrap();
        wait_for(|| !h.ordering.checkpoints().is_empty()).await;

        let (seq, encoded) = h.ordering.checkpoints()[0].clone();
        assert_eq!(seq, SeqNo(4));
        let manifest = CheckpointManifest::decode(&encoded).unwrap();
        assert_eq!(manifest.checkpoint_seq(), SeqNo(4));
        assert_eq!(manifest.snapshot_tokens().len(), 2);
        assert!(h
            .store
            .contains(TokenKind::Snapshot, &TokenKind::Snapshot.file_name(SeqNo(4))));

        h.shutdown.shutdown();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_log_checkpoint_on_snapshot_boundary_is_folded_in() {
        let h = start(4);
        for seq in 1..=4 {
            h.handle.submit_ordered_batch(batch(seq, seq == 4)).unwrap();
        }
        wait_for(|| h.app.syncs() == vec![SeqNo(4)]).await;
        let name = h.app.write_snapshot(SeqNo(4));
        h.handle.sync_complete(SeqNo(4), name).unwrap();
        wait_for(|| h.ordering.checkpoints().len() == 2).await;

        let published: Vec<_> = h
            .ordering
            .checkpoints()
            .into_iter()
            .map(|(seq, bytes)| (seq, CheckpointManifest::decode(&bytes).unwrap()))
            .collect();
        let log_4 = TokenKind::LogSegment.file_name(SeqNo(4));
        assert_eq!(published[0].0, SeqNo(4));
        assert_eq!(published[0].1.checkpoint_seq(), SeqNo::GENESIS);
        assert_eq!(published[0].1.log_tokens()[0].file_name(), log_4);
        assert_eq!(published[1].0, SeqNo(4));
        assert_eq!(published[1].1.checkpoint_seq(), SeqNo(4));
        assert!(published[1].1.log_tokens().is_empty());

        h.shutdown.shutdown();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_recovery_drops_batches_until_complete() {
        let h = start(100);
        let seg = segment(1, 10);
        let log = log_token(10, &seg);
        let manifest = CheckpointManifest::new(SeqNo::GENESIS, vec![], vec![log.clone()]).unwrap();

        h.handle
            .trigger_recovery(manifest.encode(), SeqNo(10))
            .unwrap();
        wait_for(|| h.transport.requested() == vec![log.clone()]).await;
        assert!(!h.ready.load(Ordering::SeqCst));

        // Arrives mid-recovery and is dropped.
        h.handle.submit_ordered_batch(batch(11, false)).unwrap();

        h.handle.fragment_arrived(log.encode(), seg).unwrap();
        wait_for(|| h.ordering.count(|s| *s == Signal::Ready) == 2).await;
        assert_eq!(h.shared.highest_executed(), SeqNo(10));
        assert!(!h.shared.in_recovery());
        assert!(h.ready.load(Ordering::SeqCst));

        h.handle.submit_ordered_batch(batch(11, false)).unwrap();
        wait_for(|| h.shared.highest_executed() == SeqNo(11)).await;

        h.shutdown.shutdown();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serves_peer_requests() {
        let h = start(100);
        let token = log_token(7, b"segment-7");
        h.store
            .replace_file(TokenKind::LogSegment, &token.file_name(), b"segment-7")
            .unwrap();

        h.handle
            .fragment_requested(ReplicaId(3), token.encode())
            .unwrap();
        wait_for(|| !h.transport.returned().is_empty()).await;
        assert_eq!(
            h.transport.returned()[0],
            (
                ReplicaId(3),
                token.encode(),
                FragmentResponse::Data(b"segment-7".to_vec())
            )
        );

        h.shutdown.shutdown();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pipeline_failure_stops_replica() {
        let h = start(100);
        h.store.fail_writes(true);
        h.handle.submit_ordered_batch(batch(1, true)).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReplicaError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_undecodable_trigger_is_fatal() {
        let h = start(100);
        h.handle.trigger_recovery(vec![0xff], SeqNo(5)).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ReplicaError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_dropping_shutdown_handle_stops_replica() {
        let h = start(100);
        drop(h.shutdown);
        tokio::time::timeout(Duration::from_secs(5), h.task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
