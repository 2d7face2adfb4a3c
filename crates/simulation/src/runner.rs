//! Multi-replica simulation runner.
//!
//! Each node is a real [`Replica`] running on the current tokio runtime with
//! its own [`SimStorage`], [`CounterApp`], [`LoopbackTransport`] and
//! [`RecordingOrdering`]. The runner plays the network: [`pump`] moves
//! fragment requests to every peer's fetch service and routes the answers
//! back, with the [`SimulatedNetwork`] deciding what is lost, duplicated,
//! corrupted or reordered on the way.
//!
//! [`pump`]: SimulationRunner::pump

use crate::app::CounterApp;
use crate::network::{LoopbackTransport, NetworkConfig, SimulatedNetwork};
use crate::ordering::RecordingOrdering;
use crate::storage::SimStorage;
use bulwark_core::FragmentResponse;
use bulwark_execution::SharedRecoveryState;
use bulwark_production::{Replica, ReplicaConfig, ReplicaError, ReplicaHandle, ShutdownHandle};
use bulwark_types::{OrderedBatch, ReplicaId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One simulated replica and its collaborators.
pub struct SimNode {
    pub id: ReplicaId,
    pub app: Arc<CounterApp>,
    pub storage: Arc<SimStorage>,
    pub transport: Arc<LoopbackTransport>,
    pub ordering: Arc<RecordingOrdering>,
    pub shared: Arc<SharedRecoveryState>,
    pub handle: ReplicaHandle,
    shutdown: Option<ShutdownHandle>,
    task: Option<JoinHandle<Result<(), ReplicaError>>>,
}

impl SimNode {
    /// Whether the replica loop has exited.
    pub fn is_stopped(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }
}

/// Errors from building or driving a simulation.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    #[error("no node {0:?}")]
    UnknownNode(ReplicaId),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Simulation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulationStats {
    pub requests_routed: u64,
    pub fragments_routed: u64,
    pub not_available: u64,
}

pub struct SimulationRunner {
    nodes: BTreeMap<ReplicaId, SimNode>,
    network: SimulatedNetwork,
    stats: SimulationStats,
}

impl SimulationRunner {
    /// Create an empty runner. Same seed, same network decisions.
    pub fn new(network_config: NetworkConfig, seed: u64) -> Self {
        info!(seed, "Creating simulation runner");
        Self {
            nodes: BTreeMap::new(),
            network: SimulatedNetwork::new(network_config, seed),
            stats: SimulationStats::default(),
        }
    }

    /// Build and spawn a replica. Must be called inside a tokio runtime.
    pub fn add_node(
        &mut self,
        id: ReplicaId,
        mut config: ReplicaConfig,
    ) -> Result<(), SimulationError> {
        config.node.replica_id = id.0;
        config.node.cluster_size = config.node.cluster_size.max(id.0 as usize + 1);

        let storage = Arc::new(SimStorage::new());
        let app = Arc::new(CounterApp::new(storage.clone()));
        let transport = Arc::new(LoopbackTransport::new());
        let ordering = Arc::new(RecordingOrdering::new());

        let mut replica = Replica::builder()
            .config(config)
            .app(app.clone())
            .storage(storage.clone())
            .transport(transport.clone())
            .ordering(ordering.clone())
            .build()?;
        let handle = replica.handle();
        let shared = replica.shared_state();
        let shutdown = replica.shutdown_handle();
        let task = tokio::spawn(replica.run());

        debug!(replica = id.0, "Simulated replica started");
        self.nodes.insert(
            id,
            SimNode {
                id,
                app,
                storage,
                transport,
                ordering,
                shared,
                handle,
                shutdown,
                task: Some(task),
            },
        );
        Ok(())
    }

    pub fn node(&self, id: ReplicaId) -> Option<&SimNode> {
        self.nodes.get(&id)
    }

    pub fn node_ids(&self) -> Vec<ReplicaId> {
        self.nodes.keys().copied().collect()
    }

    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    pub fn stats(&self) -> SimulationStats {
        self.stats
    }

    /// Queue ordered batches on one node.
    pub fn submit(
        &self,
        id: ReplicaId,
        batches: impl IntoIterator<Item = OrderedBatch>,
    ) -> Result<(), SimulationError> {
        let node = self.nodes.get(&id).ok_or(SimulationError::UnknownNode(id))?;
        for batch in batches {
            node.handle.submit_ordered_batch(batch)?;
        }
        Ok(())
    }

    /// Route one round of fragment traffic. Returns the number of messages
    /// handed to replicas.
    pub fn pump(&mut self) -> usize {
        let mut moved = 0;

        // Requests go to every other node's fetch service.
        let mut requests = Vec::new();
        for (&from, node) in &self.nodes {
            for token in node.transport.take_requests() {
                for &to in self.nodes.keys().filter(|&&to| to != from) {
                    for _ in 0..self.network.deliveries(from, to) {
                        requests.push((from, to, token.clone()));
                    }
                }
            }
        }
        self.network.reorder(&mut requests);
        for (from, to, token) in requests {
            if let Some(peer) = self.nodes.get(&to) {
                if peer.handle.fragment_requested(from, token).is_ok() {
                    self.stats.requests_routed += 1;
                    moved += 1;
                }
            }
        }

        // Answers go back to the requester.
        let mut arrivals = Vec::new();
        for (&from, node) in &self.nodes {
            for (to, token, response) in node.transport.take_replies() {
                match response {
                    FragmentResponse::Data(data) => {
                        for _ in 0..self.network.deliveries(from, to) {
                            let mut data = data.clone();
                            self.network.maybe_corrupt(&mut data);
                            arrivals.push((to, token.clone(), data));
                        }
                    }
                    FragmentResponse::NotAvailable => self.stats.not_available += 1,
                }
            }
        }
        self.network.reorder(&mut arrivals);
        for (to, token, data) in arrivals {
            if let Some(node) = self.nodes.get(&to) {
                if node.handle.fragment_arrived(token, data).is_ok() {
                    self.stats.fragments_routed += 1;
                    moved += 1;
                }
            }
        }
        moved
    }

    /// Pump until `done` holds, yielding to the replicas between rounds.
    pub async fn run_until(
        &mut self,
        what: &'static str,
        timeout: Duration,
        mut done: impl FnMut(&Self) -> bool,
    ) -> Result<(), SimulationError> {
        let deadline = tokio::time::Instant::now() + timeout;
        while !done(self) {
            if tokio::time::Instant::now() >= deadline {
                warn!(what, "Simulation condition not reached");
                return Err(SimulationError::Timeout(what));
            }
            self.pump();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }

    /// Stop one node and return how its loop ended.
    pub async fn stop_node(&mut self, id: ReplicaId) -> Option<Result<(), ReplicaError>> {
        let node = self.nodes.get_mut(&id)?;
        if let Some(shutdown) = node.shutdown.take() {
            shutdown.shutdown();
        }
        let task = node.task.take()?;
        match task.await {
            Ok(result) => Some(result),
            Err(e) => Some(Err(ReplicaError::Fatal(e.to_string()))),
        }
    }

    /// Stop every node.
    pub async fn shutdown(mut self) -> BTreeMap<ReplicaId, Result<(), ReplicaError>> {
        let mut results = BTreeMap::new();
        for id in self.node_ids() {
            if let Some(result) = self.stop_node(id).await {
                results.insert(id, result);
            }
        }
        results
    }
}
