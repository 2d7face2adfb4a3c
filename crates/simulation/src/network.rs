//! Simulated fragment network with deterministic loss, duplication,
//! corruption, reordering and partitions.

use bulwark_core::{FragmentResponse, FragmentTransport};
use bulwark_types::ReplicaId;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashSet;

/// Configuration for the simulated network.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Messages are dropped with this probability (0.0 - 1.0).
    pub packet_loss_rate: f64,
    /// Delivered messages are sent twice with this probability.
    pub duplicate_rate: f64,
    /// Fragment payloads get one flipped byte with this probability.
    pub corruption_rate: f64,
    /// Shuffle each round of deliveries.
    pub reorder: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            packet_loss_rate: 0.0,
            duplicate_rate: 0.0,
            corruption_rate: 0.0,
            reorder: true,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub dropped_partition: u64,
    pub dropped_loss: u64,
    pub duplicated: u64,
    pub corrupted: u64,
}

/// Decides the fate of every message. All randomness comes from one seeded
/// `ChaCha8Rng`, so a seed always yields the same decisions for the same
/// sequence of calls.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// If (a, b) is in this set, messages from a to b are dropped.
    partitions: HashSet<(ReplicaId, ReplicaId)>,
    rng: ChaCha8Rng,
    stats: NetworkStats,
}

impl SimulatedNetwork {
    pub fn new(config: NetworkConfig, seed: u64) -> Self {
        Self {
            config,
            partitions: HashSet::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            stats: NetworkStats::default(),
        }
    }

    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    // ─── Partition Management ───

    pub fn is_partitioned(&self, from: ReplicaId, to: ReplicaId) -> bool {
        self.partitions.contains(&(from, to))
    }

    pub fn partition_bidirectional(&mut self, a: ReplicaId, b: ReplicaId) {
        self.partitions.insert((a, b));
        self.partitions.insert((b, a));
    }

    /// Cut `node` off from every node in `others`.
    pub fn isolate_node(&mut self, node: ReplicaId, others: &[ReplicaId]) {
        for &other in others {
            if other != node {
                self.partition_bidirectional(node, other);
            }
        }
    }

    pub fn heal_all(&mut self) {
        self.partitions.clear();
    }

    // ─── Delivery Decisions ───

    /// Copies of a message from `from` to `to` that actually arrive: none,
    /// one, or two when duplicated.
    pub fn deliveries(&mut self, from: ReplicaId, to: ReplicaId) -> usize {
        self.stats.sent += 1;
        if self.is_partitioned(from, to) {
            self.stats.dropped_partition += 1;
            return 0;
        }
        if self.roll(self.config.packet_loss_rate) {
            self.stats.dropped_loss += 1;
            return 0;
        }
        let copies = if self.roll(self.config.duplicate_rate) {
            self.stats.duplicated += 1;
            2
        } else {
            1
        };
        self.stats.delivered += copies as u64;
        copies
    }

    /// Maybe flip one byte of a payload in transit.
    pub fn maybe_corrupt(&mut self, data: &mut [u8]) {
        if data.is_empty() || !self.roll(self.config.corruption_rate) {
            return;
        }
        let index = self.rng.gen_range(0..data.len());
        data[index] ^= 0x01;
        self.stats.corrupted += 1;
    }

    /// Shuffle a round of deliveries if reordering is on.
    pub fn reorder<T>(&mut self, messages: &mut [T]) {
        if self.config.reorder {
            messages.shuffle(&mut self.rng);
        }
    }

    fn roll(&mut self, probability: f64) -> bool {
        probability > 0.0 && self.rng.gen::<f64>() < probability
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Loopback Transport
// ═══════════════════════════════════════════════════════════════════════════

/// Outbound fragment traffic of one replica, collected for the runner to
/// route.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    requests: Mutex<Vec<Vec<u8>>>,
    replies: Mutex<Vec<(ReplicaId, Vec<u8>, FragmentResponse)>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the encoded tokens this replica asked for.
    pub fn take_requests(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Drain the answers this replica gave to peers.
    pub fn take_replies(&self) -> Vec<(ReplicaId, Vec<u8>, FragmentResponse)> {
        std::mem::take(&mut *self.replies.lock())
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }
}

impl FragmentTransport for LoopbackTransport {
    fn request_fragment(&self, token: Vec<u8>) {
        self.requests.lock().push(token);
    }

    fn return_fragment(&self, to: ReplicaId, token: Vec<u8>, response: FragmentResponse) {
        self.replies.lock().push((to, token, response));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossy() -> NetworkConfig {
        NetworkConfig {
            packet_loss_rate: 0.3,
            duplicate_rate: 0.3,
            corruption_rate: 0.3,
            reorder: true,
        }
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let decide = |seed| {
            let mut network = SimulatedNetwork::new(lossy(), seed);
            let mut order: Vec<u32> = (0..20).collect();
            network.reorder(&mut order);
            let copies: Vec<usize> = (0..50)
                .map(|_| network.deliveries(ReplicaId(0), ReplicaId(1)))
                .collect();
            (order, copies, network.stats())
        };
        assert_eq!(decide(7), decide(7));
        assert_ne!(decide(7).0, decide(8).0);
    }

    #[test]
    fn test_partition_drops_one_direction_pair() {
        let mut network = SimulatedNetwork::new(NetworkConfig::default(), 1);
        network.isolate_node(ReplicaId(2), &[ReplicaId(0), ReplicaId(1), ReplicaId(2)]);
        assert_eq!(network.deliveries(ReplicaId(2), ReplicaId(0)), 0);
        assert_eq!(network.deliveries(ReplicaId(1), ReplicaId(2)), 0);
        assert_eq!(network.deliveries(ReplicaId(0), ReplicaId(1)), 1);
        assert_eq!(network.stats().dropped_partition, 2);

        network.heal_all();
        assert_eq!(network.deliveries(ReplicaId(2), ReplicaId(0)), 1);
    }

    #[test]
    fn test_corruption_changes_one_byte() {
        let mut network = SimulatedNetwork::new(
            NetworkConfig {
                corruption_rate: 1.0,
                ..NetworkConfig::default()
            },
            3,
        );
        let original = vec![0u8; 16];
        let mut data = original.clone();
        network.maybe_corrupt(&mut data);
        let changed = data.iter().zip(&original).filter(|(a, b)| a != b).count();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_loopback_drains() {
        let transport = LoopbackTransport::new();
        transport.request_fragment(vec![1]);
        transport.return_fragment(ReplicaId(4), vec![2], FragmentResponse::NotAvailable);
        assert_eq!(transport.pending_requests(), 1);
        assert_eq!(transport.take_requests(), vec![vec![1]]);
        assert!(transport.take_requests().is_empty());
        assert_eq!(
            transport.take_replies(),
            vec![(ReplicaId(4), vec![2], FragmentResponse::NotAvailable)]
        );
    }
}
