//! Deterministic ordered-batch workloads for the counter application.

use bulwark_types::{ClientId, Entry, NonDeterminism, OrderedBatch, SeqNo};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Generates batches `1..` from a seed. The same seed always yields the same
/// commands, timestamps and per-batch seeds.
#[derive(Debug)]
pub struct Workload {
    rng: ChaCha8Rng,
    next_seq: u64,
    clients: u32,
    /// Every `log_every` batches the ordering layer asks for a log checkpoint.
    log_every: u64,
}

impl Workload {
    pub fn new(seed: u64, clients: u32, log_every: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            next_seq: 1,
            clients: clients.max(1),
            log_every,
        }
    }

    /// The next batch in the total order.
    pub fn next_batch(&mut self) -> OrderedBatch {
        let seq = self.next_seq;
        self.next_seq += 1;

        let count = self.rng.gen_range(1..=4);
        let entries = (0..count)
            .map(|i| {
                let client = ClientId(self.rng.gen_range(0..self.clients));
                let n: i64 = self.rng.gen_range(-50..=50);
                let command = match self.rng.gen_range(0..10) {
                    0 => format!("set {n}"),
                    1..=4 => format!("sub {}", n.abs()),
                    _ => format!("add {}", n.abs()),
                };
                Entry::new(client, seq * 10 + i, command.into_bytes())
            })
            .collect();

        OrderedBatch::new(
            SeqNo(seq),
            NonDeterminism {
                time: 1_700_000_000_000 + seq * 250,
                seed: self.rng.gen(),
            },
            entries,
            self.log_every > 0 && seq % self.log_every == 0,
        )
    }

    /// The next `n` batches.
    pub fn take(&mut self, n: usize) -> Vec<OrderedBatch> {
        (0..n).map(|_| self.next_batch()).collect()
    }
}
