//! Fixed-size replica bitfield.

use crate::ReplicaId;
use serde::{Deserialize, Serialize};

/// One bit per replica of a fixed-size cluster.
///
/// Bits are only ever set. `set` reports whether the bit was newly set so
/// callers can maintain a cached count without recounting.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SupportBitfield {
    bits: Vec<u64>,
    len: usize,
}

impl SupportBitfield {
    /// A bitfield for `len` replicas with no bits set.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of replicas this bitfield covers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the bit for `replica`. Returns `false` when it was already set or
    /// the replica is outside the cluster.
    pub fn set(&mut self, replica: ReplicaId) -> bool {
        let index = replica.0 as usize;
        if index >= self.len {
            return false;
        }
        let (word, mask) = (index / 64, 1u64 << (index % 64));
        if self.bits[word] & mask != 0 {
            return false;
        }
        self.bits[word] |= mask;
        true
    }

    pub fn is_set(&self, replica: ReplicaId) -> bool {
        let index = replica.0 as usize;
        index < self.len && self.bits[index / 64] & (1u64 << (index % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Replicas whose bit is set, ascending.
    pub fn iter(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.len as u32)
            .map(ReplicaId)
            .filter(|r| self.is_set(*r))
    }
}
