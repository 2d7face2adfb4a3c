//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position of a batch in the total order.
///
/// Batches are numbered from 1. `SeqNo::GENESIS` (0) means nothing has been
/// executed yet.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SeqNo(pub u64);

impl SeqNo {
    pub const GENESIS: SeqNo = SeqNo(0);

    /// The following sequence number.
    pub fn next(self) -> SeqNo {
        SeqNo(self.0 + 1)
    }

    /// Whether this sequence number closes a checkpoint interval.
    pub fn is_checkpoint_boundary(self, interval: u64) -> bool {
        interval > 0 && self.0 > 0 && self.0 % interval == 0
    }
}

impl fmt::Display for SeqNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a replica in the (fixed-size) cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ReplicaId(pub u32);

/// Client identifier carried on every request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ClientId(pub u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_boundary() {
        assert!(!SeqNo(0).is_checkpoint_boundary(100));
        assert!(!SeqNo(99).is_checkpoint_boundary(100));
        assert!(SeqNo(100).is_checkpoint_boundary(100));
        assert!(SeqNo(200).is_checkpoint_boundary(100));
        assert!(!SeqNo(5).is_checkpoint_boundary(0));
    }
}
