//! Ordered batches, read-only requests and their execution-log records.
//!
//! # Log Record Format
//!
//! A log segment is a plain concatenation of `OrderedBatch` records, each
//! encoded with bincode's default (fixed-width, little-endian) options.
//! Every replica writes the same bytes for the same batches, so segment
//! digests agree across replicas.

use crate::codec::CodecError;
use crate::{ClientId, SeqNo};
use serde::{Deserialize, Serialize};

/// One client command inside an ordered batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub client: ClientId,
    pub request_id: u64,
    pub command: Vec<u8>,
}

impl Entry {
    pub fn new(client: ClientId, request_id: u64, command: impl Into<Vec<u8>>) -> Self {
        Self {
            client,
            request_id,
            command: command.into(),
        }
    }
}

/// Values agreed by the ordering layer so every replica sees the same
/// "current time" and randomness for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NonDeterminism {
    pub time: u64,
    pub seed: u64,
}

/// A totally ordered batch of commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedBatch {
    pub seq: SeqNo,
    pub nondeterminism: NonDeterminism,
    pub entries: Vec<Entry>,
    /// The ordering layer wants a log checkpoint after this batch.
    pub take_checkpoint: bool,
}

impl OrderedBatch {
    pub fn new(
        seq: SeqNo,
        nondeterminism: NonDeterminism,
        entries: Vec<Entry>,
        take_checkpoint: bool,
    ) -> Self {
        Self {
            seq,
            nondeterminism,
            entries,
            take_checkpoint,
        }
    }

    /// Append the log record for this batch to a segment buffer.
    pub fn append_record(&self, segment: &mut Vec<u8>) -> Result<(), CodecError> {
        bincode::serialize_into(segment, self).map_err(|e| CodecError::InvalidRecord(e.to_string()))
    }

    /// Decode a whole log segment.
    pub fn decode_segment(mut bytes: &[u8]) -> Result<Vec<OrderedBatch>, CodecError> {
        let mut batches = Vec::new();
        while !bytes.is_empty() {
            let batch: OrderedBatch = bincode::deserialize_from(&mut bytes)
                .map_err(|e| CodecError::InvalidRecord(e.to_string()))?;
            batches.push(batch);
        }
        Ok(batches)
    }
}

/// Metadata handed to the application with each ordered command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub client: ClientId,
    pub request_id: u64,
    pub seq: SeqNo,
    pub time: u64,
    /// Per-command randomness drawn from the batch seed.
    pub random: u64,
    /// This is the final command before a log checkpoint.
    pub last_before_checkpoint: bool,
}

/// A request executed outside the total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadOnlyRequest {
    pub client: ClientId,
    pub request_id: u64,
    pub payload: Vec<u8>,
}
