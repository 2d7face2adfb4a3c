//! Execution log: ordered batches buffered until the next log checkpoint.

use bulwark_core::{DurableStorage, StorageError};
use bulwark_types::{CodecError, OrderedBatch, SeqNo, StateToken, TokenKind};
use std::sync::Arc;
use tracing::debug;

/// Buffers log records for the current segment and writes them out as
/// `log_<seq>` when the ordering layer asks for a checkpoint.
pub struct BatchLog {
    storage: Arc<dyn DurableStorage>,
    buffer: Vec<u8>,
    batches: usize,
}

impl BatchLog {
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage,
            buffer: Vec::new(),
            batches: 0,
        }
    }

    pub fn append(&mut self, batch: &OrderedBatch) -> Result<(), CodecError> {
        batch.append_record(&mut self.buffer)?;
        self.batches += 1;
        Ok(())
    }

    /// Batches buffered since the last flush.
    pub fn pending(&self) -> usize {
        self.batches
    }

    /// Write the buffered segment as the log file for `seq` and start a new
    /// one. Returns the token describing the whole file.
    pub fn flush(&mut self, seq: SeqNo) -> Result<StateToken, StorageError> {
        let data = std::mem::take(&mut self.buffer);
        let batches = std::mem::take(&mut self.batches);
        let name = TokenKind::LogSegment.file_name(seq);
        self.storage
            .replace_file(TokenKind::LogSegment, &name, &data)?;
        debug!(seq = seq.0, batches, bytes = data.len(), "Flushed log segment");
        Ok(StateToken::for_data(TokenKind::LogSegment, seq, 0, &data))
    }

    /// Drop everything buffered but not yet flushed.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.batches = 0;
    }
}

/// Why a log segment could not be read back.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("log segment {0} missing or shorter than its token")]
    Missing(String),

    #[error("log segment {name} is corrupt: {source}")]
    Corrupt {
        name: String,
        #[source]
        source: CodecError,
    },
}

/// Read and decode the segment a log token describes.
pub fn read_segment(
    storage: &dyn DurableStorage,
    token: &StateToken,
) -> Result<Vec<OrderedBatch>, SegmentError> {
    let name = token.file_name();
    let data = storage
        .read_range(TokenKind::LogSegment, &name, token.offset(), token.length())?
        .ok_or_else(|| SegmentError::Missing(name.clone()))?;
    OrderedBatch::decode_segment(&data).map_err(|source| SegmentError::Corrupt { name, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemStore;
    use bulwark_types::{ClientId, Entry, NonDeterminism};
    use tracing_test::traced_test;

    fn batch(seq: u64) -> OrderedBatch {
        OrderedBatch::new(
            SeqNo(seq),
            NonDeterminism { time: 1, seed: seq },
            vec![Entry::new(ClientId(0), seq, vec![seq as u8; 3])],
            false,
        )
    }

    #[traced_test]
    #[test]
    fn test_flush_writes_segment_and_resets_buffer() {
        let store = Arc::new(MemStore::default());
        let mut log = BatchLog::new(store.clone());
        log.append(&batch(1)).unwrap();
        log.append(&batch(2)).unwrap();
        assert_eq!(log.pending(), 2);

        let token = log.flush(SeqNo(2)).unwrap();
        assert_eq!(token.kind(), TokenKind::LogSegment);
        assert_eq!(token.seq(), SeqNo(2));
        assert_eq!(token.offset(), 0);
        assert_eq!(log.pending(), 0);
        assert_eq!(read_segment(store.as_ref(), &token).unwrap(), vec![batch(1), batch(2)]);

        log.append(&batch(3)).unwrap();
        let next = log.flush(SeqNo(3)).unwrap();
        assert_eq!(read_segment(store.as_ref(), &next).unwrap(), vec![batch(3)]);
        assert!(logs_contain("Flushed log segment"));
    }

    #[test]
    fn test_clear_drops_unflushed_batches() {
        let store = Arc::new(MemStore::default());
        let mut log = BatchLog::new(store.clone());
        log.append(&batch(1)).unwrap();
        log.clear();
        let token = log.flush(SeqNo(1)).unwrap();
        assert_eq!(token.length(), 0);
        assert!(read_segment(store.as_ref(), &token).unwrap().is_empty());
    }

    #[test]
    fn test_missing_segment() {
        let store = MemStore::default();
        let token = StateToken::for_data(TokenKind::LogSegment, SeqNo(5), 0, b"abc");
        assert!(matches!(
            read_segment(&store, &token),
            Err(SegmentError::Missing(_))
        ));
    }
}
