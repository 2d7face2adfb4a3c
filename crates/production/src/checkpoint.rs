//! Checkpoint publication and release.
//!
//! When the application finishes writing the snapshot it was asked for at a
//! checkpoint boundary, `snapshot_<seq>` is read back range by range, split
//! into fixed-size tokens and adopted as the new manifest. The ordering layer
//! hears about every new manifest through `checkpoint_ready` and hands old
//! ones back through `release` once no peer can still need them.

use crate::metrics;
use bulwark_core::{DurableStorage, OrderingLayer, StorageError};
use bulwark_execution::SharedRecoveryState;
use bulwark_types::{CheckpointManifest, CodecError, SeqNo, StateToken, TokenKind};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration for checkpoint publication.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Bytes of snapshot covered by one token.
    pub snapshot_chunk_size: usize,
    /// Released manifests kept before the oldest is garbage-collected.
    pub retained_checkpoints: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            snapshot_chunk_size: 1024 * 1024,
            retained_checkpoints: 2,
        }
    }
}

/// Failure to publish a checkpoint. Always fatal.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to read snapshot: {0}")]
    Storage(#[from] StorageError),

    #[error("sync for {seq} reported {actual}, expected {expected}")]
    UnexpectedFile {
        seq: u64,
        expected: String,
        actual: String,
    },

    #[error("snapshot file {0} is missing or shorter than its length")]
    MissingSnapshot(String),

    #[error("checkpoint manifest rejected: {0}")]
    Manifest(#[from] CodecError),
}

/// Split `snapshot_<seq>` into tokens of at most `chunk_size` bytes,
/// reading one range per token. An empty file still gets one zero-length
/// token.
pub fn tokenize_snapshot(
    storage: &dyn DurableStorage,
    seq: SeqNo,
    chunk_size: usize,
) -> Result<Vec<StateToken>, CheckpointError> {
    let name = TokenKind::Snapshot.file_name(seq);
    let missing = || CheckpointError::MissingSnapshot(name.clone());
    let len = storage
        .file_len(TokenKind::Snapshot, &name)?
        .ok_or_else(missing)?;
    if len == 0 {
        return Ok(vec![StateToken::for_data(TokenKind::Snapshot, seq, 0, &[])]);
    }

    let chunk = u64::try_from(chunk_size.max(1))
        .unwrap_or(u64::MAX)
        .min(u64::from(u32::MAX));
    let mut tokens = Vec::new();
    let mut offset = 0;
    while offset < len {
        // Bounded by `chunk`, which fits in u32.
        let n = (len - offset).min(chunk) as u32;
        let data = storage
            .read_range(TokenKind::Snapshot, &name, offset, n)?
            .ok_or_else(missing)?;
        tokens.push(StateToken::for_data(TokenKind::Snapshot, seq, offset, &data));
        offset += u64::from(n);
    }
    Ok(tokens)
}

pub struct CheckpointPublisher {
    config: CheckpointConfig,
    storage: Arc<dyn DurableStorage>,
    shared: Arc<SharedRecoveryState>,
    ordering: Arc<dyn OrderingLayer>,
    released: VecDeque<CheckpointManifest>,
}

impl CheckpointPublisher {
    pub fn new(
        config: CheckpointConfig,
        storage: Arc<dyn DurableStorage>,
        shared: Arc<SharedRecoveryState>,
        ordering: Arc<dyn OrderingLayer>,
    ) -> Self {
        Self {
            config,
            storage,
            shared,
            ordering,
            released: VecDeque::new(),
        }
    }

    /// Tokenize and publish the snapshot the application wrote for `seq`.
    ///
    /// Returns `None` without touching storage if `seq` is not the sync in
    /// progress (superseded by a newer boundary or by recovery).
    pub fn on_sync_complete(
        &mut self,
        seq: SeqNo,
        file_name: &str,
    ) -> Result<Option<CheckpointManifest>, CheckpointError> {
        if !self.shared.finish_sync(seq) {
            debug!(seq = seq.0, "Ignoring stale sync completion");
            return Ok(None);
        }

        let expected = TokenKind::Snapshot.file_name(seq);
        if file_name != expected {
            return Err(CheckpointError::UnexpectedFile {
                seq: seq.0,
                expected,
                actual: file_name.to_string(),
            });
        }
        let tokens = tokenize_snapshot(self.storage.as_ref(), seq, self.config.snapshot_chunk_size)?;
        let bytes: u64 = tokens.iter().map(|t| u64::from(t.length())).sum();
        let manifest = self.shared.publish_checkpoint(seq, tokens)?;

        metrics::record_checkpoint_published(seq.0);
        info!(
            seq = seq.0,
            bytes,
            %manifest,
            "Checkpoint published"
        );
        self.ordering.checkpoint_ready(seq, manifest.encode());
        Ok(Some(manifest))
    }

    /// Queue a manifest the ordering layer no longer needs and collect the
    /// oldest ones beyond the retention limit. Returns how many files were
    /// deleted.
    pub fn release(&mut self, encoded: &[u8]) -> Result<usize, StorageError> {
        let manifest = match CheckpointManifest::decode(encoded) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable released manifest");
                return Ok(0);
            }
        };
        debug!(%manifest, queued = self.released.len() + 1, "Manifest released");
        self.released.push_back(manifest);

        let mut deleted = 0;
        while self.released.len() > self.config.retained_checkpoints {
            if let Some(oldest) = self.released.pop_front() {
                deleted += self.collect(&oldest)?;
            }
        }
        Ok(deleted)
    }

    /// Number of released manifests still retained.
    pub fn retained(&self) -> usize {
        self.released.len()
    }

    /// Delete what `manifest` references and the current manifest no
    /// longer needs.
    fn collect(&self, manifest: &CheckpointManifest) -> Result<usize, StorageError> {
        let current = self.shared.manifest().checkpoint_seq();
        let mut deleted = 0;

        if manifest.checkpoint_seq() < current {
            let name = TokenKind::Snapshot.file_name(manifest.checkpoint_seq());
            if self.storage.delete_file(TokenKind::Snapshot, &name)? {
                deleted += 1;
            }
        }
        for token in manifest.log_tokens() {
            if token.seq() <= current
                && self
                    .storage
                    .delete_file(TokenKind::LogSegment, &token.file_name())?
            {
                deleted += 1;
            }
        }

        metrics::record_checkpoint_collected();
        debug!(
            checkpoint = manifest.checkpoint_seq().0,
            current = current.0,
            deleted,
            "Collected released manifest"
        );
        Ok(deleted)
    }
}
