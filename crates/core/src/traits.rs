//! Traits implemented by the collaborators of the core.

use crate::StorageError;
use bulwark_types::{ClientId, ReadOnlyRequest, ReplicaId, RequestInfo, SeqNo, TokenKind};
use std::sync::Arc;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════
// Application
// ═══════════════════════════════════════════════════════════════════════════

/// Error reported by the application when it cannot load a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("application error: {0}")]
pub struct ApplicationError(pub String);

/// Sink for the application's asynchronous completions.
///
/// Implemented by the replica handle; the application calls these from any
/// thread once an `execute` or `begin_sync` finishes.
pub trait ApplicationCallbacks: Send + Sync {
    fn execution_complete(&self, reply: Vec<u8>, info: RequestInfo);

    /// The snapshot requested by `begin_sync(seq)` has been written to
    /// `file_name` in the snapshot namespace of the shared storage.
    fn sync_complete(&self, seq: SeqNo, file_name: String);
}

/// The replicated state machine.
///
/// `execute` must depend only on the command and the supplied
/// `RequestInfo` so that replay reproduces the original state.
pub trait Application: Send + Sync {
    /// Register where completions go. Called once when the replica is built.
    fn attach(&self, callbacks: Arc<dyn ApplicationCallbacks>);

    /// Apply an ordered command. The reply comes back through
    /// `ApplicationCallbacks::execution_complete`.
    fn execute(&self, command: &[u8], info: RequestInfo);

    /// Run a read-only request against current state.
    fn execute_read_only(&self, request: &ReadOnlyRequest) -> Vec<u8>;

    /// Start writing a snapshot of the state after `seq` to
    /// `TokenKind::Snapshot.file_name(seq)` in the shared storage.
    fn begin_sync(&self, seq: SeqNo);

    /// Replace the whole state with the assembled snapshot file `file_name`
    /// in the snapshot namespace. A zero-length file is the initial state.
    fn load_snapshot(&self, seq: SeqNo, file_name: &str) -> Result<(), ApplicationError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Durable Storage
// ═══════════════════════════════════════════════════════════════════════════

/// Named byte ranges, one namespace per token kind.
pub trait DurableStorage: Send + Sync {
    /// Read exactly `len` bytes at `offset`. `None` if the file is missing
    /// or shorter than the range.
    fn read_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write `data` at `offset`, creating the file and zero-filling any gap.
    fn write_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Truncate or extend a file, creating it if needed.
    fn set_len(&self, kind: TokenKind, name: &str, len: u64) -> Result<(), StorageError>;

    /// Length of a file, `None` if it does not exist.
    fn file_len(&self, kind: TokenKind, name: &str) -> Result<Option<u64>, StorageError>;

    /// Remove a file. Returns whether it existed.
    fn delete_file(&self, kind: TokenKind, name: &str) -> Result<bool, StorageError>;

    /// Read a whole file in one range. Only for files under 4 GiB.
    fn read_file(&self, kind: TokenKind, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match self.file_len(kind, name)? {
            Some(len) => {
                let len = u32::try_from(len).map_err(|_| {
                    StorageError::Backend(format!("{name} too large to read at once ({len} bytes)"))
                })?;
                self.read_range(kind, name, 0, len)
            }
            None => Ok(None),
        }
    }

    /// Replace a file's contents.
    fn replace_file(&self, kind: TokenKind, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.set_len(kind, name, 0)?;
        self.write_range(kind, name, 0, data)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════

/// Answer to a peer's fragment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentResponse {
    /// The exact bytes of the requested range, unvalidated.
    Data(Vec<u8>),
    /// The file or range is not held locally.
    NotAvailable,
}

/// Outbound half of fragment exchange. Authentication is the transport's
/// concern; the core only sees encoded tokens and raw bytes.
pub trait FragmentTransport: Send + Sync {
    /// Ask peers for the range described by an encoded token.
    fn request_fragment(&self, token: Vec<u8>);

    /// Answer a request from `to`, echoing the encoded token.
    fn return_fragment(&self, to: ReplicaId, token: Vec<u8>, response: FragmentResponse);
}

// ═══════════════════════════════════════════════════════════════════════════
// Ordering Layer
// ═══════════════════════════════════════════════════════════════════════════

/// Signals from the core to the ordering protocol.
pub trait OrderingLayer: Send + Sync {
    /// Recovery finished; ordered work may flow again.
    fn ready_for_requests(&self);

    /// The execution queue is over its threshold.
    fn admission_pause(&self);

    /// The execution queue drained below its threshold.
    fn admission_resume(&self);

    /// Reply to an ordered request.
    fn deliver_reply(&self, reply: Vec<u8>, info: RequestInfo);

    /// Reply to a read-only request.
    fn read_only_reply(&self, client: ClientId, request_id: u64, reply: Vec<u8>);

    /// A new encoded manifest covering state up to `seq` is durable.
    fn checkpoint_ready(&self, seq: SeqNo, manifest: Vec<u8>);
}
