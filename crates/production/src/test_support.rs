//! In-crate fakes for unit tests.

use bulwark_core::{
    Application, ApplicationCallbacks, ApplicationError, DurableStorage, FragmentResponse,
    FragmentTransport, OrderingLayer, StorageError,
};
use bulwark_types::{
    ClientId, Entry, Hash, NonDeterminism, OrderedBatch, ReadOnlyRequest, ReplicaId, RequestInfo,
    SeqNo, StateToken, TokenKind,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════
// Storage
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct MemStore {
    files: Mutex<HashMap<(TokenKind, String), Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, kind: TokenKind, name: &str) -> bool {
        self.files.lock().contains_key(&(kind, name.to_string()))
    }

    pub fn get(&self, kind: TokenKind, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(&(kind, name.to_string())).cloned()
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected write failure".into()));
        }
        Ok(())
    }
}

impl DurableStorage for MemStore {
    fn read_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let files = self.files.lock();
        let Some(file) = files.get(&(kind, name.to_string())) else {
            return Ok(None);
        };
        let (start, end) = (offset as usize, offset as usize + len as usize);
        Ok(file.get(start..end).map(|s| s.to_vec()))
    }

    fn write_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut files = self.files.lock();
        let file = files.entry((kind, name.to_string())).or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&self, kind: TokenKind, name: &str, len: u64) -> Result<(), StorageError> {
        self.check_writable()?;
        self.files
            .lock()
            .entry((kind, name.to_string()))
            .or_default()
            .resize(len as usize, 0);
        Ok(())
    }

    fn file_len(&self, kind: TokenKind, name: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .files
            .lock()
            .get(&(kind, name.to_string()))
            .map(|f| f.len() as u64))
    }

    fn delete_file(&self, kind: TokenKind, name: &str) -> Result<bool, StorageError> {
        Ok(self.files.lock().remove(&(kind, name.to_string())).is_some())
    }
}

/// Sparse files: a length plus the extents actually written. A read must
/// match a written extent exactly or fall in a hole, which reads as zeros.
#[derive(Default)]
pub struct SparseStore {
    files: Mutex<HashMap<(TokenKind, String), SparseFile>>,
}

#[derive(Default)]
struct SparseFile {
    len: u64,
    extents: BTreeMap<u64, Vec<u8>>,
}

impl DurableStorage for SparseStore {
    fn read_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let files = self.files.lock();
        let Some(file) = files.get(&(kind, name.to_string())) else {
            return Ok(None);
        };
        if offset + u64::from(len) > file.len {
            return Ok(None);
        }
        Ok(Some(match file.extents.get(&offset) {
            Some(data) => data[..len as usize].to_vec(),
            None => vec![0; len as usize],
        }))
    }

    fn write_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let file = files.entry((kind, name.to_string())).or_default();
        file.len = file.len.max(offset + data.len() as u64);
        file.extents.insert(offset, data.to_vec());
        Ok(())
    }

    fn set_len(&self, kind: TokenKind, name: &str, len: u64) -> Result<(), StorageError> {
        let mut files = self.files.lock();
        let file = files.entry((kind, name.to_string())).or_default();
        file.len = len;
        file.extents.retain(|offset, data| offset + data.len() as u64 <= len);
        Ok(())
    }

    fn file_len(&self, kind: TokenKind, name: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .files
            .lock()
            .get(&(kind, name.to_string()))
            .map(|f| f.len))
    }

    fn delete_file(&self, kind: TokenKind, name: &str) -> Result<bool, StorageError> {
        Ok(self.files.lock().remove(&(kind, name.to_string())).is_some())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
pub struct RecordingTransport {
    requested: Mutex<Vec<Vec<u8>>>,
    returned: Mutex<Vec<(ReplicaId, Vec<u8>, FragmentResponse)>>,
}

impl RecordingTransport {
    pub fn requested(&self) -> Vec<StateToken> {
        self.requested
            .lock()
            .iter()
            .map(|bytes| StateToken::decode(bytes).unwrap())
            .collect()
    }

    pub fn returned(&self) -> Vec<(ReplicaId, Vec<u8>, FragmentResponse)> {
        self.returned.lock().clone()
    }
}

impl FragmentTransport for RecordingTransport {
    fn request_fragment(&self, token: Vec<u8>) {
        self.requested.lock().push(token);
    }

    fn return_fragment(&self, to: ReplicaId, token: Vec<u8>, response: FragmentResponse) {
        self.returned.lock().push((to, token, response));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Ordering Layer
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Ready,
    Pause,
    Resume,
    Reply(RequestInfo),
    ReadOnlyReply(ClientId, u64),
    Checkpoint(SeqNo, Vec<u8>),
}

#[derive(Default)]
pub struct RecordingOrdering {
    signals: Mutex<Vec<Signal>>,
}

impl RecordingOrdering {
    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn count(&self, f: impl Fn(&Signal) -> bool) -> usize {
        self.signals.lock().iter().filter(|s| f(s)).count()
    }

    pub fn checkpoints(&self) -> Vec<(SeqNo, Vec<u8>)> {
        self.signals
            .lock()
            .iter()
            .filter_map(|s| match s {
                Signal::Checkpoint(seq, bytes) => Some((*seq, bytes.clone())),
                _ => None,
            })
            .collect()
    }
}

impl OrderingLayer for RecordingOrdering {
    fn ready_for_requests(&self) {
        self.signals.lock().push(Signal::Ready);
    }

    fn admission_pause(&self) {
        self.signals.lock().push(Signal::Pause);
    }

    fn admission_resume(&self) {
        self.signals.lock().push(Signal::Resume);
    }

    fn deliver_reply(&self, _reply: Vec<u8>, info: RequestInfo) {
        self.signals.lock().push(Signal::Reply(info));
    }

    fn read_only_reply(&self, client: ClientId, request_id: u64, _reply: Vec<u8>) {
        self.signals
            .lock()
            .push(Signal::ReadOnlyReply(client, request_id));
    }

    fn checkpoint_ready(&self, seq: SeqNo, manifest: Vec<u8>) {
        self.signals.lock().push(Signal::Checkpoint(seq, manifest));
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Application
// ═══════════════════════════════════════════════════════════════════════════

/// State is a hash chain over everything executed. Snapshots are the 32
/// chain bytes in `snapshot_<seq>`; an empty file is the initial state.
pub struct ChainApp {
    storage: Arc<dyn DurableStorage>,
    state: Mutex<Hash>,
    syncs: Mutex<Vec<SeqNo>>,
    loaded: Mutex<Vec<(SeqNo, Vec<u8>)>>,
    fail_load: AtomicBool,
}

impl ChainApp {
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage,
            state: Mutex::new(Hash::ZERO),
            syncs: Mutex::default(),
            loaded: Mutex::default(),
            fail_load: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> Hash {
        *self.state.lock()
    }

    pub fn syncs(&self) -> Vec<SeqNo> {
        self.syncs.lock().clone()
    }

    /// Seqs and file contents handed to `load_snapshot`.
    pub fn loaded(&self) -> Vec<(SeqNo, Vec<u8>)> {
        self.loaded.lock().clone()
    }

    pub fn fail_load(&self, fail: bool) {
        self.fail_load.store(fail, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.state.lock().as_bytes().to_vec()
    }

    /// Finish a sync by hand: write the current state to `snapshot_<seq>`
    /// and return the file name.
    pub fn write_snapshot(&self, seq: SeqNo) -> String {
        let name = TokenKind::Snapshot.file_name(seq);
        self.storage
            .replace_file(TokenKind::Snapshot, &name, &self.snapshot())
            .unwrap();
        name
    }
}

impl Application for ChainApp {
    fn attach(&self, _callbacks: Arc<dyn ApplicationCallbacks>) {}

    fn execute(&self, command: &[u8], info: RequestInfo) {
        let mut state = self.state.lock();
        let mut input = state.as_bytes().to_vec();
        input.extend_from_slice(command);
        input.extend_from_slice(&info.seq.0.to_be_bytes());
        input.extend_from_slice(&info.random.to_be_bytes());
        *state = Hash::from_bytes(&input);
    }

    fn execute_read_only(&self, _request: &ReadOnlyRequest) -> Vec<u8> {
        self.snapshot()
    }

    fn begin_sync(&self, seq: SeqNo) {
        self.syncs.lock().push(seq);
    }

    fn load_snapshot(&self, seq: SeqNo, file_name: &str) -> Result<(), ApplicationError> {
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(ApplicationError("injected load failure".into()));
        }
        let snapshot = self
            .storage
            .read_file(TokenKind::Snapshot, file_name)
            .map_err(|e| ApplicationError(e.to_string()))?
            .ok_or_else(|| ApplicationError(format!("{file_name} missing")))?;
        let state = if snapshot.is_empty() {
            Hash::ZERO
        } else {
            Hash::from_slice(&snapshot).map_err(|e| ApplicationError(e.to_string()))?
        };
        *self.state.lock() = state;
        self.loaded.lock().push((seq, snapshot));
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Builders
// ═══════════════════════════════════════════════════════════════════════════

pub fn batch(seq: u64, take_checkpoint: bool) -> OrderedBatch {
    OrderedBatch::new(
        SeqNo(seq),
        NonDeterminism {
            time: seq * 10,
            seed: seq.wrapping_mul(0x9e37_79b9),
        },
        vec![
            Entry::new(ClientId(1), seq, format!("put {seq}").into_bytes()),
            Entry::new(ClientId(2), seq, format!("inc {seq}").into_bytes()),
        ],
        take_checkpoint,
    )
}

/// Encoded log segment holding batches `from..=to`.
pub fn segment(from: u64, to: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    for seq in from..=to {
        batch(seq, seq == to).append_record(&mut bytes).unwrap();
    }
    bytes
}

pub fn log_token(seq: u64, data: &[u8]) -> StateToken {
    StateToken::for_data(TokenKind::LogSegment, SeqNo(seq), 0, data)
}
