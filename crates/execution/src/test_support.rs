//! In-crate fakes for unit tests.

use bulwark_core::{
    Application, ApplicationCallbacks, ApplicationError, DurableStorage, OrderingLayer,
    StorageError,
};
use crate::SharedRecoveryState;
use bulwark_types::{CheckpointManifest, ClientId, ReadOnlyRequest, RequestInfo, SeqNo, TokenKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

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

#[derive(Default)]
pub struct RecordingApp {
    executed: Mutex<Vec<RequestInfo>>,
    syncs: Mutex<Vec<SeqNo>>,
    watched: Option<Arc<SharedRecoveryState>>,
    manifests_at_sync: Mutex<Vec<CheckpointManifest>>,
}

impl RecordingApp {
    /// Record the shared manifest each time a sync starts.
    pub fn watching(shared: Arc<SharedRecoveryState>) -> Self {
        Self {
            watched: Some(shared),
            ..Self::default()
        }
    }

    pub fn executed(&self) -> Vec<RequestInfo> {
        self.executed.lock().clone()
    }

    pub fn syncs(&self) -> Vec<SeqNo> {
        self.syncs.lock().clone()
    }

    pub fn manifests_at_sync(&self) -> Vec<CheckpointManifest> {
        self.manifests_at_sync.lock().clone()
    }
}

impl Application for RecordingApp {
    fn attach(&self, _callbacks: Arc<dyn ApplicationCallbacks>) {}

    fn execute(&self, _command: &[u8], info: RequestInfo) {
        self.executed.lock().push(info);
    }

    fn execute_read_only(&self, request: &ReadOnlyRequest) -> Vec<u8> {
        request.payload.clone()
    }

    fn begin_sync(&self, seq: SeqNo) {
        self.syncs.lock().push(seq);
        if let Some(shared) = &self.watched {
            self.manifests_at_sync.lock().push(shared.manifest());
        }
    }

    fn load_snapshot(&self, _seq: SeqNo, _file_name: &str) -> Result<(), ApplicationError> {
        Ok(())
    }
}
