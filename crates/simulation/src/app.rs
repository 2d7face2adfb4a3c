//! Deterministic counter application.
//!
//! Commands are ASCII: `add <n>`, `sub <n>` or `set <n>`. Anything else
//! leaves the value alone but is still folded into the digest, so two
//! replicas only agree if they executed the same commands in the same order
//! with the same [`RequestInfo`].
//!
//! Completions are reported inline: `execute` calls `execution_complete`
//! and `begin_sync` writes `snapshot_<seq>` then calls `sync_complete`
//! before returning.

use bulwark_core::{Application, ApplicationCallbacks, ApplicationError, DurableStorage};
use bulwark_types::{Hash, ReadOnlyRequest, RequestInfo, SeqNo, TokenKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Full application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub value: i64,
    /// Commands executed since genesis.
    pub applied: u64,
    /// Hash chain over every executed command and its request info.
    pub digest: Hash,
}

impl CounterState {
    pub fn encode(&self) -> Result<Vec<u8>, ApplicationError> {
        bincode::serialize(self).map_err(|e| ApplicationError(format!("bad state: {e}")))
    }

    /// An empty snapshot is the initial state.
    pub fn decode(bytes: &[u8]) -> Result<Self, ApplicationError> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        bincode::deserialize(bytes).map_err(|e| ApplicationError(format!("bad snapshot: {e}")))
    }

    fn apply(&mut self, command: &[u8], info: &RequestInfo) {
        let text = std::str::from_utf8(command).unwrap_or_default();
        let mut parts = text.split_whitespace();
        let op = parts.next();
        let arg = parts.next().and_then(|n| n.parse::<i64>().ok());
        match (op, arg) {
            (Some("add"), Some(n)) => self.value = self.value.wrapping_add(n),
            (Some("sub"), Some(n)) => self.value = self.value.wrapping_sub(n),
            (Some("set"), Some(n)) => self.value = n,
            _ => {}
        }

        let mut input = self.digest.as_bytes().to_vec();
        input.extend_from_slice(&(command.len() as u64).to_be_bytes());
        input.extend_from_slice(command);
        input.extend_from_slice(&info.client.0.to_be_bytes());
        input.extend_from_slice(&info.request_id.to_be_bytes());
        input.extend_from_slice(&info.seq.0.to_be_bytes());
        input.extend_from_slice(&info.time.to_be_bytes());
        input.extend_from_slice(&info.random.to_be_bytes());
        self.digest = Hash::from_bytes(&input);
        self.applied += 1;
    }
}

/// Counter state machine. Snapshots live in the replica's own storage.
pub struct CounterApp {
    storage: Arc<dyn DurableStorage>,
    state: RwLock<CounterState>,
    callbacks: RwLock<Option<Arc<dyn ApplicationCallbacks>>>,
    syncs: Mutex<Vec<SeqNo>>,
    loads: Mutex<Vec<SeqNo>>,
    fail_loads: AtomicBool,
}

impl CounterApp {
    pub fn new(storage: Arc<dyn DurableStorage>) -> Self {
        Self {
            storage,
            state: RwLock::default(),
            callbacks: RwLock::default(),
            syncs: Mutex::default(),
            loads: Mutex::default(),
            fail_loads: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> CounterState {
        *self.state.read()
    }

    /// Checkpoints this app was asked to snapshot.
    pub fn syncs(&self) -> Vec<SeqNo> {
        self.syncs.lock().clone()
    }

    /// Checkpoints loaded from snapshots.
    pub fn loads(&self) -> Vec<SeqNo> {
        self.loads.lock().clone()
    }

    /// Make snapshot loads fail.
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    fn callbacks(&self) -> Option<Arc<dyn ApplicationCallbacks>> {
        self.callbacks.read().clone()
    }

    fn write_snapshot(&self, name: &str) -> Result<(), ApplicationError> {
        let bytes = self.state.read().encode()?;
        self.storage
            .replace_file(TokenKind::Snapshot, name, &bytes)
            .map_err(|e| ApplicationError(e.to_string()))
    }
}

impl Application for CounterApp {
    fn attach(&self, callbacks: Arc<dyn ApplicationCallbacks>) {
        *self.callbacks.write() = Some(callbacks);
    }

    fn execute(&self, command: &[u8], info: RequestInfo) {
        let value = {
            let mut state = self.state.write();
            state.apply(command, &info);
            state.value
        };
        trace!(seq = info.seq.0, value, "Executed command");
        if let Some(callbacks) = self.callbacks() {
            callbacks.execution_complete(value.to_be_bytes().to_vec(), info);
        }
    }

    fn execute_read_only(&self, _request: &ReadOnlyRequest) -> Vec<u8> {
        self.state.read().value.to_be_bytes().to_vec()
    }

    fn begin_sync(&self, seq: SeqNo) {
        self.syncs.lock().push(seq);
        let name = TokenKind::Snapshot.file_name(seq);
        // An unreported sync is superseded by the next boundary.
        if let Err(e) = self.write_snapshot(&name) {
            warn!(seq = seq.0, error = %e, "Snapshot write failed");
            return;
        }
        if let Some(callbacks) = self.callbacks() {
            callbacks.sync_complete(seq, name);
        }
    }

    fn load_snapshot(&self, seq: SeqNo, file_name: &str) -> Result<(), ApplicationError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(ApplicationError("simulated load failure".into()));
        }
        let bytes = self
            .storage
            .read_file(TokenKind::Snapshot, file_name)
            .map_err(|e| ApplicationError(e.to_string()))?
            .ok_or_else(|| ApplicationError(format!("snapshot {file_name} missing")))?;
        let state = CounterState::decode(&bytes)?;
        *self.state.write() = state;
        self.loads.lock().push(seq);
        Ok(())
    }
}
