//! In-memory storage for simulation.
//!
//! Behaves like the filesystem storage (exact ranges, zero-filled gaps,
//! `None` for anything missing or short) with injectable write failures.

use bulwark_core::{DurableStorage, StorageError};
use bulwark_types::TokenKind;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory named byte ranges.
#[derive(Debug, Default)]
pub struct SimStorage {
    files: RwLock<BTreeMap<(TokenKind, String), Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl SimStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until turned off again.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful mutating calls.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Names of the files of `kind`, sorted.
    pub fn file_names(&self, kind: TokenKind) -> Vec<String> {
        self.files
            .read()
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn contains(&self, kind: TokenKind, name: &str) -> bool {
        self.files.read().contains_key(&(kind, name.to_string()))
    }

    /// Overwrite one byte in place, for corruption tests. Returns whether
    /// the byte existed.
    pub fn corrupt_byte(&self, kind: TokenKind, name: &str, offset: usize) -> bool {
        match self
            .files
            .write()
            .get_mut(&(kind, name.to_string()))
            .and_then(|file| file.get_mut(offset))
        {
            Some(byte) => {
                *byte ^= 0xff;
                true
            }
            None => false,
        }
    }

    fn begin_write(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("simulated write failure".into()));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl DurableStorage for SimStorage {
    fn read_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let files = self.files.read();
        let Some(file) = files.get(&(kind, name.to_string())) else {
            return Ok(None);
        };
        let Some(end) = offset.checked_add(len as u64) else {
            return Ok(None);
        };
        Ok(file.get(offset as usize..end as usize).map(<[u8]>::to_vec))
    }

    fn write_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.begin_write()?;
        let mut files = self.files.write();
        let file = files.entry((kind, name.to_string())).or_default();
        let start = offset as usize;
        let end = start + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[start..end].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&self, kind: TokenKind, name: &str, len: u64) -> Result<(), StorageError> {
        self.begin_write()?;
        self.files
            .write()
            .entry((kind, name.to_string()))
            .or_default()
            .resize(len as usize, 0);
        Ok(())
    }

    fn file_len(&self, kind: TokenKind, name: &str) -> Result<Option<u64>, StorageError> {
        Ok(self
            .files
            .read()
            .get(&(kind, name.to_string()))
            .map(|f| f.len() as u64))
    }

    fn delete_file(&self, kind: TokenKind, name: &str) -> Result<bool, StorageError> {
        self.begin_write()?;
        Ok(self.files.write().remove(&(kind, name.to_string())).is_some())
    }
}
