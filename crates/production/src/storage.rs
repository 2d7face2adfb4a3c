//! # Filesystem Storage
//!
//! Production `DurableStorage` over two directories, one for snapshot files
//! and one for log segments.
//!
//! All operations are synchronous blocking I/O. Callers in async contexts
//! should use `spawn_blocking` if needed to avoid blocking the runtime.

use bulwark_core::{DurableStorage, StorageError};
use bulwark_types::TokenKind;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Configuration for [`FileStorage`].
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Directory holding `snapshot_<seq>` files.
    pub snapshot_dir: PathBuf,
    /// Directory holding `log_<seq>` files.
    pub log_dir: PathBuf,
    /// `fsync` after every write. Disable only in tests.
    pub sync_writes: bool,
}

impl FileStorageConfig {
    pub fn new(snapshot_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            log_dir: log_dir.into(),
            sync_writes: true,
        }
    }
}

/// Named byte ranges stored as plain files.
///
/// File names come from `TokenKind::file_name` and never contain path
/// separators, so every file lives directly in its kind's directory.
#[derive(Debug)]
pub struct FileStorage {
    config: FileStorageConfig,
}

impl FileStorage {
    /// Open storage, creating both directories if needed.
    pub fn open(config: FileStorageConfig) -> Result<Self, StorageError> {
        for (kind, dir) in [
            (TokenKind::Snapshot, &config.snapshot_dir),
            (TokenKind::LogSegment, &config.log_dir),
        ] {
            fs::create_dir_all(dir)
                .map_err(|e| StorageError::io(kind, dir.display().to_string(), e))?;
        }
        debug!(
            snapshot_dir = %config.snapshot_dir.display(),
            log_dir = %config.log_dir.display(),
            "Opened file storage"
        );
        Ok(Self { config })
    }

    fn dir(&self, kind: TokenKind) -> &Path {
        match kind {
            TokenKind::Snapshot => &self.config.snapshot_dir,
            TokenKind::LogSegment => &self.config.log_dir,
        }
    }

    fn path(&self, kind: TokenKind, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(StorageError::Backend(format!("invalid file name {name:?}")));
        }
        Ok(self.dir(kind).join(name))
    }

    fn open_for_write(&self, kind: TokenKind, name: &str) -> Result<File, StorageError> {
        let path = self.path(kind, name)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StorageError::io(kind, name, e))
    }

    fn finish_write(&self, kind: TokenKind, name: &str, file: &File) -> Result<(), StorageError> {
        if self.config.sync_writes {
            file.sync_data()
                .map_err(|e| StorageError::io(kind, name, e))?;
        }
        Ok(())
    }
}

impl DurableStorage for FileStorage {
    fn read_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        len: u32,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path(kind, name)?;
        let mut file = match File::open(&path) {
            Ok(f) => f,
            // A concurrent writer may not have created it yet.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(kind, name, e)),
        };

        let file_len = file
            .metadata()
            .map_err(|e| StorageError::io(kind, name, e))?
            .len();
        if offset.saturating_add(len as u64) > file_len {
            trace!(name, offset, len, file_len, "Range beyond end of file");
            return Ok(None);
        }

        let mut buf = vec![0u8; len as usize];
        let read = file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(&mut buf));
        match read {
            Ok(()) => Ok(Some(buf)),
            // Truncated between the length check and the read.
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(StorageError::io(kind, name, e)),
        }
    }

    fn write_range(
        &self,
        kind: TokenKind,
        name: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut file = self.open_for_write(kind, name)?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|e| StorageError::io(kind, name, e))?;
        self.finish_write(kind, name, &file)?;
        trace!(name, offset, len = data.len(), "Wrote range");
        Ok(())
    }

    fn set_len(&self, kind: TokenKind, name: &str, len: u64) -> Result<(), StorageError> {
        let file = self.open_for_write(kind, name)?;
        file.set_len(len)
            .map_err(|e| StorageError::io(kind, name, e))?;
        self.finish_write(kind, name, &file)
    }

    fn file_len(&self, kind: TokenKind, name: &str) -> Result<Option<u64>, StorageError> {
        let path = self.path(kind, name)?;
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(kind, name, e)),
        }
    }

    fn delete_file(&self, kind: TokenKind, name: &str) -> Result<bool, StorageError> {
        let path = self.path(kind, name)?;
        match fs::remove_file(path) {
            Ok(()) => {
                debug!(?kind, name, "Deleted file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(kind, name, e)),
        }
    }
}
