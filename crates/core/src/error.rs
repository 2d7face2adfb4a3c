//! Storage errors.

use bulwark_types::TokenKind;
use thiserror::Error;

/// Failure of the durable storage backend.
///
/// Absence of a file or range is not an error: reads report it as `None`.
/// Anything surfaced here means the backend could not do what was asked,
/// which is fatal wherever replica state is being written.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {kind:?} file {name}: {source}")]
    Io {
        kind: TokenKind,
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn io(kind: TokenKind, name: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            kind,
            name: name.into(),
            source,
        }
    }
}
