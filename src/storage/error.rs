//! Storage error types.

use thiserror::Error;

/// Errors raised by the blob backends, the CAS and the step store
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object or artifact absent
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("Invalid content digest: {0}")]
    InvalidDigest(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error in {location}: {source}")]
    Json {
        location: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error in {location}: {source}")]
    Csv {
        location: String,
        #[source]
        source: csv::Error,
    },

    #[error("{location} is not valid UTF-8")]
    Utf8 { location: String },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            return Self::NotFound(path.into());
        }
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
