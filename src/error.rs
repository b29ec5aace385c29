//! Error types for the txnlens engine.
//!
//! One error enum covers the local store, the ingestion pipeline, the
//! resumable transfer protocol and the mode orchestrator. The variants are
//! grouped by how a caller is expected to react: validation failures are
//! surfaced as-is, quota and busy conditions drive degradation or retry, and
//! transfer failures are retried one part at a time.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The primary error type for txnlens operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed parameters (init arguments, part indices, predicates).
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A resume attempt whose local file no longer matches the session.
    #[error(
        "Resume refused for upload {upload_id}: local file is {local} but session expects {session}"
    )]
    ResumeMismatch {
        upload_id: String,
        local: TransferShape,
        session: TransferShape,
    },

    /// Local persistent storage is full.
    #[error("Storage quota exceeded: {message} (free space, ingest a smaller file, or switch to remote mode)")]
    QuotaExceeded { message: String },

    /// The underlying store is momentarily locked or contended.
    #[error("Storage busy: {message} (retry shortly)")]
    StorageBusy { message: String },

    /// The host has no usable persistent local storage.
    #[error("Storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// A part upload or completion request failed.
    #[error("Transfer error{}: {message}", describe_context(.context))]
    Transfer {
        message: String,
        context: Option<TransferContext>,
    },

    /// Completion was requested while parts are still missing.
    #[error("Upload {upload_id} is missing parts {missing:?}")]
    MissingParts { upload_id: String, missing: Vec<u32> },

    /// The input yielded no usable rows at all.
    #[error(
        "Input is empty or unparseable: {rows_seen} rows read, {rows_skipped} skipped (check the file is a CSV with a header row and a timestamp column)"
    )]
    EmptyOrUnparseableInput { rows_seen: u64, rows_skipped: u64 },

    /// A referenced session, object or dataset does not exist.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// A read or write was pinned to a generation that has since been replaced.
    #[error("Stale generation {expected} (current generation is {current})")]
    StaleGeneration { expected: u64, current: u64 },

    /// Operation cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error, with the path involved when known
    #[error("I/O error{}: {source}", describe_path(.path))]
    Io {
        #[source]
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Arrow encoding or decoding error
    #[error("Arrow error: {message}")]
    Arrow { message: String },

    /// CSV reader error that is not a row-level problem
    #[error("CSV error: {message}")]
    Csv { message: String },

    /// JSON (de)serialization error
    #[error("JSON error: {message}")]
    Json { message: String },

    /// Internal error (bug in the engine)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Declared size and chunk size of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferShape {
    pub size_bytes: u64,
    pub chunk_size_bytes: u64,
}

impl fmt::Display for TransferShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bytes in {}-byte chunks",
            self.size_bytes, self.chunk_size_bytes
        )
    }
}

/// Where in a transfer an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferContext {
    pub upload_id: String,
    pub part: Option<u32>,
    pub byte_range: Option<(u64, u64)>,
}

impl fmt::Display for TransferContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload {}", self.upload_id)?;
        if let Some(part) = self.part {
            write!(f, ", part {part}")?;
        }
        if let Some((start, end)) = self.byte_range {
            write!(f, ", bytes {start}..{end}")?;
        }
        Ok(())
    }
}

fn describe_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| format!(" at {}", p.display()))
        .unwrap_or_default()
}

fn describe_context(context: &Option<TransferContext>) -> String {
    context
        .as_ref()
        .map(|c| format!(" ({c})"))
        .unwrap_or_default()
}

impl EngineError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a quota exceeded error.
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// Create a storage busy error.
    pub fn storage_busy(message: impl Into<String>) -> Self {
        Self::StorageBusy {
            message: message.into(),
        }
    }

    /// Create a storage unavailable error.
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            message: message.into(),
        }
    }

    /// Create a transfer error without location context.
    pub fn transfer(message: impl Into<String>) -> Self {
        Self::Transfer {
            message: message.into(),
            context: None,
        }
    }

    /// Create a transfer error tied to an upload, and optionally a part.
    pub fn transfer_at(
        message: impl Into<String>,
        upload_id: impl Into<String>,
        part: Option<u32>,
        byte_range: Option<(u64, u64)>,
    ) -> Self {
        Self::Transfer {
            message: message.into(),
            context: Some(TransferContext {
                upload_id: upload_id.into(),
                part,
                byte_range,
            }),
        }
    }

    /// Create a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a CSV error.
    pub fn csv(message: impl Into<String>) -> Self {
        Self::Csv {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classify an I/O error raised while touching `path`.
    ///
    /// Full disks and exhausted quotas become [`EngineError::QuotaExceeded`],
    /// lock contention becomes [`EngineError::StorageBusy`]; everything else
    /// stays a plain I/O error.
    pub fn from_storage_io(err: std::io::Error, path: &Path) -> Self {
        use std::io::ErrorKind;

        let message = format!("{}: {err}", path.display());
        match err.kind() {
            ErrorKind::StorageFull | ErrorKind::FileTooLarge => Self::quota_exceeded(message),
            ErrorKind::ResourceBusy
            | ErrorKind::WouldBlock
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut => Self::storage_busy(message),
            _ => Self::Io {
                source: err,
                path: Some(path.to_path_buf()),
            },
        }
    }

    /// Whether the failed operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageBusy { .. } | Self::Transfer { .. })
    }

    /// Stable snake_case code for this error, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::ResumeMismatch { .. } => "resume_mismatch",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::StorageBusy { .. } => "storage_busy",
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::Transfer { .. } => "transfer",
            Self::MissingParts { .. } => "missing_parts",
            Self::EmptyOrUnparseableInput { .. } => "empty_or_unparseable_input",
            Self::NotFound { .. } => "not_found",
            Self::StaleGeneration { .. } => "stale_generation",
            Self::Cancelled => "cancelled",
            Self::Io { .. } => "io",
            Self::Arrow { .. } => "arrow",
            Self::Csv { .. } => "csv",
            Self::Json { .. } => "json",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }
}

impl From<arrow::error::ArrowError> for EngineError {
    fn from(err: arrow::error::ArrowError) -> Self {
        Self::Arrow {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json {
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::internal(format!("background task failed: {err}"))
    }
}

/// Result type alias for txnlens operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::validation("chunk size too small");
        assert_eq!(err.to_string(), "Validation error: chunk size too small");
    }

    #[test]
    fn test_transfer_error_context() {
        let err = EngineError::transfer_at("connection reset", "abc", Some(3), Some((10, 20)));
        assert_eq!(
            err.to_string(),
            "Transfer error (upload abc, part 3, bytes 10..20): connection reset"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_io_classification() {
        let path = Path::new("/data/store");
        let full = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space");
        assert!(matches!(
            EngineError::from_storage_io(full, path),
            EngineError::QuotaExceeded { .. }
        ));

        let busy = std::io::Error::new(std::io::ErrorKind::WouldBlock, "locked");
        let err = EngineError::from_storage_io(busy, path);
        assert!(matches!(err, EngineError::StorageBusy { .. }));
        assert!(err.is_retryable());

        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = EngineError::from_storage_io(other, path);
        assert!(matches!(err, EngineError::Io { path: Some(_), .. }));
        assert_eq!(err.to_string(), "I/O error at /data/store: gone");
    }

    #[test]
    fn test_quota_and_busy_messages_differ() {
        let quota = EngineError::quota_exceeded("store full").to_string();
        let busy = EngineError::storage_busy("locked").to_string();
        assert!(quota.contains("free space"));
        assert!(busy.contains("retry"));
        assert_ne!(quota, busy);
    }

    #[test]
    fn test_resume_mismatch_display() {
        let err = EngineError::ResumeMismatch {
            upload_id: "u1".into(),
            local: TransferShape {
                size_bytes: 10,
                chunk_size_bytes: 5,
            },
            session: TransferShape {
                size_bytes: 12,
                chunk_size_bytes: 5,
            },
        };
        assert!(err.to_string().contains("u1"));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "resume_mismatch");
    }
}
