//! Error type returned by file manager actions.

use std::io;
use std::path::PathBuf;

use records::StoreError;
use thiserror::Error;

use crate::files::{ArchiveError, DecodeError, SandboxError};

/// Failure of a file manager action.
#[derive(Debug, Error)]
pub enum FileOpError {
    /// No user is logged in.
    #[error("not authenticated")]
    Unauthenticated,

    /// The path escapes the storage root.
    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    /// The final path component is unacceptable.
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// Content exceeds the configured size limit.
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    /// The caller does not own the file.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// An archive failed inspection.
    #[error("unsafe archive: {0}")]
    UnsafeArchive(String),

    /// Content could not be decoded in the requested format.
    #[error("invalid content: {0}")]
    InvalidContent(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The record store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Result type alias for file manager actions.
pub type Result<T> = std::result::Result<T, FileOpError>;

impl FileOpError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<SandboxError> for FileOpError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::PathTraversal(msg) => Self::PathTraversal(msg),
            SandboxError::InvalidFilename(msg) => Self::InvalidFilename(msg),
            SandboxError::Root { path, source } => {
                Self::io(format!("storage root {}", path.display()), source)
            }
            SandboxError::Io(source) => Self::io("failed to resolve path", source),
        }
    }
}

impl From<ArchiveError> for FileOpError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::FileTooLarge { size, limit, .. } => Self::TooLarge { size, limit },
            ArchiveError::Io { context, source } => Self::Io { context, source },
            ArchiveError::Zip(zip::result::ZipError::Io(source)) => {
                Self::io("failed to read archive", source)
            }
            other => Self::UnsafeArchive(other.to_string()),
        }
    }
}

impl From<DecodeError> for FileOpError {
    fn from(err: DecodeError) -> Self {
        Self::InvalidContent(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_large_display() {
        let err = FileOpError::TooLarge {
            size: 30,
            limit: 20,
        };
        assert_eq!(
            err.to_string(),
            "file too large: 30 bytes exceeds limit of 20 bytes"
        );
    }

    #[test]
    fn test_sandbox_error_conversion() {
        let err: FileOpError = SandboxError::PathTraversal("../x".to_string()).into();
        assert!(matches!(err, FileOpError::PathTraversal(_)));

        let err: FileOpError = SandboxError::InvalidFilename("too long".to_string()).into();
        assert!(matches!(err, FileOpError::InvalidFilename(_)));
    }

    #[test]
    fn test_archive_error_conversion() {
        let err: FileOpError = ArchiveError::TooManyFiles {
            count: 2000,
            limit: 1000,
        }
        .into();
        assert!(matches!(err, FileOpError::UnsafeArchive(ref msg) if msg.contains("2000")));

        let err: FileOpError = ArchiveError::FileTooLarge {
            path: PathBuf::from("big.bin"),
            size: 30,
            limit: 20,
        }
        .into();
        assert!(matches!(err, FileOpError::TooLarge { size: 30, limit: 20 }));
    }

    #[test]
    fn test_unauthenticated_display() {
        assert_eq!(FileOpError::Unauthenticated.to_string(), "not authenticated");
    }
}
