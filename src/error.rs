//! # Error Taxonomy
//!
//! The store distinguishes four failure classes so callers can react to each
//! correctly instead of treating every error as disk corruption:
//!
//! - [`StorageError::Io`]: the underlying file I/O failed while loading or
//!   flushing. Retryable: a failed flush leaves the affected pages dirty, so
//!   no data is lost and a later `force()` can try again.
//! - [`StorageError::CorruptRecord`]: the bytes at an offset cannot be decoded.
//!   Not automatically recoverable; the store should be treated as
//!   untrustworthy from that offset onward.
//! - [`StorageError::LockDiscipline`]: an operation was invoked without the
//!   lock it requires. A programming error in the caller, reported distinctly
//!   so operators do not misdiagnose a locking bug as corruption.
//! - [`StorageError::Closed`]: any operation after `close()`.
//!
//! Errors are raised as the root cause of an `eyre::Report`, so callers can
//! recover the class with `report.downcast_ref::<StorageError>()`. The store
//! never retries internally and never swallows an error.

use thiserror::Error;

/// Failure classes of the append store and its storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying file I/O failed while loading or flushing pages.
    #[error("storage I/O failure while {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The bytes at `offset` do not decode into a record.
    ///
    /// Raised when an offset is not actually a record boundary, when the file
    /// is truncated mid-record, or when the codec rejects the payload.
    #[error("corrupt record at offset {offset}: {detail}")]
    CorruptRecord { offset: u64, detail: String },

    /// An operation was invoked without the lock the protocol requires.
    #[error("lock discipline violation: {0}")]
    LockDiscipline(String),

    /// The store was closed; only a second, idempotent `close()` is valid.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Wraps an `std::io::Error` with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }

    /// Builds a corrupt-record error for the record starting at `offset`.
    pub fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        StorageError::CorruptRecord {
            offset,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_through_eyre_report() {
        let report: eyre::Report = StorageError::Closed.into();

        let err = report.downcast_ref::<StorageError>().unwrap();
        assert!(matches!(err, StorageError::Closed));
    }

    #[test]
    fn io_error_preserves_source() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = StorageError::io("flushing page 3", inner);

        assert!(err.to_string().contains("flushing page 3"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("disk on fire"));
    }

    #[test]
    fn corrupt_record_reports_offset() {
        let err = StorageError::corrupt(4096, "length prefix exceeds file size");

        assert!(err.to_string().contains("4096"));
        assert!(err.to_string().contains("length prefix"));
    }
}
