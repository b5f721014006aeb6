//! Error types for the journal core.

use std::io;
use thiserror::Error;

/// Result type for journal operations.
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur while operating on a journal file.
#[derive(Debug, Error)]
pub enum JournalError {
    /// I/O error from the underlying file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Another process holds the exclusive lock on the journal file.
    #[error("journal file is locked by another process")]
    Busy,

    /// The file header does not carry the expected magic banner.
    #[error("invalid journal header: {message}")]
    BadMagic {
        /// Description of the mismatch.
        message: String,
    },

    /// The write does not fit into the remaining record area.
    ///
    /// Nothing was written. The caller decides whether to [`rollover`] and
    /// retry or to reject the write.
    ///
    /// [`rollover`]: crate::JournalFile::rollover
    #[error(
        "journal requires a rollover (remaining capacity: {remaining}, required: {required})"
    )]
    NeedsRollover {
        /// Bytes left in the record area.
        remaining: u64,
        /// Bytes the rejected batch would have occupied.
        required: u64,
    },

    /// A record would exceed the maximum on-disk record size.
    #[error("record of {size} bytes exceeds the maximum record size of {max} bytes")]
    RecordTooLarge {
        /// Total on-disk size the record would have had.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// Caller-supplied bytes do not contain a record.
    #[error("the provided bytes do not contain a valid record")]
    InvalidSource,

    /// The journal was already closed.
    #[error("journal is closed")]
    Closed,
}

impl JournalError {
    /// Creates a bad-magic error.
    pub fn bad_magic(message: impl Into<String>) -> Self {
        Self::BadMagic {
            message: message.into(),
        }
    }
}
