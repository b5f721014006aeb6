//! # Transaction Journal Core
//!
//! A crash-safe, append-only transaction journal backed by a single
//! pre-allocated file that is reused cyclically.
//!
//! The journal persists opaque record payloads (transaction state entries)
//! so that an external transaction manager can recover after a crash during
//! commit or rollback. It provides:
//!
//! - a self-delimiting record format a scanner can resynchronize into from
//!   any byte position, with CRC32 payload verification
//! - exclusive file locking, pre-allocation, append-point discovery on
//!   open, and explicit rollover back to the start of the file
//! - two-generation read-back: records of the previous and the current
//!   cycle, with older remnants skipped
//!
//! ## Example
//!
//! ```no_run
//! use txjournal_core::JournalFile;
//!
//! # fn main() -> txjournal_core::JournalResult<()> {
//! let journal = JournalFile::open("transactions.journal", 4 * 1024 * 1024)?;
//!
//! let mut record = journal.create_empty_record();
//! record.create_empty_payload(5)?.copy_from_slice(b"hello");
//! journal.write(&mut [record])?;
//! journal.force()?;
//!
//! for record in journal.read_all(false) {
//!     println!("recovered {} bytes", record.payload().len());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod journal;
mod types;

pub use config::{JournalOptions, DEFAULT_JOURNAL_SIZE};
pub use error::{JournalError, JournalResult};
pub use journal::{
    required_bytes, JournalFile, JournalRecord, JournalRecords, FIXED_HEADER_SIZE,
    MAX_RECORD_SIZE, RECORD_CRC32_OFFSET, RECORD_HEADER_SIZE, RECORD_LENGTH_OFFSET,
    RECORD_OVERHEAD, RECORD_TRAILER_SIZE,
};
pub use types::GenerationId;

pub use txjournal_buffers::{BufferProvider, HeapBufferProvider, PooledBufferProvider};
