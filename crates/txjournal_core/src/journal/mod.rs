//! The rolling journal: record framing, scanning, and the journal file.
//!
//! The journal is a single pre-allocated file that is reused cyclically.
//! Records are appended until the record area runs out, then an explicit
//! rollover erases the tail, rotates the generation ids and resets the
//! append point to the start of the record area.
//!
//! ## Record format
//!
//! All integers are big-endian. Offsets from the start of a record:
//!
//! ```text
//! | prefix (5) | generation (16) | length (4) | crc32 (4) | suffix (2) |
//! | payload (length bytes) | trailer mark (2) | generation (16) |
//! ```
//!
//! The literal markers are `\r\nLR[`, `][` and `]-`. `length` counts the
//! payload bytes only; `crc32` covers the payload bytes only. The
//! generation id appears twice and both copies must match, so neither half
//! of a torn write parses as a record.
//!
//! ## File format
//!
//! ```text
//! | file header (1024) | record area ... |
//! ```
//!
//! The file header carries a magic banner beginning with
//! `BTM-NTJ-[Version 1.0]`, the previous generation id, the current
//! generation id and space padding. Records written during the current
//! cycle are stamped with the current id, records surviving from the cycle
//! before with the previous id; anything older is stale and skipped by
//! scans.

mod file;
mod record;
mod scanner;

pub use file::{JournalFile, JournalRecords, FIXED_HEADER_SIZE};
pub use record::{
    required_bytes, JournalRecord, MAX_RECORD_SIZE, RECORD_CRC32_OFFSET, RECORD_HEADER_SIZE,
    RECORD_LENGTH_OFFSET, RECORD_OVERHEAD, RECORD_TRAILER_SIZE,
};
