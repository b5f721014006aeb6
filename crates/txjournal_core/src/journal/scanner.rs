//! Lazy record scanning over a file region.
//!
//! A [`GenerationScan`] streams the records of one generation out of the
//! record area with constant memory: it works through a single borrowed
//! buffer that is compacted and refilled whenever a record straddles the
//! buffer end. Damage encountered on the way (torn records, checksum
//! failures, stale framing) is skipped, never surfaced as an error.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use tracing::debug;
use txjournal_buffers::BufferProvider;

use crate::journal::file::FIXED_HEADER_SIZE;
use crate::journal::record::{self, JournalRecord, ScanOutcome, MAX_RECORD_SIZE, RECORD_OVERHEAD};
use crate::types::GenerationId;

/// Working buffer size.
///
/// Sized so that any record with an in-range length field fits after one
/// compaction; a scan can always make progress.
const SCAN_BUFFER_SIZE: usize = MAX_RECORD_SIZE + RECORD_OVERHEAD;

/// A streaming scan for records of one generation.
///
/// The scan covers `[FIXED_HEADER_SIZE, end)` and reads through the file
/// handle passed to [`next_record`](Self::next_record); the caller keeps
/// the handle serialized against writers.
pub(crate) struct GenerationScan {
    generation: GenerationId,
    include_invalid: bool,
    /// Absolute end of the scanned region.
    end: u64,
    /// Working buffer, borrowed lazily from the provider.
    buf: Vec<u8>,
    /// Absolute file offset of `buf[0]`.
    buf_offset: u64,
    /// Scan position within the buffer.
    pos: usize,
    /// Number of valid bytes in the buffer.
    filled: usize,
    provider: Arc<dyn BufferProvider>,
}

impl GenerationScan {
    pub(crate) fn new(
        generation: GenerationId,
        include_invalid: bool,
        end: u64,
        provider: Arc<dyn BufferProvider>,
    ) -> Self {
        Self {
            generation,
            include_invalid,
            end,
            buf: Vec::new(),
            buf_offset: FIXED_HEADER_SIZE as u64,
            pos: 0,
            filled: 0,
            provider,
        }
    }

    /// Absolute file offset of the next unconsumed byte.
    pub(crate) fn position(&self) -> u64 {
        self.buf_offset + self.pos as u64
    }

    /// Produces the next record, or `None` when the region is exhausted.
    ///
    /// A record that fails its checksum is dropped unless the scan was
    /// created with `include_invalid`.
    pub(crate) fn next_record(&mut self, file: &File) -> io::Result<Option<JournalRecord>> {
        loop {
            match record::scan_next(
                &self.buf[..self.filled],
                &mut self.pos,
                self.generation,
                &self.provider,
            ) {
                ScanOutcome::Record(record) => {
                    if record.is_valid() || self.include_invalid {
                        return Ok(Some(record));
                    }
                    debug!(
                        generation = %self.generation,
                        offset = self.position(),
                        "dropping a record that failed its checksum"
                    );
                }
                ScanOutcome::ForeignGeneration | ScanOutcome::NotAtHeader => {}
                ScanOutcome::Partial | ScanOutcome::BufferExhausted => {
                    if !self.refill(file)? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    /// Moves unread bytes to the buffer front and reads more of the region
    /// behind them. Returns `false` when no further bytes are available.
    fn refill(&mut self, file: &File) -> io::Result<bool> {
        if self.buf.capacity() == 0 {
            self.buf = self.provider.poll(SCAN_BUFFER_SIZE);
        }
        let capacity = self.buf.capacity();
        self.buf.resize(capacity, 0);

        let unread = self.filled - self.pos;
        if unread > 0 && self.pos > 0 {
            self.buf.copy_within(self.pos..self.filled, 0);
        }
        self.buf_offset += self.pos as u64;
        self.pos = 0;
        self.filled = unread;

        let file_offset = self.buf_offset + self.filled as u64;
        let available = self.end.saturating_sub(file_offset);
        let want = u64::min((self.buf.len() - self.filled) as u64, available) as usize;
        if want == 0 {
            return Ok(false);
        }

        let mut reader = file;
        reader.seek(SeekFrom::Start(file_offset))?;
        reader.read_exact(&mut self.buf[self.filled..self.filled + want])?;
        self.filled += want;
        Ok(true)
    }
}

impl Drop for GenerationScan {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        if buf.capacity() > 0 {
            self.provider.recycle(buf);
        }
    }
}

/// Finds the append point on open: the offset just past the last record of
/// the given generation, or `FIXED_HEADER_SIZE` when none exists.
///
/// Records that fail their checksum still advance the append point; they
/// occupy their space in the current cycle either way.
pub(crate) fn find_position_after_last_record(
    file: &File,
    generation: GenerationId,
    end: u64,
    provider: &Arc<dyn BufferProvider>,
) -> io::Result<u64> {
    let mut scan = GenerationScan::new(generation, true, end, Arc::clone(provider));
    let mut position = FIXED_HEADER_SIZE as u64;
    while scan.next_record(file)?.is_some() {
        position = scan.position();
    }
    Ok(position)
}
