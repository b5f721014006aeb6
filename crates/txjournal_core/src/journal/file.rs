//! The journal file: lifecycle, locking, append, rollover and durability.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};
use txjournal_buffers::{BufferProvider, HeapBufferProvider};

use crate::config::JournalOptions;
use crate::error::{JournalError, JournalResult};
use crate::journal::record::{required_bytes, JournalRecord};
use crate::journal::scanner::{self, GenerationScan};
use crate::types::GenerationId;

/// Size of the fixed file header preceding the record area.
pub const FIXED_HEADER_SIZE: usize = 1024;

/// Human-readable banner opening the file header. Byte-identical across
/// runs; a mismatch refuses to open the file.
const HEADER_PREFIX: &str = concat!(
    "BTM-NTJ-[Version 1.0]\r\n",
    "\r\n",
    "------------------ Rolling Transaction Journal File -------------------\r\n",
    "\r\n",
    "    This is a delimiter based rolling binary file format. It persists\r\n",
    "    transaction state records so that crash recovery can complete or\r\n",
    "    undo commits and rollbacks that were interrupted mid-flight.\r\n",
    "\r\n",
    "------------------------------------------------------------------------\r\n",
    "\r\n",
);

/// Terminator behind the two generation ids in the file header.
const HEADER_SUFFIX: &[u8; 4] = b"\r\n\r\n";

/// Block size used when erasing the record area tail on rollover.
const ERASE_BLOCK_SIZE: usize = 4 * 1024;

/// State behind the journal mutex. Every mutating operation and every scan
/// holds the lock for its full duration.
struct JournalInner {
    /// Open handle; `None` once closed.
    file: Option<File>,
    previous_generation: GenerationId,
    current_generation: GenerationId,
    /// Declared journal size; never shrinks.
    journal_size: u64,
    /// Append point for the next record batch.
    position: u64,
    /// Bumped on every durable-state mutation.
    last_modified: u64,
    /// Value of `last_modified` at the last fsync.
    last_forced: u64,
}

impl JournalInner {
    fn file(&self) -> JournalResult<&File> {
        self.file.as_ref().ok_or(JournalError::Closed)
    }

    fn remaining_capacity(&self) -> u64 {
        self.journal_size.saturating_sub(self.position)
    }
}

/// A crash-safe rolling journal backed by a single pre-allocated file.
///
/// The file is opened once under an exclusive OS-level lock and reused
/// cyclically: records append until the record area runs out, a
/// [`rollover`](Self::rollover) then rotates generations and restarts at
/// the front. Reading back yields the union of the previous and the
/// current cycle's records.
///
/// All operations take `&self`; a single writer is assumed and enforced by
/// an internal mutex.
pub struct JournalFile {
    path: PathBuf,
    provider: Arc<dyn BufferProvider>,
    inner: Mutex<JournalInner>,
}

impl JournalFile {
    /// Opens or creates the journal at `path`, pre-allocating
    /// `initial_size` bytes, with a plain heap buffer provider.
    ///
    /// # Errors
    ///
    /// - [`JournalError::Busy`] when another process holds the lock
    /// - [`JournalError::BadMagic`] when the file exists but does not carry
    ///   the expected header
    /// - [`JournalError::Io`] on any I/O failure
    pub fn open(path: impl AsRef<Path>, initial_size: u64) -> JournalResult<Self> {
        Self::open_with(
            path,
            JournalOptions::new().initial_size(initial_size),
            Arc::new(HeapBufferProvider::new()),
        )
    }

    /// Opens or creates the journal with explicit options and buffer
    /// provider.
    ///
    /// An empty file receives a fresh header; an existing one is validated,
    /// grown to at least the requested size (never shrunk) and scanned to
    /// find the append point behind the last record of the current
    /// generation. On any failure the handle is closed and the lock
    /// released before returning.
    pub fn open_with(
        path: impl AsRef<Path>,
        options: JournalOptions,
        provider: Arc<dyn BufferProvider>,
    ) -> JournalResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // Fully qualified: std's own File locking (1.89+) shadows the
        // fs2 methods otherwise.
        if fs2::FileExt::try_lock_exclusive(&file).is_err() {
            return Err(JournalError::Busy);
        }

        let length = file.metadata()?.len();
        let fresh = length == 0;

        let (previous, current) = if fresh {
            (GenerationId::random(), GenerationId::random())
        } else {
            // A failure here drops the handle, which also releases the lock.
            read_header(&file)?
        };

        let journal_size = options
            .initial_size
            .max(length)
            .max(FIXED_HEADER_SIZE as u64);
        if journal_size > length {
            file.set_len(journal_size)?;
        }

        let mut inner = JournalInner {
            file: Some(file),
            previous_generation: previous,
            current_generation: current,
            journal_size,
            position: FIXED_HEADER_SIZE as u64,
            last_modified: 0,
            last_forced: 0,
        };

        if fresh {
            write_header(&mut inner)?;
            info!(
                path = %path.display(),
                size = journal_size,
                "created a new transaction journal"
            );
        } else {
            let position = scanner::find_position_after_last_record(
                inner.file()?,
                current,
                journal_size,
                &provider,
            )?;
            inner.position = position.max(FIXED_HEADER_SIZE as u64);
            info!(
                path = %path.display(),
                position = inner.position,
                "opened an existing transaction journal"
            );
            if inner.position == FIXED_HEADER_SIZE as u64 {
                warn!(
                    path = %path.display(),
                    "the journal appears to be empty though it was not just created"
                );
            }
        }

        Ok(Self {
            path,
            provider,
            inner: Mutex::new(inner),
        })
    }

    /// Returns the journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the declared journal size.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.inner.lock().journal_size
    }

    /// Returns the current append point.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.inner.lock().position
    }

    /// Returns the bytes left in the record area before a rollover is
    /// required.
    #[must_use]
    pub fn remaining_capacity(&self) -> u64 {
        self.inner.lock().remaining_capacity()
    }

    /// Creates an empty record stamped with the current generation.
    ///
    /// Fill it via [`JournalRecord::create_empty_payload`] and hand it back
    /// in a batch to [`write`](Self::write).
    #[must_use]
    pub fn create_empty_record(&self) -> JournalRecord {
        let generation = self.inner.lock().current_generation;
        JournalRecord::new(generation, Arc::clone(&self.provider))
    }

    /// Writes a batch of records, returning the number of bytes written.
    ///
    /// The records appear on disk in batch order, serialized into one
    /// contiguous buffer and submitted as a single write. An empty batch
    /// writes nothing and changes no state.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::NeedsRollover`] - with nothing written -
    /// when the batch does not fit into the remaining record area. The
    /// caller triggers [`rollover`](Self::rollover) explicitly, typically
    /// after flushing whatever bookkeeping must survive the cycle change.
    pub fn write(&self, batch: &mut [JournalRecord]) -> JournalResult<u64> {
        let mut inner = self.inner.lock();
        let file = inner.file()?;

        if batch.is_empty() {
            return Ok(0);
        }

        let required = required_bytes(batch) as u64;
        let remaining = inner.remaining_capacity();
        if required > remaining {
            return Err(JournalError::NeedsRollover {
                remaining,
                required,
            });
        }

        // One contiguous buffer and a single write; scattering per record
        // costs a syscall each.
        let target = inner.current_generation;
        let mut write_buf = self.provider.poll(required as usize);
        for record in batch.iter_mut() {
            record.encode_into(target, &mut write_buf);
        }

        let result = write_all_at(file, inner.position, &write_buf);
        self.provider.recycle(write_buf);
        result?;

        inner.position += required;
        inner.last_modified += 1;
        debug!(bytes = required, position = inner.position, "wrote record batch");
        Ok(required)
    }

    /// Ends the current cycle and restarts the journal at the front of the
    /// record area.
    ///
    /// The remaining tail is erased (so stale framing cannot confuse later
    /// scans), the previous generation takes the current id, a fresh id is
    /// drawn, and the header is rewritten. Records of the outgoing cycle
    /// stay readable until new data overwrites them.
    pub fn rollover(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        self.erase_remaining(&mut inner)?;

        inner.previous_generation = inner.current_generation;
        inner.current_generation = GenerationId::random();
        write_header(&mut inner)?;

        info!(generation = %inner.current_generation, "journal rolled over");
        Ok(())
    }

    /// Grows the journal to `new_size`; does nothing when the journal is
    /// already at least that large. The journal never shrinks.
    pub fn grow(&self, new_size: u64) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        let file = inner.file()?;
        if new_size > inner.journal_size {
            file.set_len(new_size)?;
            inner.journal_size = new_size;
            inner.last_modified += 1;
            debug!(new_size, "journal grown");
        }
        Ok(())
    }

    /// Forces written data to stable storage.
    ///
    /// A no-op when nothing changed since the last force. Serializes with
    /// writes: after this returns, every previously written byte is
    /// durable.
    pub fn force(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        let file = inner.file()?;
        if inner.last_forced != inner.last_modified {
            debug!(position = inner.position, "forcing the journal to stable storage");
            file.sync_data()?;
            inner.last_forced = inner.last_modified;
        }
        Ok(())
    }

    /// Returns a lazy iterator over all live records: the previous cycle's
    /// records first, then the current cycle's, each in file order.
    ///
    /// Records that fail their checksum are omitted unless
    /// `include_invalid` is set. The iterator holds the journal lock for
    /// its lifetime, so writers wait until it is dropped.
    pub fn read_all(&self, include_invalid: bool) -> JournalRecords<'_> {
        let inner = self.inner.lock();
        let passes = [inner.previous_generation, inner.current_generation];
        let end = inner.journal_size;
        JournalRecords {
            inner,
            provider: Arc::clone(&self.provider),
            include_invalid,
            end,
            passes,
            next_pass: 0,
            current: None,
        }
    }

    /// Closes the journal: forces outstanding data, releases the file lock
    /// and drops the handle. Idempotent; later mutating calls fail with
    /// [`JournalError::Closed`].
    pub fn close(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        let Some(file) = inner.file.take() else {
            return Ok(());
        };

        let dirty = inner.last_forced != inner.last_modified;
        inner.last_forced = inner.last_modified;

        let sync_result = if dirty { file.sync_data() } else { Ok(()) };
        // The lock is released even when the final sync failed.
        let unlock_result = fs2::FileExt::unlock(&file);
        drop(file);

        sync_result?;
        unlock_result?;
        Ok(())
    }

    /// Fills the record area from the append point to its end with a
    /// neutral byte.
    fn erase_remaining(&self, inner: &mut JournalInner) -> JournalResult<()> {
        let file = inner.file()?;

        let mut block = self.provider.poll(ERASE_BLOCK_SIZE);
        block.resize(ERASE_BLOCK_SIZE, b' ');

        let mut offset = inner.position;
        let mut result: io::Result<()> = Ok(());
        while offset < inner.journal_size {
            let n = (inner.journal_size - offset).min(ERASE_BLOCK_SIZE as u64) as usize;
            if let Err(error) = write_all_at(file, offset, &block[..n]) {
                result = Err(error);
                break;
            }
            offset += n as u64;
        }
        self.provider.recycle(block);
        result?;
        Ok(())
    }
}

impl Drop for JournalFile {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            warn!(path = %self.path.display(), %error, "failed to close the journal cleanly");
        }
    }
}

impl fmt::Debug for JournalFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalFile")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Iterator over all live journal records; see [`JournalFile::read_all`].
pub struct JournalRecords<'a> {
    inner: MutexGuard<'a, JournalInner>,
    provider: Arc<dyn BufferProvider>,
    include_invalid: bool,
    end: u64,
    passes: [GenerationId; 2],
    next_pass: usize,
    current: Option<GenerationScan>,
}

impl Iterator for JournalRecords<'_> {
    type Item = JournalRecord;

    fn next(&mut self) -> Option<JournalRecord> {
        loop {
            if self.current.is_none() {
                if self.next_pass >= self.passes.len() {
                    return None;
                }
                let generation = self.passes[self.next_pass];
                self.next_pass += 1;
                self.current = Some(GenerationScan::new(
                    generation,
                    self.include_invalid,
                    self.end,
                    Arc::clone(&self.provider),
                ));
            }

            let file = self.inner.file.as_ref()?;
            let scan = self.current.as_mut().expect("scan was just created");
            match scan.next_record(file) {
                Ok(Some(record)) => return Some(record),
                Ok(None) => self.current = None,
                Err(error) => {
                    // Scans tolerate damage; an I/O failure ends the
                    // iteration instead of surfacing an error.
                    warn!(%error, "journal scan aborted by an I/O error");
                    return None;
                }
            }
        }
    }
}

/// Writes `data` at the absolute `offset`.
fn write_all_at(file: &File, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut writer = file;
    writer.seek(SeekFrom::Start(offset))?;
    writer.write_all(data)
}

/// Serializes the header and writes it at offset zero, leaving the append
/// point at the start of the record area.
fn write_header(inner: &mut JournalInner) -> JournalResult<()> {
    let mut header = Vec::with_capacity(FIXED_HEADER_SIZE);
    header.extend_from_slice(HEADER_PREFIX.as_bytes());
    header.extend_from_slice(inner.previous_generation.as_bytes());
    header.extend_from_slice(inner.current_generation.as_bytes());
    header.extend_from_slice(HEADER_SUFFIX);
    header.resize(FIXED_HEADER_SIZE, b' ');

    write_all_at(inner.file()?, 0, &header)?;

    inner.position = FIXED_HEADER_SIZE as u64;
    inner.last_modified += 1;
    Ok(())
}

/// Reads and validates the header, returning the stored generation ids as
/// `(previous, current)`.
fn read_header(file: &File) -> JournalResult<(GenerationId, GenerationId)> {
    let mut buf = [0u8; FIXED_HEADER_SIZE];
    let mut reader = file;
    reader.seek(SeekFrom::Start(0))?;
    if let Err(error) = reader.read_exact(&mut buf) {
        if error.kind() == io::ErrorKind::UnexpectedEof {
            return Err(JournalError::bad_magic("journal header is truncated"));
        }
        return Err(error.into());
    }

    let prefix = HEADER_PREFIX.as_bytes();
    if &buf[..prefix.len()] != prefix {
        return Err(JournalError::bad_magic("unrecognized magic banner"));
    }

    let mut at = prefix.len();
    let previous = GenerationId::from_slice(&buf[at..]);
    at += GenerationId::SIZE;
    let current = GenerationId::from_slice(&buf[at..]);
    at += GenerationId::SIZE;

    if &buf[at..at + HEADER_SUFFIX.len()] != HEADER_SUFFIX {
        return Err(JournalError::bad_magic("malformed header terminator"));
    }

    Ok((previous, current))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_magic_opens_the_banner() {
        assert!(HEADER_PREFIX.starts_with("BTM-NTJ-[Version 1.0]"));
        // Banner, two generation ids and the terminator fit the fixed
        // header with room to spare.
        assert!(HEADER_PREFIX.len() + 2 * GenerationId::SIZE + HEADER_SUFFIX.len() <= FIXED_HEADER_SIZE);
    }

    #[test]
    fn header_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.bin");
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();

        let previous = GenerationId::random();
        let current = GenerationId::random();
        let mut inner = JournalInner {
            file: Some(file),
            previous_generation: previous,
            current_generation: current,
            journal_size: FIXED_HEADER_SIZE as u64,
            position: 0,
            last_modified: 0,
            last_forced: 0,
        };
        write_header(&mut inner).unwrap();
        assert_eq!(inner.position, FIXED_HEADER_SIZE as u64);
        assert_eq!(inner.last_modified, 1);

        let (read_previous, read_current) = read_header(inner.file().unwrap()).unwrap();
        assert_eq!(read_previous, previous);
        assert_eq!(read_current, current);
    }

    #[test]
    fn garbage_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.bin");
        std::fs::write(&path, vec![0xAAu8; FIXED_HEADER_SIZE]).unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        assert!(matches!(
            read_header(&file),
            Err(JournalError::BadMagic { .. })
        ));
    }

    #[test]
    fn short_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"BTM-NTJ-[Version 1.0]").unwrap();
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();

        assert!(matches!(
            read_header(&file),
            Err(JournalError::BadMagic { .. })
        ));
    }
}
