//! Record framing: encoding, decoding and the resynchronizing scan.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, trace, warn};
use txjournal_buffers::BufferProvider;

use crate::error::{JournalError, JournalResult};
use crate::types::GenerationId;

/// Opening marker of every record.
pub(crate) const RECORD_PREFIX: &[u8; 5] = b"\r\nLR[";

/// Marker separating the record header from the payload.
pub(crate) const RECORD_SUFFIX: &[u8; 2] = b"][";

/// Marker separating the payload from the closing generation id.
pub(crate) const RECORD_TRAILER_MARK: &[u8; 2] = b"]-";

/// Offset of the payload length field from the start of a record.
pub const RECORD_LENGTH_OFFSET: usize = RECORD_PREFIX.len() + GenerationId::SIZE;

/// Offset of the payload CRC32 field from the start of a record.
pub const RECORD_CRC32_OFFSET: usize = RECORD_LENGTH_OFFSET + 4;

/// Bytes consumed by the record header (prefix, opening generation id,
/// length, crc32, suffix).
pub const RECORD_HEADER_SIZE: usize = RECORD_CRC32_OFFSET + 4 + RECORD_SUFFIX.len();

/// Bytes consumed by the record trailer (trailer mark, closing generation
/// id).
pub const RECORD_TRAILER_SIZE: usize = RECORD_TRAILER_MARK.len() + GenerationId::SIZE;

/// Total framing overhead around a payload.
pub const RECORD_OVERHEAD: usize = RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE;

/// Maximum total on-disk size of a single record: 64 KiB.
///
/// Exceeding it is rejected when the payload is created; any length field
/// beyond it found during a scan is treated as corruption.
pub const MAX_RECORD_SIZE: usize = 64 * 1024;

/// Computes the CRC32 checksum of the given bytes (IEEE polynomial).
pub(crate) fn compute_crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Returns the number of bytes a batch of records occupies on disk.
#[must_use]
pub fn required_bytes(records: &[JournalRecord]) -> usize {
    records.iter().map(JournalRecord::record_size).sum()
}

/// Outcome of one [`scan_next`] step.
#[derive(Debug)]
pub(crate) enum ScanOutcome {
    /// A complete record of the expected generation starts at the scan
    /// position. The position is advanced past its trailer.
    Record(JournalRecord),

    /// A header (or a leading fragment of one) starts at the scan position
    /// but the buffer does not hold the full record. The position is left
    /// at the start of the header so the caller can compact and refill.
    Partial,

    /// A complete, checksum-valid record of a different generation starts
    /// at the scan position. The position is advanced past its trailer.
    ForeignGeneration,

    /// No record starts at the scan position. The position is advanced past
    /// the bytes that can be ruled out (at least one).
    NotAtHeader,

    /// The buffer is exhausted.
    BufferExhausted,
}

/// A single journal record: an opaque payload framed for crash-safe
/// storage.
///
/// Records are created through [`JournalFile::create_empty_record`], filled
/// via [`create_empty_payload`], and handed back in a batch to
/// [`JournalFile::write`]. Records produced by a scan carry a `valid` flag
/// reporting whether the payload checksum verified. Dropping a record
/// returns its backing buffer to the provider.
///
/// [`JournalFile::create_empty_record`]: crate::JournalFile::create_empty_record
/// [`JournalFile::write`]: crate::JournalFile::write
/// [`create_empty_payload`]: Self::create_empty_payload
pub struct JournalRecord {
    generation: GenerationId,
    /// The complete framed record bytes, once the payload exists.
    frame: Option<Vec<u8>>,
    /// Payload region within `frame`.
    payload: Range<usize>,
    valid: bool,
    provider: Arc<dyn BufferProvider>,
}

impl JournalRecord {
    /// Creates an empty record stamped with the given generation.
    pub(crate) fn new(generation: GenerationId, provider: Arc<dyn BufferProvider>) -> Self {
        Self {
            generation,
            frame: None,
            payload: 0..0,
            valid: true,
            provider,
        }
    }

    /// Builds a record from the framed bytes a scan located.
    ///
    /// The checksum is verified here; the record is returned either way
    /// with `valid` reporting the result.
    fn from_scan(
        generation: GenerationId,
        frame: &[u8],
        payload: Range<usize>,
        stored_crc: u32,
        provider: &Arc<dyn BufferProvider>,
    ) -> Self {
        let mut owned = provider.poll(frame.len());
        owned.extend_from_slice(frame);
        let valid = compute_crc32(&owned[payload.clone()]) == stored_crc;
        Self {
            generation,
            frame: Some(owned),
            payload,
            valid,
            provider: Arc::clone(provider),
        }
    }

    /// Decodes a record of the expected generation from caller-supplied
    /// bytes.
    ///
    /// The record must start at the first byte of `source`. A record whose
    /// checksum does not verify is still returned, with
    /// [`is_valid`](Self::is_valid) reporting `false`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidSource`] if the bytes do not frame a
    /// record of the expected generation.
    pub fn parse(
        expected: GenerationId,
        source: &[u8],
        provider: Arc<dyn BufferProvider>,
    ) -> JournalResult<Self> {
        let mut pos = 0;
        match scan_next(source, &mut pos, expected, &provider) {
            ScanOutcome::Record(record) => Ok(record),
            _ => Err(JournalError::InvalidSource),
        }
    }

    /// Allocates and frames an empty payload of `len` bytes, returning the
    /// writable payload slice.
    ///
    /// Any previously created payload is discarded. The returned slice is
    /// zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::RecordTooLarge`] if the framed record would
    /// exceed [`MAX_RECORD_SIZE`].
    pub fn create_empty_payload(&mut self, len: usize) -> JournalResult<&mut [u8]> {
        let total = len + RECORD_OVERHEAD;
        if total > MAX_RECORD_SIZE {
            return Err(JournalError::RecordTooLarge {
                size: total,
                max: MAX_RECORD_SIZE,
            });
        }

        if let Some(old) = self.frame.take() {
            self.provider.recycle(old);
        }

        let mut frame = self.provider.poll(total);
        frame.extend_from_slice(RECORD_PREFIX);
        frame.extend_from_slice(self.generation.as_bytes());
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.extend_from_slice(&[0u8; 4]); // crc32, patched on write
        frame.extend_from_slice(RECORD_SUFFIX);
        frame.resize(RECORD_HEADER_SIZE + len, 0);
        frame.extend_from_slice(RECORD_TRAILER_MARK);
        frame.extend_from_slice(self.generation.as_bytes());

        self.payload = RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len;
        self.valid = true;
        self.frame = Some(frame);

        let payload = self.payload.clone();
        Ok(&mut self.frame.as_mut().expect("frame was just created")[payload])
    }

    /// Serializes this record under `target_generation`, appending the
    /// framed bytes to `out`.
    ///
    /// A record created before a rollover still carries the old generation;
    /// both stored copies are re-stamped with the target id first. The
    /// payload checksum is computed and patched in here.
    ///
    /// # Panics
    ///
    /// Panics if the payload was never created; fill the record before
    /// writing it.
    pub(crate) fn encode_into(&mut self, target_generation: GenerationId, out: &mut Vec<u8>) {
        let frame = self
            .frame
            .as_mut()
            .expect("record payload was never created; fill the record before writing it");

        if self.generation != target_generation {
            debug!(
                from = %self.generation,
                to = %target_generation,
                "re-stamping record, the journal generation changed after creation"
            );
            let opening = RECORD_PREFIX.len()..RECORD_PREFIX.len() + GenerationId::SIZE;
            frame[opening].copy_from_slice(target_generation.as_bytes());
            let closing = frame.len() - GenerationId::SIZE;
            frame[closing..].copy_from_slice(target_generation.as_bytes());
            self.generation = target_generation;
        }

        let crc = compute_crc32(&frame[self.payload.clone()]);
        frame[RECORD_CRC32_OFFSET..RECORD_CRC32_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());

        out.extend_from_slice(frame);
    }

    /// Returns the generation this record is stamped with.
    #[must_use]
    pub fn generation(&self) -> GenerationId {
        self.generation
    }

    /// Returns the payload bytes, or an empty slice if no payload was
    /// created yet.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match &self.frame {
            Some(frame) => &frame[self.payload.clone()],
            None => &[],
        }
    }

    /// Returns whether the payload checksum verified on decode. Always true
    /// for records built by this process.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Returns the total on-disk size of this record, or 0 if no payload
    /// was created yet.
    #[must_use]
    pub fn record_size(&self) -> usize {
        self.frame.as_ref().map_or(0, Vec::len)
    }
}

impl Drop for JournalRecord {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.provider.recycle(frame);
        }
    }
}

impl fmt::Debug for JournalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JournalRecord")
            .field("generation", &self.generation)
            .field("payload_len", &self.payload.len())
            .field("valid", &self.valid)
            .finish()
    }
}

/// Advances `pos` through `buf` by one scan step, looking for a record of
/// the expected generation.
///
/// The position contract per outcome is documented on [`ScanOutcome`]. The
/// first prefix byte acts as a hook: positions not starting with it are
/// consumed one byte at a time, and only a hook match triggers full header
/// validation in place.
pub(crate) fn scan_next(
    buf: &[u8],
    pos: &mut usize,
    expected: GenerationId,
    provider: &Arc<dyn BufferProvider>,
) -> ScanOutcome {
    let start = *pos;
    if start >= buf.len() {
        return ScanOutcome::BufferExhausted;
    }

    if buf[start] != RECORD_PREFIX[0] {
        *pos += 1;
        return ScanOutcome::NotAtHeader;
    }

    let remaining = buf.len() - start;

    if remaining < RECORD_HEADER_SIZE {
        // The buffer ends inside what could still become a header: report
        // a partial record when the bytes present match the prefix either
        // completely or all the way to the end of the buffer.
        let matched = matching_prefix_len(&buf[start..]);
        if matched == RECORD_PREFIX.len() || matched == remaining {
            return ScanOutcome::Partial;
        }
        *pos += 1;
        return ScanOutcome::NotAtHeader;
    }

    if buf[start..start + RECORD_PREFIX.len()] != RECORD_PREFIX[..] {
        *pos += 1;
        return ScanOutcome::NotAtHeader;
    }

    let opening =
        GenerationId::from_slice(&buf[start + RECORD_PREFIX.len()..start + RECORD_LENGTH_OFFSET]);

    let length_field = i32::from_be_bytes(
        buf[start + RECORD_LENGTH_OFFSET..start + RECORD_CRC32_OFFSET]
            .try_into()
            .expect("length field is 4 bytes"),
    );
    if length_field < 0 || length_field as usize > MAX_RECORD_SIZE {
        warn!(
            length = length_field,
            max = MAX_RECORD_SIZE,
            "skipping record with an implausible length field"
        );
        *pos += 1;
        return ScanOutcome::NotAtHeader;
    }
    let payload_len = length_field as usize;

    let suffix_at = start + RECORD_HEADER_SIZE - RECORD_SUFFIX.len();
    if buf[suffix_at..suffix_at + RECORD_SUFFIX.len()] != RECORD_SUFFIX[..] {
        *pos += 1;
        return ScanOutcome::NotAtHeader;
    }

    let total = RECORD_HEADER_SIZE + payload_len + RECORD_TRAILER_SIZE;
    if total > remaining {
        trace!(
            payload_len,
            remaining,
            "record extends past the buffer, reporting a partial record"
        );
        return ScanOutcome::Partial;
    }

    let trailer_at = start + RECORD_HEADER_SIZE + payload_len;
    let trailer_ok = buf[trailer_at..trailer_at + RECORD_TRAILER_MARK.len()]
        == RECORD_TRAILER_MARK[..]
        && buf[trailer_at + RECORD_TRAILER_MARK.len()..start + total] == opening.as_bytes()[..];
    if !trailer_ok {
        debug!(generation = %opening, "skipping record with a broken trailer");
        *pos += 1;
        return ScanOutcome::NotAtHeader;
    }

    let payload = start + RECORD_HEADER_SIZE..trailer_at;
    let stored_crc = u32::from_be_bytes(
        buf[start + RECORD_CRC32_OFFSET..start + RECORD_CRC32_OFFSET + 4]
            .try_into()
            .expect("crc field is 4 bytes"),
    );

    if opening != expected {
        if compute_crc32(&buf[payload]) == stored_crc {
            // A live record from another cycle; step over it in one go.
            trace!(generation = %opening, "fast-forwarding past a record of another generation");
            *pos = start + total;
            return ScanOutcome::ForeignGeneration;
        }
        // The id mismatch plus a failed checksum means the framing match
        // was a coincidence inside payload data; resume behind the prefix.
        *pos = start + RECORD_PREFIX.len();
        return ScanOutcome::NotAtHeader;
    }

    let record = JournalRecord::from_scan(
        opening,
        &buf[start..start + total],
        RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len,
        stored_crc,
        provider,
    );
    *pos = start + total;
    ScanOutcome::Record(record)
}

/// Returns how many leading bytes of `bytes` match the record prefix.
fn matching_prefix_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .zip(RECORD_PREFIX.iter())
        .take_while(|(a, b)| a == b)
        .count()
}
