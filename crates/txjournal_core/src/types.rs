//! Core type definitions for the journal.

use std::fmt;

/// Identifier for one cycle of the rolling journal.
///
/// A fresh, uniformly random id is drawn whenever the journal rolls over,
/// and every record written during that cycle is stamped with it - twice,
/// once in the header and once in the trailer. The randomness is what makes
/// the id usable as a framing delimiter: 128 random bits do not collide
/// with payload bytes or with ids from earlier cycles in practice, so a
/// scanner can classify records as live or stale by comparing ids alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationId([u8; 16]);

impl GenerationId {
    /// Size of a generation id on disk.
    pub const SIZE: usize = 16;

    /// Draws a fresh random generation id.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Creates a generation id from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the raw bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Reads a generation id from the start of a slice.
    ///
    /// # Panics
    ///
    /// Panics if the slice holds fewer than [`Self::SIZE`] bytes; callers
    /// bounds-check first.
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut id = [0u8; Self::SIZE];
        id.copy_from_slice(&bytes[..Self::SIZE]);
        Self(id)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen:{self}")
    }
}
