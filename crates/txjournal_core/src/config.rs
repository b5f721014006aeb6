//! Journal open options.

/// Default pre-allocated journal size: 4 MiB.
pub const DEFAULT_JOURNAL_SIZE: u64 = 4 * 1024 * 1024;

/// Options for opening a journal file.
#[derive(Debug, Clone)]
pub struct JournalOptions {
    /// Size to pre-allocate for the journal.
    ///
    /// An existing journal larger than this keeps its size; a smaller one
    /// is grown. The journal never shrinks.
    pub initial_size: u64,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            initial_size: DEFAULT_JOURNAL_SIZE,
        }
    }
}

impl JournalOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the pre-allocated journal size.
    #[must_use]
    pub const fn initial_size(mut self, size: u64) -> Self {
        self.initial_size = size;
        self
    }
}
