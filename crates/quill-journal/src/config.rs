use std::fmt::{self, Display};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{JournalError, JournalResult};

/// File extension used by journal files.
pub const JOURNAL_FILE_EXTENSION: &str = "txn";

const MB: u64 = 1024 * 1024;
const KB: usize = 1024;

/// Smallest alignment the journal will pad records to (one disk sector).
const ALIGNMENT_MIN: usize = 512;

/// Largest alignment worth supporting; beyond this padding waste dominates.
const ALIGNMENT_MAX: usize = 1024 * 1024;

/// Default rotation threshold.
const DEFAULT_MAX_JOURNAL_SIZE_MB: u64 = 2048;

/// Default pre-allocation extent step.
const DEFAULT_PREALLOC_SIZE_MB: u64 = 16;

/// Default user-space write buffer capacity.
const DEFAULT_WRITE_BUFFER_SIZE_KB: usize = 64;

/// Default window after which a pending batch is force-flushed.
const DEFAULT_MAX_GROUP_WAIT_MS: u64 = 200;

/// Default outstanding-bytes threshold for triggering a flush.
const DEFAULT_BUFFERED_WRITES_THRESHOLD_KB: u64 = 512;

/// Default number of pre-mark journals kept by a compacting checkpoint.
const DEFAULT_MAX_BACKUP_JOURNALS: usize = 5;

/// Clamps `value` into `[min, max]` and snaps it to the nearest power of
/// two, preferring the smaller candidate on a tie. Both bounds must be
/// powers of two themselves.
#[inline]
fn nearest_power_of_two(value: usize, min: usize, max: usize) -> usize {
    debug_assert!(min.is_power_of_two() && max.is_power_of_two());
    let value = value.clamp(min, max);
    if value.is_power_of_two() {
        return value;
    }
    let above = value.next_power_of_two();
    let below = above >> 1;
    if value - below <= above - value {
        below
    } else {
        above
    }
}

/// Identifier of a single journal file.
///
/// Ids are allocated from the wall clock at rotation and are strictly
/// monotonic within a process lifetime, so sorting ids sorts journals by
/// creation order. The id doubles as the file name, rendered in hex.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JournalId(pub u64);

impl JournalId {
    /// Creates a new journal id from a raw u64 value.
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the journal id as a u64.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Renders the file name for this journal, e.g. `1a2b3c.txn`.
    pub fn file_name(self) -> String {
        format!("{:x}.{}", self.0, JOURNAL_FILE_EXTENSION)
    }

    /// Parses a journal id back out of a file name produced by
    /// [`JournalId::file_name`]. Returns `None` for files that are not
    /// journals.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", JOURNAL_FILE_EXTENSION))?;
        u64::from_str_radix(stem, 16).ok().map(Self)
    }
}

impl Display for JournalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl From<u64> for JournalId {
    #[inline]
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JournalId> for u64 {
    #[inline]
    fn from(value: JournalId) -> Self {
        value.0
    }
}

/// Configuration for the journal pipeline.
///
/// Sizes are expressed in the units their names carry; [`JournalConfig::normalized`]
/// converts them into the byte-level view the writer consumes and clamps
/// values that would break the file format (alignment in particular).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Directory holding `<hex id>.txn` journal files.
    pub journal_dir: PathBuf,
    /// Rotate to a new journal once the current file exceeds this size.
    pub max_journal_size_mb: u64,
    /// Extent step used when pre-allocating journal files.
    pub prealloc_size_mb: u64,
    /// Capacity of the user-space write buffer.
    pub write_buffer_size_kb: usize,
    /// Record alignment; padding records round flush boundaries up to this.
    pub alignment_size: usize,
    /// Format version written into the header of new journal files.
    pub format_version_to_write: u32,
    /// Skip the fsync for requests that arrive while one is already running.
    pub adaptive_group_writes: bool,
    /// Longest time an entry may sit in a batch before it forces a flush.
    pub max_group_wait_ms: u64,
    /// Flush once this many bytes are buffered past the last flush point.
    pub buffered_writes_threshold_kb: u64,
    /// Flush once this many entries are batched (0 disables the check).
    pub buffered_entries_threshold: u64,
    /// Flush as soon as the ingest queue drains instead of waiting out the
    /// group window.
    pub flush_when_queue_empty: bool,
    /// Hint the kernel to drop flushed pages from the page cache.
    pub remove_pages_from_cache: bool,
    /// Journals below the checkpoint mark retained by a compacting checkpoint.
    pub max_backup_journals: usize,
    /// Width of the completion-callback executor.
    pub callback_threads: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            journal_dir: PathBuf::from("journal"),
            max_journal_size_mb: DEFAULT_MAX_JOURNAL_SIZE_MB,
            prealloc_size_mb: DEFAULT_PREALLOC_SIZE_MB,
            write_buffer_size_kb: DEFAULT_WRITE_BUFFER_SIZE_KB,
            alignment_size: ALIGNMENT_MIN,
            format_version_to_write: crate::channel::FORMAT_VERSION_LATEST,
            adaptive_group_writes: true,
            max_group_wait_ms: DEFAULT_MAX_GROUP_WAIT_MS,
            buffered_writes_threshold_kb: DEFAULT_BUFFERED_WRITES_THRESHOLD_KB,
            buffered_entries_threshold: 0,
            flush_when_queue_empty: false,
            remove_pages_from_cache: false,
            max_backup_journals: DEFAULT_MAX_BACKUP_JOURNALS,
            callback_threads: 1,
        }
    }
}

impl JournalConfig {
    /// Validates the configuration and resolves it into the byte-level view
    /// used by the writer.
    pub fn normalized(&self) -> JournalResult<ResolvedConfig> {
        if self.journal_dir.as_os_str().is_empty() {
            return Err(JournalError::invalid_config("journal_dir must be set"));
        }
        if self.format_version_to_write < crate::channel::FORMAT_V1
            || self.format_version_to_write > crate::channel::FORMAT_VERSION_LATEST
        {
            return Err(JournalError::invalid_config(format!(
                "unsupported journal format version {}",
                self.format_version_to_write
            )));
        }

        let alignment = nearest_power_of_two(self.alignment_size, ALIGNMENT_MIN, ALIGNMENT_MAX);
        let prealloc_size = (self.prealloc_size_mb * MB).max(alignment as u64);
        let write_buffer_size = (self.write_buffer_size_kb * KB).max(4 * KB);
        let max_journal_size = (self.max_journal_size_mb * MB).max(prealloc_size);

        Ok(ResolvedConfig {
            journal_dir: self.journal_dir.clone(),
            max_journal_size,
            prealloc_size,
            write_buffer_size,
            alignment,
            format_version: self.format_version_to_write,
            adaptive_group_writes: self.adaptive_group_writes,
            max_group_wait_nanos: self.max_group_wait_ms.saturating_mul(1_000_000),
            buffered_writes_threshold: self.buffered_writes_threshold_kb * KB as u64,
            buffered_entries_threshold: self.buffered_entries_threshold,
            // Without a wait cap there is no bounded poll to piggyback a
            // flush on, so the empty-queue flush must be in effect.
            flush_when_queue_empty: self.max_group_wait_ms == 0 || self.flush_when_queue_empty,
            remove_pages_from_cache: self.remove_pages_from_cache,
            max_backup_journals: self.max_backup_journals,
            callback_threads: self.callback_threads.max(1),
        })
    }
}

/// Byte-level configuration consumed by the writer and force-write loops.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub journal_dir: PathBuf,
    pub max_journal_size: u64,
    pub prealloc_size: u64,
    pub write_buffer_size: usize,
    pub alignment: usize,
    pub format_version: u32,
    pub adaptive_group_writes: bool,
    pub max_group_wait_nanos: u64,
    pub buffered_writes_threshold: u64,
    pub buffered_entries_threshold: u64,
    pub flush_when_queue_empty: bool,
    pub remove_pages_from_cache: bool,
    pub max_backup_journals: usize,
    pub callback_threads: usize,
}
