//! Write-ahead journal for the quill log storage node.
//!
//! Every entry the node acknowledges to a client is first fsynced into an
//! append-only journal file by this crate; after a crash, replaying the
//! journal tail recovers every acknowledged write. The pipeline sits on
//! the acknowledgement latency path, so it batches aggressively:
//!
//! - **Ingest queue**: producers push entries without blocking on disk.
//! - **Writer thread**: frames entries into the current journal file
//!   through a user-space buffer and decides when a batch is worth
//!   flushing (group-wait window, outstanding-byte and entry thresholds,
//!   or an empty queue).
//! - **Force-write thread**: fsyncs flushed batches, advances the durable
//!   frontier ([`LogMark`]), and dispatches completion callbacks through a
//!   keyed executor so each ledger sees its acknowledgements in order.
//!   With adaptive group writes, requests that arrive while an fsync is in
//!   flight skip their own.
//!
//! Journal files are pre-allocated in extents and rotated once they pass a
//! size cap; a compacting checkpoint prunes files below the persisted
//! mark. Records are framed `len | payload`, padded to a configurable
//! alignment from format V5 on.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use quill_journal::{FixedDirs, Journal, JournalConfig, JournalMetrics};
//!
//! # fn main() -> quill_journal::JournalResult<()> {
//! let mut config = JournalConfig::default();
//! config.journal_dir = "/data/journal".into();
//!
//! let dirs = Arc::new(FixedDirs::single("/data"));
//! let journal = Journal::new(&config, dirs, Arc::new(JournalMetrics::default()))?;
//!
//! // Recover acknowledged entries from a previous run.
//! journal.replay(&mut |_version, _offset, payload: &[u8]| {
//!     // hand the payload to the memtable
//!     let _ = payload;
//!     Ok(())
//! })?;
//!
//! journal.start()?;
//! journal.log_add(b"entry".to_vec(), 1, 0, Some(1), |rc, ledger, entry| {
//!     assert_eq!(rc, 0);
//!     let _ = (ledger, entry);
//! })?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Durability contract
//!
//! A callback invoked with `rc == 0` means the entry's bytes are fsynced
//! into its journal file and the durable frontier is at or past the end of
//! its batch. Entries whose batch never reached the force-writer before a
//! crash or shutdown are dropped, and were never acknowledged.

pub mod channel;
pub mod config;
pub mod dirs;
pub mod error;
pub mod executor;
pub mod mark;
pub mod metrics;

mod force_write;
mod journal;

pub use channel::{
    JournalChannel, JournalFileReader, FORMAT_V1, FORMAT_V2, FORMAT_V3, FORMAT_V4, FORMAT_V5,
    FORMAT_VERSION_LATEST, HEADER_SIZE, PADDING_MASK,
};
pub use config::{JournalConfig, JournalId, ResolvedConfig, JOURNAL_FILE_EXTENSION};
pub use dirs::{FixedDirs, MarkDirs};
pub use error::{JournalError, JournalResult};
pub use executor::OrderedExecutor;
pub use journal::{Checkpoint, Journal, JournalScanner, WriteCallback, RC_OK};
pub use mark::{LastLogMark, LogMark, MARK_FILE_NAME};
pub use metrics::{
    JournalMetrics, JournalMetricsSnapshot, LatencyRecorder, LatencySnapshot, ValueRecorder,
    ValueSnapshot,
};
