//! Durability frontier tracking.
//!
//! A [`LogMark`] names a point in the journal stream: everything at or
//! below it has been fsynced. The process-wide [`LastLogMark`] cursor is
//! advanced by the force-writer after every durable batch, persisted to
//! `lastMark` marker files on checkpoint, and re-read on startup to decide
//! where replay begins.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::config::JournalId;
use crate::error::{JournalError, JournalResult};

/// Marker file name, one per data directory.
pub const MARK_FILE_NAME: &str = "lastMark";

/// Encoded size of a marker file: `log_id: i64 BE | offset: i64 BE`.
const MARK_ENCODED_LEN: usize = 16;

/// A `(journal id, byte offset)` pair naming a durability frontier.
///
/// Marks order lexicographically: a later journal always outranks any
/// offset in an earlier one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogMark {
    pub log_id: JournalId,
    pub offset: u64,
}

impl LogMark {
    pub const MIN: LogMark = LogMark {
        log_id: JournalId::new(0),
        offset: 0,
    };

    pub fn new(log_id: JournalId, offset: u64) -> Self {
        Self { log_id, offset }
    }

    fn encode(&self) -> [u8; MARK_ENCODED_LEN] {
        let mut buf = [0u8; MARK_ENCODED_LEN];
        buf[0..8].copy_from_slice(&(self.log_id.as_u64() as i64).to_be_bytes());
        buf[8..16].copy_from_slice(&(self.offset as i64).to_be_bytes());
        buf
    }

    fn decode(buf: &[u8; MARK_ENCODED_LEN]) -> JournalResult<Self> {
        let log_id = i64::from_be_bytes(
            buf[0..8]
                .try_into()
                .map_err(|_| JournalError::format("mark log id corrupt"))?,
        );
        let offset = i64::from_be_bytes(
            buf[8..16]
                .try_into()
                .map_err(|_| JournalError::format("mark offset corrupt"))?,
        );
        if log_id < 0 || offset < 0 {
            return Err(JournalError::format(format!(
                "negative fields in log mark: ({log_id}, {offset})"
            )));
        }
        Ok(Self {
            log_id: JournalId::new(log_id as u64),
            offset: offset as u64,
        })
    }
}

impl std::fmt::Display for LogMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.log_id, self.offset)
    }
}

/// Process-wide durable-frontier cursor.
///
/// Written by the force-writer (and by replay while it re-reads the tail);
/// read by the writer at startup and by the checkpoint API from any
/// thread. Updates are monotonic: the frontier never moves backwards
/// within a process lifetime.
#[derive(Debug, Default)]
pub struct LastLogMark {
    mark: Mutex<LogMark>,
}

impl LastLogMark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current frontier.
    pub fn current(&self) -> LogMark {
        *self.mark.lock()
    }

    /// Snapshot the frontier for use as a checkpoint.
    pub fn mark_log(&self) -> LogMark {
        self.current()
    }

    /// Advance the frontier. A regression indicates a pipeline-ordering bug
    /// upstream and is rejected in debug builds; release builds keep the
    /// larger value.
    pub fn advance_to(&self, next: LogMark) {
        let mut cur = self.mark.lock();
        debug_assert!(
            next >= *cur,
            "log mark regression: {next} is behind {}",
            *cur
        );
        if next > *cur {
            *cur = next;
        }
    }

    /// Load the frontier from marker files across every known directory,
    /// keeping the maximum. Unreadable or missing copies are skipped: a
    /// fresh node has none, and a torn copy in one directory is superseded
    /// by the others.
    pub fn read_from(&self, dirs: &[PathBuf]) {
        let mut best = self.current();
        for dir in dirs {
            let path = dir.join(MARK_FILE_NAME);
            match read_mark_file(&path) {
                Ok(mark) => {
                    if mark > best {
                        best = mark;
                    }
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err,
                        "skipping unreadable mark file (expected on first start)");
                }
            }
        }
        self.advance_to(best);
    }

    /// Persist `mark` to a `lastMark` file in every writable directory.
    ///
    /// Individual directory failures are logged and tolerated, but at
    /// least one copy must land durably or the checkpoint cannot be
    /// honored and an error is returned.
    pub fn roll_log(mark: LogMark, writable_dirs: &[PathBuf]) -> JournalResult<()> {
        debug!(mark = %mark, "persisting last log mark");
        let buf = mark.encode();
        let mut persisted = 0usize;
        for dir in writable_dirs {
            let path = dir.join(MARK_FILE_NAME);
            match write_mark_file(&path, &buf) {
                Ok(()) => persisted += 1,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "failed to write mark file");
                }
            }
        }
        if persisted == 0 {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("no directory accepted mark {mark}"),
            )));
        }
        if persisted < writable_dirs.len() {
            warn!(
                persisted,
                total = writable_dirs.len(),
                "mark persisted to a subset of writable directories"
            );
        }
        Ok(())
    }
}

fn read_mark_file(path: &Path) -> JournalResult<LogMark> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; MARK_ENCODED_LEN];
    file.read_exact(&mut buf)?;
    LogMark::decode(&buf)
}

fn write_mark_file(path: &Path, buf: &[u8; MARK_ENCODED_LEN]) -> JournalResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(buf)?;
    file.sync_all()?;
    Ok(())
}

/// Remove a stale marker file, used by tests and tooling.
#[allow(dead_code)]
pub(crate) fn remove_mark_file(dir: &Path) -> std::io::Result<()> {
    fs::remove_file(dir.join(MARK_FILE_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn marks_order_lexicographically() {
        let a = LogMark::new(JournalId::new(1), 500);
        let b = LogMark::new(JournalId::new(2), 0);
        let c = LogMark::new(JournalId::new(2), 100);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(LogMark::MIN, LogMark::default());
    }

    #[test]
    fn roll_then_read_round_trips() {
        let tmp = TempDir::new().expect("tempdir");
        let dirs = vec![tmp.path().join("a"), tmp.path().join("b")];
        for d in &dirs {
            fs::create_dir_all(d).expect("mkdir");
        }

        let mark = LogMark::new(JournalId::new(0x1234), 9876);
        LastLogMark::roll_log(mark, &dirs).expect("roll");

        let cursor = LastLogMark::new();
        cursor.read_from(&dirs);
        assert_eq!(cursor.current(), mark);
    }

    #[test]
    fn read_takes_maximum_across_directories() {
        let tmp = TempDir::new().expect("tempdir");
        let dirs = vec![tmp.path().join("a"), tmp.path().join("b")];
        for d in &dirs {
            fs::create_dir_all(d).expect("mkdir");
        }

        let older = LogMark::new(JournalId::new(5), 100);
        let newer = LogMark::new(JournalId::new(7), 10);
        LastLogMark::roll_log(older, &dirs[..1]).expect("roll older");
        LastLogMark::roll_log(newer, &dirs[1..]).expect("roll newer");

        let cursor = LastLogMark::new();
        cursor.read_from(&dirs);
        assert_eq!(cursor.current(), newer);
    }

    #[test]
    fn read_survives_a_missing_copy() {
        let tmp = TempDir::new().expect("tempdir");
        let dirs = vec![tmp.path().join("a"), tmp.path().join("b")];
        for d in &dirs {
            fs::create_dir_all(d).expect("mkdir");
        }

        let mark = LogMark::new(JournalId::new(3), 42);
        LastLogMark::roll_log(mark, &dirs).expect("roll");
        remove_mark_file(&dirs[0]).expect("remove");

        let cursor = LastLogMark::new();
        cursor.read_from(&dirs);
        assert_eq!(cursor.current(), mark);
    }

    #[test]
    fn roll_fails_when_no_directory_accepts() {
        let tmp = TempDir::new().expect("tempdir");
        let missing = vec![tmp.path().join("does-not-exist")];
        let mark = LogMark::new(JournalId::new(1), 1);
        assert!(matches!(
            LastLogMark::roll_log(mark, &missing),
            Err(JournalError::Io(_))
        ));
    }

    #[test]
    fn advance_keeps_maximum() {
        let cursor = LastLogMark::new();
        cursor.advance_to(LogMark::new(JournalId::new(2), 10));
        cursor.advance_to(LogMark::new(JournalId::new(2), 10));
        assert_eq!(cursor.current(), LogMark::new(JournalId::new(2), 10));
    }
}
