//! Contract consumed from the node's directory manager.

use std::path::PathBuf;

/// Supplies the directories where checkpoint marker files live.
///
/// The directory manager is owned by the node, not the journal; it tracks
/// which data directories are currently accepting writes (disks fill up or
/// go read-only at runtime). The journal only consumes the two listings.
pub trait MarkDirs: Send + Sync {
    /// Directories that are currently writable. Marker files are persisted
    /// to every one of these.
    fn writable_dirs(&self) -> Vec<PathBuf>;

    /// Every known directory, writable or not. Recovery reads marker files
    /// from all of them and keeps the maximum.
    fn all_dirs(&self) -> Vec<PathBuf>;
}

/// A static directory set. Suitable for single-disk nodes and tests.
#[derive(Debug, Clone)]
pub struct FixedDirs {
    dirs: Vec<PathBuf>,
}

impl FixedDirs {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// A single-directory set.
    pub fn single(dir: impl Into<PathBuf>) -> Self {
        Self {
            dirs: vec![dir.into()],
        }
    }
}

impl MarkDirs for FixedDirs {
    fn writable_dirs(&self) -> Vec<PathBuf> {
        self.dirs.clone()
    }

    fn all_dirs(&self) -> Vec<PathBuf> {
        self.dirs.clone()
    }
}
