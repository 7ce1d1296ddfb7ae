//! Append-only journal files.
//!
//! A [`JournalChannel`] owns one `<hex id>.txn` file: a fixed header
//! followed by framed records. Appends go through a user-space buffer and
//! are pushed to the OS with [`JournalChannel::flush`]; durability is a
//! separate step ([`JournalChannel::force_write`]) so the force-write loop
//! can group fsyncs across batches. Files are extended in pre-allocated
//! extents to keep length changes off the fsync path.
//!
//! [`JournalFileReader`] is the scan-side counterpart used by replay.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::JournalId;
use crate::error::{JournalError, JournalResult};

/// Magic bytes opening every journal file.
pub const JOURNAL_MAGIC: [u8; 4] = *b"QLOG";

/// Fixed header length: magic, big-endian format version, zero padding to
/// one sector so the first record starts sector-aligned in every version.
pub const HEADER_SIZE: u64 = 512;

pub const FORMAT_V1: u32 = 1;
pub const FORMAT_V2: u32 = 2;
pub const FORMAT_V3: u32 = 3;
pub const FORMAT_V4: u32 = 4;
/// First version that may contain padding records.
pub const FORMAT_V5: u32 = 5;
pub const FORMAT_VERSION_LATEST: u32 = FORMAT_V5;

/// Length word that introduces a padding record (`-0x100` as an `i32`).
pub const PADDING_MASK: u32 = 0xFFFF_FF00;

/// Zero bytes to append after an 8-byte padding frame so the write cursor
/// lands on an alignment boundary. Returns 0 when already aligned.
///
/// The 8-byte frame (mask word + length word) is part of the contract:
/// callers write `PADDING_MASK | pad_len | pad_len zero bytes`.
pub(crate) fn padding_record_len(position: u64, alignment: u64) -> u64 {
    let residual = position % alignment;
    if residual == 0 {
        return 0;
    }
    let to_boundary = alignment - residual;
    if to_boundary < 8 {
        // Not enough room for the frame itself; pad through to the
        // following boundary instead.
        alignment - (8 - to_boundary)
    } else {
        to_boundary - 8
    }
}

fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileExt;
        file.write_all_at(buf, offset)
    }
    #[cfg(not(unix))]
    {
        let mut handle = file;
        handle.seek(SeekFrom::Start(offset))?;
        std::io::Write::write_all(&mut handle, buf)
    }
}

/// Whether a failed data-only sync should be retried as a full fsync.
fn fdatasync_unsupported(err: &std::io::Error) -> bool {
    if err.kind() == std::io::ErrorKind::Unsupported {
        return true;
    }
    let code = match err.raw_os_error() {
        Some(code) => code,
        None => return false,
    };
    #[cfg(unix)]
    {
        matches!(code, libc::ENOSYS | libc::EINVAL | libc::ENOTSUP)
    }
    #[cfg(windows)]
    {
        // ERROR_INVALID_FUNCTION: the volume has no data-only sync.
        code == 1
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = code;
        false
    }
}

struct ChannelInner {
    /// Bytes accepted but not yet handed to the OS.
    buf: Vec<u8>,
    /// File offset the next flushed byte lands at.
    file_position: u64,
    /// End of the pre-allocated region.
    next_prealloc: u64,
}

/// Writable journal file with buffered appends and extent pre-allocation.
///
/// The writer thread is the only caller of the append-side methods; the
/// force-write thread calls [`force_write`](Self::force_write) and
/// [`close`](Self::close), both of which are safe against the writer's
/// buffer because syncing operates on the file handle alone.
pub struct JournalChannel {
    id: JournalId,
    path: PathBuf,
    file: File,
    format_version: u32,
    write_buffer_size: usize,
    prealloc_size: u64,
    alignment: u64,
    remove_pages_from_cache: bool,
    closed: AtomicBool,
    inner: Mutex<ChannelInner>,
}

impl JournalChannel {
    /// Create a fresh journal file, write its header, and pre-allocate the
    /// first extent.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        dir: &Path,
        id: JournalId,
        prealloc_size: u64,
        write_buffer_size: usize,
        alignment: usize,
        remove_pages_from_cache: bool,
        format_version: u32,
    ) -> JournalResult<Self> {
        let path = dir.join(id.file_name());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = vec![0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&JOURNAL_MAGIC);
        header[4..8].copy_from_slice(&format_version.to_be_bytes());
        write_all_at(&file, &header, 0)?;

        let alignment = alignment as u64;
        let next_prealloc = prealloc_size.max(HEADER_SIZE + alignment);
        let zeros = vec![0u8; alignment as usize];
        write_all_at(&file, &zeros, next_prealloc - alignment)?;
        file.sync_all()?;

        debug!(journal_id = %id, path = %path.display(), format_version, "created journal file");

        Ok(Self {
            id,
            path,
            file,
            format_version,
            write_buffer_size,
            prealloc_size,
            alignment,
            remove_pages_from_cache,
            closed: AtomicBool::new(false),
            inner: Mutex::new(ChannelInner {
                buf: Vec::with_capacity(write_buffer_size),
                file_position: HEADER_SIZE,
                next_prealloc,
            }),
        })
    }

    #[inline]
    pub fn id(&self) -> JournalId {
        self.id
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Logical write position: flushed bytes plus whatever sits in the
    /// user-space buffer.
    pub fn position(&self) -> u64 {
        let inner = self.inner.lock();
        inner.file_position + inner.buf.len() as u64
    }

    /// Extend the pre-allocated region if the next `len` bytes would run
    /// past it. Extending writes a zero block at the new tail so the file
    /// length grows outside the fsync path.
    pub fn pre_alloc_if_needed(&self, len: u64) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        self.pre_alloc_locked(&mut inner, len)
    }

    fn pre_alloc_locked(&self, inner: &mut ChannelInner, len: u64) -> JournalResult<()> {
        let position = inner.file_position + inner.buf.len() as u64;
        if position + len <= inner.next_prealloc {
            return Ok(());
        }
        while position + len > inner.next_prealloc {
            inner.next_prealloc += self.prealloc_size;
        }
        let zeros = vec![0u8; self.alignment as usize];
        write_all_at(&self.file, &zeros, inner.next_prealloc - self.alignment)?;
        trace!(journal_id = %self.id, next_prealloc = inner.next_prealloc, "extended journal file");
        Ok(())
    }

    /// Append bytes through the user-space buffer. Returns how many times
    /// the buffer spilled to the OS along the way.
    pub fn write(&self, bytes: &[u8]) -> JournalResult<u32> {
        let mut inner = self.inner.lock();
        self.write_locked(&mut inner, bytes)
    }

    fn write_locked(&self, inner: &mut ChannelInner, mut bytes: &[u8]) -> JournalResult<u32> {
        if self.closed.load(Ordering::Acquire) {
            return Err(JournalError::invalid_state(
                "attempted to write to a closed journal channel",
            ));
        }
        let mut spills = 0u32;
        while !bytes.is_empty() {
            let room = self.write_buffer_size - inner.buf.len();
            if room == 0 {
                self.flush_locked(inner)?;
                spills += 1;
                continue;
            }
            let take = room.min(bytes.len());
            inner.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
        }
        Ok(spills)
    }

    /// Append a padding record so the next record starts on an alignment
    /// boundary. No-op when already aligned.
    pub fn write_padding(&self) -> JournalResult<()> {
        let mut inner = self.inner.lock();
        let position = inner.file_position + inner.buf.len() as u64;
        if position % self.alignment == 0 {
            return Ok(());
        }
        let pad_len = padding_record_len(position, self.alignment);
        self.pre_alloc_locked(&mut inner, 8 + pad_len)?;
        let mut frame = [0u8; 8];
        frame[0..4].copy_from_slice(&PADDING_MASK.to_be_bytes());
        frame[4..8].copy_from_slice(&(pad_len as i32).to_be_bytes());
        self.write_locked(&mut inner, &frame)?;
        let zeros = vec![0u8; pad_len as usize];
        self.write_locked(&mut inner, &zeros)?;
        Ok(())
    }

    /// Push the user-space buffer to the OS. Does not fsync. With
    /// `clear_cache` set, hints the kernel to drop the flushed pages.
    pub fn flush(&self, clear_cache: bool) -> JournalResult<()> {
        let flushed_to = {
            let mut inner = self.inner.lock();
            self.flush_locked(&mut inner)?;
            inner.file_position
        };
        if clear_cache {
            self.drop_page_cache(flushed_to);
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut ChannelInner) -> JournalResult<()> {
        if inner.buf.is_empty() {
            return Ok(());
        }
        write_all_at(&self.file, &inner.buf, inner.file_position)?;
        inner.file_position += inner.buf.len() as u64;
        inner.buf.clear();
        Ok(())
    }

    /// Fsync the file. `metadata` selects a full fsync; otherwise a
    /// data-only sync is used where the platform offers one.
    pub fn force_write(&self, metadata: bool) -> JournalResult<()> {
        if metadata {
            self.file.sync_all()?;
        } else {
            match self.file.sync_data() {
                Ok(()) => {}
                Err(err) if fdatasync_unsupported(&err) => self.file.sync_all()?,
                Err(err) => return Err(err.into()),
            }
        }
        if self.remove_pages_from_cache {
            let synced_to = self.inner.lock().file_position;
            self.drop_page_cache(synced_to);
        }
        Ok(())
    }

    /// Ask the kernel to start writing back `[start, end)` without
    /// blocking. Platforms without range sync fall back to a full
    /// [`force_write`](Self::force_write).
    pub fn start_sync_range(&self, start: u64, end: u64) -> JournalResult<()> {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe {
                libc::sync_file_range(
                    self.file.as_raw_fd(),
                    start as libc::off64_t,
                    (end - start) as libc::off64_t,
                    libc::SYNC_FILE_RANGE_WRITE,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (start, end);
            self.force_write(false)
        }
    }

    /// Synchronously write back `len` bytes starting at `start`, or fsync
    /// the whole file where range sync is unavailable.
    pub fn sync_range_or_force_write(&self, start: u64, len: u64) -> JournalResult<()> {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let flags = libc::SYNC_FILE_RANGE_WAIT_BEFORE
                | libc::SYNC_FILE_RANGE_WRITE
                | libc::SYNC_FILE_RANGE_WAIT_AFTER;
            let rc = unsafe {
                libc::sync_file_range(
                    self.file.as_raw_fd(),
                    start as libc::off64_t,
                    len as libc::off64_t,
                    flags,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = (start, len);
            self.force_write(false)
        }
    }

    fn drop_page_cache(&self, len: u64) {
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;
            let rc = unsafe {
                libc::posix_fadvise(
                    self.file.as_raw_fd(),
                    0,
                    len as libc::off_t,
                    libc::POSIX_FADV_DONTNEED,
                )
            };
            if rc != 0 {
                trace!(journal_id = %self.id, rc, "posix_fadvise failed");
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = len;
        }
    }

    /// Flush remaining buffered bytes, sync, and mark the channel closed.
    /// Idempotent; the first caller wins and later calls are no-ops.
    pub fn close(&self) -> JournalResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut inner = self.inner.lock();
            self.flush_locked(&mut inner)?;
        }
        match self.file.sync_data() {
            Ok(()) => {}
            Err(err) if fdatasync_unsupported(&err) => self.file.sync_all()?,
            Err(err) => return Err(err.into()),
        }
        debug!(journal_id = %self.id, "closed journal file");
        Ok(())
    }
}

/// Sequential reader over an existing journal file, used by replay.
pub struct JournalFileReader {
    reader: BufReader<File>,
    format_version: u32,
    position: u64,
}

impl JournalFileReader {
    /// Open a journal for scanning, starting at `position` (positions at
    /// or before the header resolve to the first record).
    pub fn open(dir: &Path, id: JournalId, position: u64) -> JournalResult<Self> {
        let path = dir.join(id.file_name());
        let mut file = File::open(&path)?;

        let mut header = [0u8; 8];
        file.read_exact(&mut header).map_err(|err| {
            JournalError::format(format!(
                "journal {} too short for header: {err}",
                path.display()
            ))
        })?;
        if header[0..4] != JOURNAL_MAGIC {
            return Err(JournalError::format(format!(
                "bad magic in journal {}",
                path.display()
            )));
        }
        let format_version = u32::from_be_bytes(
            header[4..8]
                .try_into()
                .map_err(|_| JournalError::format("journal version corrupt"))?,
        );
        if !(FORMAT_V1..=FORMAT_VERSION_LATEST).contains(&format_version) {
            return Err(JournalError::format(format!(
                "unknown journal format version {format_version} in {}",
                path.display()
            )));
        }

        let start = position.max(HEADER_SIZE);
        file.seek(SeekFrom::Start(start))?;
        Ok(Self {
            reader: BufReader::new(file),
            format_version,
            position: start,
        })
    }

    #[inline]
    pub fn format_version(&self) -> u32 {
        self.format_version
    }

    /// Offset of the next unread byte.
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read until `buf` is full or the file ends; returns bytes read.
    /// Short counts mean a truncated tail, which callers treat as the end
    /// of the journal.
    pub fn read_fully(&mut self, buf: &mut [u8]) -> JournalResult<usize> {
        let mut total = 0;
        while total < buf.len() {
            let n = self.reader.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        self.position += total as u64;
        Ok(total)
    }
}
