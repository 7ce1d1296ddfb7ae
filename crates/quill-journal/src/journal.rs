//! The journal pipeline: ingest queue, writer loop, replay and
//! checkpointing.
//!
//! Appends flow producer -> ingest queue -> writer -> force-writer. The
//! writer frames entries into the current journal file and decides when a
//! batch is worth flushing (adaptive group commit); the force-writer makes
//! flushed batches durable and acknowledges them. Recovery walks the
//! journals from the persisted [`LogMark`] and replays every record the
//! node acknowledged before the crash.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{JournalChannel, JournalFileReader, FORMAT_V5, PADDING_MASK};
use crate::config::{JournalConfig, JournalId, ResolvedConfig};
use crate::dirs::MarkDirs;
use crate::error::{JournalError, JournalResult};
use crate::executor::OrderedExecutor;
use crate::force_write::{force_write_loop, ForceWriteCommand, ForceWriteContext, ForceWriteRequest};
use crate::mark::{LastLogMark, LogMark};
use crate::metrics::JournalMetrics;

/// Completion callback for one appended entry: `(rc, ledger_id, entry_id)`.
/// `rc == 0` means the entry is fsynced into its journal file.
pub type WriteCallback = Box<dyn FnOnce(i32, i64, i64) + Send + 'static>;

/// Success code delivered to write callbacks.
pub const RC_OK: i32 = 0;

/// Consumer of replayed journal records.
pub trait JournalScanner {
    /// Handle one record: the journal's format version, the record's start
    /// offset within the file, and its payload.
    fn process(&mut self, format_version: u32, offset: u64, payload: &[u8]) -> JournalResult<()>;
}

impl<F> JournalScanner for F
where
    F: FnMut(u32, u64, &[u8]) -> JournalResult<()>,
{
    fn process(&mut self, format_version: u32, offset: u64, payload: &[u8]) -> JournalResult<()> {
        self(format_version, offset, payload)
    }
}

/// An entry waiting in the ingest queue or in the writer's current batch.
pub(crate) struct QueueEntry {
    pub(crate) payload: Vec<u8>,
    pub(crate) ledger_id: i64,
    pub(crate) entry_id: i64,
    /// Ordering key for callback dispatch; entries sharing a key are
    /// acknowledged in enqueue order.
    pub(crate) key: Option<u64>,
    pub(crate) callback: WriteCallback,
    pub(crate) enqueue_time: Instant,
}

impl QueueEntry {
    /// Record the add latency and deliver the acknowledgement.
    pub(crate) fn complete(self, metrics: &JournalMetrics) {
        metrics.add_latency.record(self.enqueue_time.elapsed());
        trace!(
            ledger_id = self.ledger_id,
            entry_id = self.entry_id,
            "acknowledging entry"
        );
        (self.callback)(RC_OK, self.ledger_id, self.entry_id);
    }
}

pub(crate) enum WriterCommand {
    Entry(QueueEntry),
    Shutdown,
}

/// An opaque checkpoint: the durable frontier at the time it was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint {
    mark: LogMark,
}

/// The write-ahead journal of a storage node.
///
/// Construct with [`Journal::new`], replay pending records with
/// [`Journal::replay`], then [`Journal::start`] the pipeline and feed it
/// with [`Journal::log_add`]. Every acknowledged entry is fsynced before
/// its callback fires.
pub struct Journal {
    config: ResolvedConfig,
    dirs: Arc<dyn MarkDirs>,
    metrics: Arc<JournalMetrics>,
    last_mark: Arc<LastLogMark>,
    running: Arc<AtomicBool>,
    executor: Arc<OrderedExecutor>,
    queue_tx: Sender<WriterCommand>,
    queue_rx: Mutex<Option<Receiver<WriterCommand>>>,
    fw_tx: Sender<ForceWriteCommand>,
    fw_rx: Mutex<Option<Receiver<ForceWriteCommand>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    force_write_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Validate the configuration, create the journal directory, and load
    /// the durable frontier from the mark files. Threads are not started
    /// until [`Journal::start`]; run [`Journal::replay`] in between.
    pub fn new(
        config: &JournalConfig,
        dirs: Arc<dyn MarkDirs>,
        metrics: Arc<JournalMetrics>,
    ) -> JournalResult<Self> {
        let resolved = config.normalized()?;
        fs::create_dir_all(&resolved.journal_dir)?;

        let last_mark = Arc::new(LastLogMark::new());
        last_mark.read_from(&dirs.all_dirs());
        debug!(mark = %last_mark.current(), "loaded last log mark");

        let executor = Arc::new(OrderedExecutor::new(
            "quill-journal-cb",
            resolved.callback_threads,
        )?);
        let (queue_tx, queue_rx) = unbounded();
        let (fw_tx, fw_rx) = unbounded();

        Ok(Self {
            config: resolved,
            dirs,
            metrics,
            last_mark,
            running: Arc::new(AtomicBool::new(true)),
            executor,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            fw_tx,
            fw_rx: Mutex::new(Some(fw_rx)),
            writer_handle: Mutex::new(None),
            force_write_handle: Mutex::new(None),
        })
    }

    /// Spawn the force-write and writer threads. Entries queued before
    /// this call are picked up once the writer is running.
    pub fn start(&self) -> JournalResult<()> {
        let queue_rx = self
            .queue_rx
            .lock()
            .take()
            .ok_or_else(|| JournalError::invalid_state("journal already started"))?;
        let fw_rx = self
            .fw_rx
            .lock()
            .take()
            .ok_or_else(|| JournalError::invalid_state("journal already started"))?;

        let fw_ctx = ForceWriteContext {
            rx: fw_rx,
            marker_tx: self.fw_tx.clone(),
            writer_tx: self.queue_tx.clone(),
            last_mark: Arc::clone(&self.last_mark),
            executor: Arc::clone(&self.executor),
            metrics: Arc::clone(&self.metrics),
            running: Arc::clone(&self.running),
            group_force_enabled: self.config.adaptive_group_writes,
        };
        let fw_handle = thread::Builder::new()
            .name("quill-force-write".to_string())
            .spawn(move || force_write_loop(fw_ctx))?;
        *self.force_write_handle.lock() = Some(fw_handle);

        let writer_ctx = WriterContext {
            config: self.config.clone(),
            rx: queue_rx,
            fw_tx: self.fw_tx.clone(),
            metrics: Arc::clone(&self.metrics),
            running: Arc::clone(&self.running),
        };
        let writer_handle = thread::Builder::new()
            .name("quill-journal".to_string())
            .spawn(move || writer_loop(writer_ctx))?;
        *self.writer_handle.lock() = Some(writer_handle);

        Ok(())
    }

    /// Queue one entry for appending. Non-blocking; the callback fires
    /// with [`RC_OK`] once the entry's batch is fsynced. Entries sharing
    /// `key` are acknowledged in enqueue order.
    pub fn log_add<F>(
        &self,
        payload: Vec<u8>,
        ledger_id: i64,
        entry_id: i64,
        key: Option<u64>,
        callback: F,
    ) -> JournalResult<()>
    where
        F: FnOnce(i32, i64, i64) + Send + 'static,
    {
        if !self.running.load(Ordering::SeqCst) {
            return Err(JournalError::ShutdownRequested);
        }
        self.metrics.incr_queue_size();
        let entry = QueueEntry {
            payload,
            ledger_id,
            entry_id,
            key,
            callback: Box::new(callback),
            enqueue_time: Instant::now(),
        };
        self.queue_tx
            .send(WriterCommand::Entry(entry))
            .map_err(|_| {
                self.metrics.decr_queue_size();
                JournalError::ShutdownRequested
            })
    }

    /// Entries waiting in the ingest queue.
    pub fn queue_len(&self) -> usize {
        self.queue_tx.len()
    }

    /// The current durable frontier.
    pub fn last_log_mark(&self) -> LogMark {
        self.last_mark.current()
    }

    pub fn metrics(&self) -> &JournalMetrics {
        &self.metrics
    }

    /// Replay every record at or past the persisted mark, in journal-id
    /// order. A truncated tail ends a journal silently (normal after an
    /// unclean shutdown); format violations abort recovery.
    pub fn replay<S: JournalScanner>(&self, scanner: &mut S) -> JournalResult<()> {
        let marked = self.last_mark.current();
        let ids = list_journal_ids(&self.config.journal_dir, |id| id >= marked.log_id)?;
        // A fresh node has no mark and possibly no journals; with a real
        // mark the marked journal itself must still exist.
        if marked.log_id.as_u64() > 0 && ids.first() != Some(&marked.log_id) {
            return Err(JournalError::MissingJournal(marked.log_id));
        }
        debug!(mark = %marked, journals = ids.len(), "replaying journals");
        for id in ids {
            let position = if id == marked.log_id { marked.offset } else { 0 };
            self.scan_journal(id, position, scanner)?;
        }
        Ok(())
    }

    /// Scan one journal file from `position`, handing each record to the
    /// scanner and advancing the in-memory mark as records are consumed so
    /// an interrupted replay resumes where it stopped.
    pub fn scan_journal<S: JournalScanner>(
        &self,
        id: JournalId,
        position: u64,
        scanner: &mut S,
    ) -> JournalResult<()> {
        let mut reader = JournalFileReader::open(&self.config.journal_dir, id, position)?;
        let version = reader.format_version();
        let mut len_buf = [0u8; 4];
        let mut record = Vec::new();

        loop {
            let offset = reader.position();
            if reader.read_fully(&mut len_buf)? != len_buf.len() {
                break;
            }
            let len_word = u32::from_be_bytes(len_buf);
            if len_word == 0 {
                break;
            }

            let mut is_padding = false;
            let record_len = if len_word == PADDING_MASK {
                if version < FORMAT_V5 {
                    return Err(JournalError::format(format!(
                        "padding record in version {version} journal {id}"
                    )));
                }
                if reader.read_fully(&mut len_buf)? != len_buf.len() {
                    break;
                }
                let pad_len = u32::from_be_bytes(len_buf);
                if pad_len == 0 {
                    continue;
                }
                is_padding = true;
                pad_len as usize
            } else if len_word > i32::MAX as u32 {
                return Err(JournalError::format(format!(
                    "invalid record length {len_word:#x} in journal {id}"
                )));
            } else {
                len_word as usize
            };

            record.resize(record_len, 0);
            if reader.read_fully(&mut record)? != record_len {
                // A short payload is where the pre-crash writer stopped.
                break;
            }
            if !is_padding {
                scanner.process(version, offset, &record)?;
            }
            self.last_mark.advance_to(LogMark::new(id, offset));
        }
        Ok(())
    }

    /// Snapshot the durable frontier as an opaque checkpoint. The caller
    /// completes it once its own state is persisted up to that point.
    pub fn new_checkpoint(&self) -> Checkpoint {
        Checkpoint {
            mark: self.last_mark.mark_log(),
        }
    }

    /// Persist the checkpoint's mark to every writable directory and, with
    /// `compact`, delete journals strictly below the mark, keeping the
    /// youngest `max_backup_journals`. Idempotent for a given checkpoint.
    pub fn checkpoint_complete(&self, checkpoint: Checkpoint, compact: bool) -> JournalResult<()> {
        LastLogMark::roll_log(checkpoint.mark, &self.dirs.writable_dirs())?;
        if compact {
            self.garbage_collect(checkpoint.mark)?;
        }
        Ok(())
    }

    fn garbage_collect(&self, mark: LogMark) -> JournalResult<()> {
        let logs = list_journal_ids(&self.config.journal_dir, |id| id < mark.log_id)?;
        if logs.len() < self.config.max_backup_journals {
            return Ok(());
        }
        let delete_up_to = logs.len() - self.config.max_backup_journals;
        for id in &logs[..delete_up_to] {
            if *id >= mark.log_id {
                continue;
            }
            let path = self.config.journal_dir.join(id.file_name());
            match fs::remove_file(&path) {
                Ok(()) => info!(journal_id = %id, "garbage collected journal"),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not delete old journal")
                }
            }
        }
        Ok(())
    }

    /// Stop the pipeline: the force-writer drains and exits, the callback
    /// pool finishes queued acknowledgements, then the writer stops.
    /// Entries never flushed were never acknowledged and are dropped.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("shutting down journal");
        let _ = self.fw_tx.send(ForceWriteCommand::Shutdown);
        if let Some(handle) = self.force_write_handle.lock().take() {
            if handle.join().is_err() {
                warn!("force-write thread panicked during shutdown");
            }
        }
        self.executor.shutdown();
        let _ = self.queue_tx.send(WriterCommand::Shutdown);
        if let Some(handle) = self.writer_handle.lock().take() {
            if handle.join().is_err() {
                warn!("journal writer panicked during shutdown");
            }
        }
        info!("journal shut down");
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// List journal ids in a directory, ascending, keeping those the filter
/// accepts.
fn list_journal_ids<F>(dir: &Path, filter: F) -> JournalResult<Vec<JournalId>>
where
    F: Fn(JournalId) -> bool,
{
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(name) = name.to_str() {
            if let Some(id) = JournalId::from_file_name(name) {
                if filter(id) {
                    ids.push(id);
                }
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::ZERO)
        .as_millis() as u64
}

fn elapsed_nanos(since: Instant) -> u64 {
    since.elapsed().as_nanos() as u64
}

struct WriterContext {
    config: ResolvedConfig,
    rx: Receiver<WriterCommand>,
    fw_tx: Sender<ForceWriteCommand>,
    metrics: Arc<JournalMetrics>,
    running: Arc<AtomicBool>,
}

fn writer_loop(ctx: WriterContext) {
    info!("journal writer started");
    match writer_run(&ctx) {
        Ok(()) => {}
        Err(JournalError::Interrupted(reason)) => {
            warn!(reason = %reason, "journal writer exiting")
        }
        Err(err) => error!(error = %err, "journal writer exiting on error"),
    }
    info!("journal writer stopped");
}

/// The group-commit loop.
///
/// Each iteration: make sure a journal file is open, pull the next entry
/// (blocking while the batch is empty, with a bounded wait otherwise),
/// decide whether the pending batch should flush, and append the pulled
/// entry. Flushed batches travel to the force-writer; the writer never
/// fsyncs.
fn writer_run(ctx: &WriterContext) -> JournalResult<()> {
    let config = &ctx.config;
    let mut log_file: Option<Arc<JournalChannel>> = None;
    let mut to_flush: Vec<QueueEntry> = Vec::new();
    let mut batch_bytes: u64 = 0;
    let mut last_flush_position: u64 = 0;
    let mut group_when_timeout = false;
    let mut running = true;
    let mut qe: Option<QueueEntry> = None;

    let mut last_log_id = list_journal_ids(&config.journal_dir, |_| true)?
        .last()
        .map(|id| id.as_u64())
        .unwrap_or(0);

    loop {
        if log_file.is_none() {
            // Ids must outrun both every existing journal and the wall
            // clock so a restart can never re-issue one.
            last_log_id = last_log_id.max(wall_clock_millis()) + 1;
            let creation_started = Instant::now();
            let created = JournalChannel::create(
                &config.journal_dir,
                JournalId::new(last_log_id),
                config.prealloc_size,
                config.write_buffer_size,
                config.alignment,
                config.remove_pages_from_cache,
                config.format_version,
            )?;
            ctx.metrics
                .creation_latency
                .record(creation_started.elapsed());
            last_flush_position = 0;
            log_file = Some(Arc::new(created));
        }
        let channel = log_file
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| JournalError::invalid_state("no journal file open"))?;

        if qe.is_none() {
            if to_flush.is_empty() {
                match ctx.rx.recv() {
                    Ok(WriterCommand::Entry(entry)) => qe = Some(entry),
                    Ok(WriterCommand::Shutdown) | Err(_) => running = false,
                }
            } else {
                let oldest_wait = elapsed_nanos(to_flush[0].enqueue_time);
                let wait_nanos = if config.flush_when_queue_empty {
                    0
                } else {
                    config.max_group_wait_nanos.saturating_sub(oldest_wait)
                };
                match ctx.rx.recv_timeout(Duration::from_nanos(wait_nanos)) {
                    Ok(WriterCommand::Entry(entry)) => qe = Some(entry),
                    Ok(WriterCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        running = false
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }

                if running {
                    let max_wait = config.max_group_wait_nanos;
                    let mut should_flush = false;
                    if max_wait > 0
                        && !group_when_timeout
                        && elapsed_nanos(to_flush[0].enqueue_time) > max_wait
                    {
                        // The batch has timed out; admit this arrival and
                        // commit on the next one that is still fresh.
                        group_when_timeout = true;
                    } else if max_wait > 0
                        && group_when_timeout
                        && qe
                            .as_ref()
                            .map_or(false, |e| elapsed_nanos(e.enqueue_time) < max_wait)
                    {
                        group_when_timeout = false;
                        should_flush = true;
                        ctx.metrics.incr_flush_max_wait();
                    } else if qe.is_some()
                        && ((config.buffered_entries_threshold > 0
                            && to_flush.len() as u64 > config.buffered_entries_threshold)
                            || (channel.position()
                                > last_flush_position + config.buffered_writes_threshold))
                    {
                        should_flush = true;
                        ctx.metrics.incr_flush_max_outstanding();
                    } else if qe.is_none() {
                        // Reachable only with flush_when_queue_empty: no
                        // more arrivals to group with, so flush now.
                        should_flush = true;
                        ctx.metrics.incr_flush_empty_queue();
                    }

                    if should_flush {
                        let flush_started = Instant::now();
                        if config.format_version >= FORMAT_V5 {
                            channel.write_padding()?;
                        }
                        channel.flush(config.remove_pages_from_cache)?;
                        let prev_flush_position = last_flush_position;
                        last_flush_position = channel.position();
                        if !config.adaptive_group_writes {
                            channel.start_sync_range(prev_flush_position, last_flush_position)?;
                        }
                        ctx.metrics.flush_latency.record(flush_started.elapsed());
                        ctx.metrics.batch_entries.record(to_flush.len() as u64);
                        ctx.metrics.batch_bytes.record(batch_bytes);

                        let should_close = last_flush_position > config.max_journal_size;
                        let request = ForceWriteRequest {
                            channel: Arc::clone(&channel),
                            log_id: channel.id(),
                            flush_start: prev_flush_position,
                            flush_end: last_flush_position,
                            waiters: std::mem::take(&mut to_flush),
                            should_close,
                            is_marker: false,
                        };
                        ctx.metrics.incr_force_write_queue_size();
                        if ctx
                            .fw_tx
                            .send(ForceWriteCommand::Request(request))
                            .is_err()
                        {
                            return Err(JournalError::interrupted(
                                "force-write thread is gone",
                            ));
                        }
                        batch_bytes = 0;

                        if should_close {
                            // The force-writer closes the old file after its
                            // final fsync; the next iteration opens a new one.
                            log_file = None;
                            continue;
                        }
                    }
                }
            }
        }

        if !running || !ctx.running.load(Ordering::SeqCst) {
            info!("journal writer asked to shut down");
            break;
        }

        let entry = match qe.take() {
            Some(entry) => entry,
            None => continue,
        };

        ctx.metrics.add_write_bytes(entry.payload.len() as u64);
        ctx.metrics.decr_queue_size();
        batch_bytes += 4 + entry.payload.len() as u64;

        channel.pre_alloc_if_needed(4 + entry.payload.len() as u64)?;
        let mut spills = channel.write(&(entry.payload.len() as i32).to_be_bytes())?;
        spills += channel.write(&entry.payload)?;
        ctx.metrics.mem_add_flushes.record(spills as u64);
        ctx.metrics
            .mem_add_latency
            .record(entry.enqueue_time.elapsed());
        to_flush.push(entry);
    }

    if let Some(channel) = log_file.take() {
        channel.close()?;
    }
    Ok(())
}
