//! The durability half of the journal pipeline.
//!
//! The writer flushes batches to the OS and hands them over as
//! [`ForceWriteRequest`]s; this loop fsyncs them, advances the durable
//! frontier, and dispatches completion callbacks. Under adaptive group
//! force it skips redundant fsyncs: after syncing a file it posts a
//! marker into its own queue, and every real request dequeued before that
//! marker was already covered by the sync that preceded it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::channel::JournalChannel;
use crate::config::JournalId;
use crate::error::JournalResult;
use crate::executor::OrderedExecutor;
use crate::journal::{QueueEntry, WriterCommand};
use crate::mark::{LastLogMark, LogMark};
use crate::metrics::JournalMetrics;

pub(crate) enum ForceWriteCommand {
    Request(ForceWriteRequest),
    Shutdown,
}

/// One flushed batch awaiting durability.
pub(crate) struct ForceWriteRequest {
    pub(crate) channel: Arc<JournalChannel>,
    pub(crate) log_id: JournalId,
    /// Flushed range `[flush_start, flush_end)` within the file.
    pub(crate) flush_start: u64,
    pub(crate) flush_end: u64,
    /// Entries acknowledged once this request is durable.
    pub(crate) waiters: Vec<QueueEntry>,
    /// Set on the batch that pushed the file past its size limit; the
    /// force-writer closes the file after syncing it.
    pub(crate) should_close: bool,
    /// Markers carry no data; they only re-arm the fsync for the next
    /// real request.
    pub(crate) is_marker: bool,
}

impl ForceWriteRequest {
    fn marker(channel: Arc<JournalChannel>) -> Self {
        Self {
            log_id: channel.id(),
            channel,
            flush_start: 0,
            flush_end: 0,
            waiters: Vec::new(),
            should_close: false,
            is_marker: true,
        }
    }

    /// Sync (when required), advance the mark, and hand the waiters to the
    /// callback executor. The file close runs even when syncing fails so a
    /// rotated file is never leaked.
    fn process(&mut self, should_force: bool, ctx: &ForceWriteContext) -> JournalResult<usize> {
        if self.is_marker {
            return Ok(0);
        }

        let result = (|| {
            if should_force {
                if ctx.group_force_enabled {
                    self.channel.force_write(false)?;
                } else {
                    self.channel
                        .sync_range_or_force_write(self.flush_start, self.flush_end - self.flush_start)?;
                }
            }
            ctx.last_mark
                .advance_to(LogMark::new(self.log_id, self.flush_end));

            let acked = self.waiters.len();
            for entry in self.waiters.drain(..) {
                let metrics = Arc::clone(&ctx.metrics);
                match entry.key {
                    Some(key) => ctx
                        .executor
                        .submit_ordered(key, move || entry.complete(&metrics)),
                    None => ctx.executor.submit(move || entry.complete(&metrics)),
                }
            }
            Ok(acked)
        })();

        self.close_file_if_necessary();
        result
    }

    fn close_file_if_necessary(&mut self) {
        if self.should_close {
            if let Err(err) = self.channel.close() {
                error!(journal_id = %self.log_id, error = %err, "failed to close journal file");
            }
            self.should_close = false;
        }
    }
}

pub(crate) struct ForceWriteContext {
    pub(crate) rx: Receiver<ForceWriteCommand>,
    /// Loop-back sender used to post markers behind in-flight requests.
    pub(crate) marker_tx: Sender<ForceWriteCommand>,
    /// Wakes the writer when a sync failure takes the pipeline down.
    pub(crate) writer_tx: Sender<WriterCommand>,
    pub(crate) last_mark: Arc<LastLogMark>,
    pub(crate) executor: Arc<OrderedExecutor>,
    pub(crate) metrics: Arc<JournalMetrics>,
    pub(crate) running: Arc<AtomicBool>,
    pub(crate) group_force_enabled: bool,
}

pub(crate) fn force_write_loop(ctx: ForceWriteContext) {
    info!("force-write thread started");
    let mut should_force = true;
    let mut count_in_last_force: u64 = 0;

    loop {
        let cmd = match ctx.rx.recv() {
            Ok(cmd) => cmd,
            Err(_) => break,
        };
        match cmd {
            ForceWriteCommand::Request(req) => {
                if let Err(err) =
                    handle_request(req, &mut should_force, &mut count_in_last_force, &ctx)
                {
                    // Losing an fsync means losing the durability contract;
                    // stop the pipeline and let the node restart.
                    error!(error = %err, "I/O failure in force-write thread");
                    ctx.running.store(false, Ordering::SeqCst);
                    let _ = ctx.writer_tx.send(WriterCommand::Shutdown);
                    break;
                }
            }
            ForceWriteCommand::Shutdown => {
                drain_remaining(&ctx, &mut should_force, &mut count_in_last_force);
                break;
            }
        }
    }
    info!("force-write thread exiting");
}

fn handle_request(
    mut req: ForceWriteRequest,
    should_force: &mut bool,
    count_in_last_force: &mut u64,
    ctx: &ForceWriteContext,
) -> JournalResult<()> {
    ctx.metrics.decr_force_write_queue_size();

    let is_marker = req.is_marker;
    let should_close = req.should_close;

    if !is_marker && *should_force {
        if ctx.group_force_enabled {
            // Requests already queued behind this one are covered by the
            // sync we are about to issue; the marker tells us where that
            // coverage ends.
            let marker = ForceWriteRequest::marker(Arc::clone(&req.channel));
            if ctx
                .marker_tx
                .send(ForceWriteCommand::Request(marker))
                .is_ok()
            {
                ctx.metrics.incr_force_write_queue_size();
            }
        }
        if *count_in_last_force > 0 {
            ctx.metrics.grouping_count.record(*count_in_last_force);
            *count_in_last_force = 0;
        }
    }

    let acked = req.process(*should_force, ctx)?;
    *count_in_last_force += acked as u64;

    // A real, non-closing request under group force means the next real
    // request may ride on the sync just issued; anything else re-arms it.
    *should_force = !(ctx.group_force_enabled && !is_marker && !should_close);
    Ok(())
}

/// Process whatever is already queued so every flushed batch that reached
/// this thread gets its fsync and callbacks before shutdown completes.
fn drain_remaining(ctx: &ForceWriteContext, should_force: &mut bool, count_in_last_force: &mut u64) {
    while let Ok(cmd) = ctx.rx.try_recv() {
        match cmd {
            ForceWriteCommand::Request(req) => {
                if let Err(err) = handle_request(req, should_force, count_in_last_force, ctx) {
                    warn!(error = %err, "I/O failure while draining force-write queue");
                    break;
                }
            }
            ForceWriteCommand::Shutdown => {}
        }
    }
}
