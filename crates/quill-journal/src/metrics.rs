//! Counters and recorders for the journal pipeline.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Aggregate of durations observed by a [`LatencyRecorder`], in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub events: u64,
    pub total_micros: u64,
    pub max_micros: u64,
}

impl LatencySnapshot {
    /// Mean latency in microseconds, zero when nothing was recorded.
    pub fn mean_micros(&self) -> u64 {
        if self.events == 0 {
            0
        } else {
            self.total_micros / self.events
        }
    }
}

/// Running latency aggregate. Units are microseconds.
#[derive(Debug, Default)]
pub struct LatencyRecorder {
    events: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl LatencyRecorder {
    pub fn record(&self, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        self.events.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            events: self.events.load(Ordering::Relaxed),
            total_micros: self.total_micros.load(Ordering::Relaxed),
            max_micros: self.max_micros.load(Ordering::Relaxed),
        }
    }
}

/// Aggregate of values observed by a [`ValueRecorder`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueSnapshot {
    pub events: u64,
    pub sum: u64,
    pub max: u64,
}

impl ValueSnapshot {
    /// Mean recorded value, zero when nothing was recorded.
    pub fn mean(&self) -> u64 {
        if self.events == 0 {
            0
        } else {
            self.sum / self.events
        }
    }
}

/// Running value aggregate (batch sizes, grouping counts).
#[derive(Debug, Default)]
pub struct ValueRecorder {
    events: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl ValueRecorder {
    pub fn record(&self, value: u64) {
        self.events.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ValueSnapshot {
        ValueSnapshot {
            events: self.events.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

/// Instrumentation for the journal pipeline.
///
/// A handle is passed in at construction and shared by the producer path,
/// the writer and the force-writer; there is no process-global registry.
#[derive(Debug, Default)]
pub struct JournalMetrics {
    /// Entries sitting in the ingest queue.
    pub(crate) queue_size: AtomicI64,
    /// Requests sitting in the force-write queue.
    pub(crate) force_write_queue_size: AtomicI64,
    /// Payload bytes handed to the buffered channel.
    pub(crate) write_bytes: AtomicU64,
    /// Flushes triggered by the group-wait window expiring.
    pub(crate) flush_max_wait: AtomicU64,
    /// Flushes triggered by outstanding bytes or batched entries.
    pub(crate) flush_max_outstanding: AtomicU64,
    /// Flushes triggered by the ingest queue running dry.
    pub(crate) flush_empty_queue: AtomicU64,
    /// Enqueue-to-acknowledgement latency.
    pub(crate) add_latency: LatencyRecorder,
    /// Enqueue-to-buffer-copy latency.
    pub(crate) mem_add_latency: LatencyRecorder,
    /// Buffer flushes incurred while copying a single entry.
    pub(crate) mem_add_flushes: ValueRecorder,
    /// Time spent pushing the write buffer to the OS.
    pub(crate) flush_latency: LatencyRecorder,
    /// Time spent creating and pre-allocating a new journal file.
    pub(crate) creation_latency: LatencyRecorder,
    /// Entries per flushed batch.
    pub(crate) batch_entries: ValueRecorder,
    /// Bytes per flushed batch.
    pub(crate) batch_bytes: ValueRecorder,
    /// Entries acknowledged by a single fsync under group force.
    pub(crate) grouping_count: ValueRecorder,
}

/// Point-in-time copy of every journal instrument.
#[derive(Debug, Clone, Copy, Default)]
pub struct JournalMetricsSnapshot {
    pub queue_size: i64,
    pub force_write_queue_size: i64,
    pub write_bytes: u64,
    pub flush_max_wait: u64,
    pub flush_max_outstanding: u64,
    pub flush_empty_queue: u64,
    pub add_latency: LatencySnapshot,
    pub mem_add_latency: LatencySnapshot,
    pub mem_add_flushes: ValueSnapshot,
    pub flush_latency: LatencySnapshot,
    pub creation_latency: LatencySnapshot,
    pub batch_entries: ValueSnapshot,
    pub batch_bytes: ValueSnapshot,
    pub grouping_count: ValueSnapshot,
}

impl JournalMetrics {
    #[inline]
    pub(crate) fn incr_queue_size(&self) {
        self.queue_size.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decr_queue_size(&self) {
        self.queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_force_write_queue_size(&self) {
        self.force_write_queue_size.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn decr_force_write_queue_size(&self) {
        self.force_write_queue_size.fetch_sub(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_write_bytes(&self, bytes: u64) {
        self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_flush_max_wait(&self) {
        self.flush_max_wait.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_flush_max_outstanding(&self) {
        self.flush_max_outstanding.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr_flush_empty_queue(&self) {
        self.flush_empty_queue.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> JournalMetricsSnapshot {
        JournalMetricsSnapshot {
            queue_size: self.queue_size.load(Ordering::Relaxed),
            force_write_queue_size: self.force_write_queue_size.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            flush_max_wait: self.flush_max_wait.load(Ordering::Relaxed),
            flush_max_outstanding: self.flush_max_outstanding.load(Ordering::Relaxed),
            flush_empty_queue: self.flush_empty_queue.load(Ordering::Relaxed),
            add_latency: self.add_latency.snapshot(),
            mem_add_latency: self.mem_add_latency.snapshot(),
            mem_add_flushes: self.mem_add_flushes.snapshot(),
            flush_latency: self.flush_latency.snapshot(),
            creation_latency: self.creation_latency.snapshot(),
            batch_entries: self.batch_entries.snapshot(),
            batch_bytes: self.batch_bytes.snapshot(),
            grouping_count: self.grouping_count.snapshot(),
        }
    }
}
