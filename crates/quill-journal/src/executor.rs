//! Keyed completion-callback executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::JournalResult;

enum Job {
    Run(Box<dyn FnOnce() + Send + 'static>),
    Shutdown,
}

/// Fixed pool of worker threads with per-key ordering.
///
/// Jobs submitted with the same key land on the same worker and therefore
/// run in submission order; unkeyed jobs round-robin across the pool. The
/// force-writer uses this to deliver completion callbacks in enqueue order
/// per ledger without serializing unrelated ledgers.
pub struct OrderedExecutor {
    workers: Vec<Sender<Job>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next: AtomicUsize,
}

impl OrderedExecutor {
    /// Spawn `threads` workers named `<name>-0` through `<name>-N`.
    pub fn new(name: &str, threads: usize) -> JournalResult<Self> {
        let threads = threads.max(1);
        let mut workers = Vec::with_capacity(threads);
        let mut handles = Vec::with_capacity(threads);
        for idx in 0..threads {
            let (tx, rx) = unbounded::<Job>();
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        match job {
                            Job::Run(f) => f(),
                            Job::Shutdown => break,
                        }
                    }
                })?;
            workers.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            workers,
            handles: Mutex::new(handles),
            next: AtomicUsize::new(0),
        })
    }

    /// Run `f` on the worker owning `key`. Jobs sharing a key execute in
    /// submission order.
    pub fn submit_ordered<F>(&self, key: u64, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = (key % self.workers.len() as u64) as usize;
        self.dispatch(idx, f);
    }

    /// Run `f` on any worker.
    pub fn submit<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.dispatch(idx, f);
    }

    fn dispatch<F>(&self, idx: usize, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.workers[idx].send(Job::Run(Box::new(f))).is_err() {
            // Only reachable once shutdown has begun; the callback is lost,
            // which the durability contract permits at shutdown.
            warn!("callback executor rejected a job during shutdown");
        }
    }

    /// Drain every worker and join the pool. Jobs already queued run to
    /// completion before the workers exit.
    pub fn shutdown(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        if handles.is_empty() {
            return;
        }
        for worker in &self.workers {
            let _ = worker.send(Job::Shutdown);
        }
        for handle in handles {
            if handle.join().is_err() {
                warn!("callback worker panicked during shutdown");
            }
        }
        debug!("callback executor stopped");
    }
}

impl Drop for OrderedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn keyed_jobs_run_in_submission_order() {
        let pool = OrderedExecutor::new("test-cb", 4).expect("executor");
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        for i in 0..64u32 {
            let seen = seen.clone();
            pool.submit_ordered(9, move || {
                // Stagger early jobs so any misordering would surface.
                if i < 4 {
                    std::thread::sleep(Duration::from_millis(5));
                }
                seen.lock().unwrap().push(i);
            });
        }
        pool.shutdown();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn unkeyed_jobs_all_run() {
        let pool = OrderedExecutor::new("test-cb", 2).expect("executor");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = OrderedExecutor::new("test-cb", 1).expect("executor");
        pool.shutdown();
        pool.shutdown();
    }
}
