// src/threading.rs
//! Fork-join work dispatch for the parallel step phases.
//!
//! A fixed set of worker threads is started on the first parallel dispatch
//! and lives as long as the `ThreadManager`. Each dispatch splits the items
//! into chunks, pushes one job per chunk through a crossbeam channel and
//! blocks until every job has reported back. A worker panic is caught on the
//! worker and re-raised on the calling thread after the join.

use crossbeam::channel::{unbounded, SendError, Sender};
use std::any::Any;
use std::fmt;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Chunks handed out per worker and dispatch, for load balancing.
const CHUNKS_PER_WORKER: usize = 4;

struct Workers {
    jobs: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    fn spawn(count: usize) -> Self {
        let (tx, rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("physics-worker-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => log::warn!("failed to spawn physics worker {}: {}", i, e),
            }
        }
        log::debug!("started {} physics worker(s)", handles.len());
        Self { jobs: Some(tx), handles }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop.
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

pub struct ThreadManager {
    threads: usize,
    dispatches: AtomicU64,
    workers: OnceLock<Workers>,
}

impl fmt::Debug for ThreadManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadManager")
            .field("threads", &self.threads)
            .field("dispatches", &self.dispatch_count())
            .field("started", &self.workers.get().is_some())
            .finish()
    }
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ThreadManager {
    /// `threads == 0` uses the available hardware parallelism.
    pub fn new(threads: usize) -> Self {
        let threads = if threads == 0 {
            thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
        } else {
            threads
        };
        log::debug!("thread manager using {} worker(s)", threads);
        Self {
            threads,
            dispatches: AtomicU64::new(0),
            workers: OnceLock::new(),
        }
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Number of parallel dispatches so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }

    /// Runs `f` once per item. Runs inline when `parallel` is false, when
    /// there is one worker, or when there is at most one item.
    pub fn for_each<T, F>(&self, items: &mut [T], parallel: bool, f: F)
    where
        T: Send,
        F: Fn(&mut T) + Sync,
    {
        if !parallel || self.threads <= 1 || items.len() <= 1 {
            items.iter_mut().for_each(f);
            return;
        }

        self.dispatches.fetch_add(1, Ordering::Relaxed);
        let workers = self.workers.get_or_init(|| Workers::spawn(self.threads));

        let chunks = self.threads * CHUNKS_PER_WORKER;
        let chunk_size = ((items.len() + chunks - 1) / chunks).max(1);
        let queue = workers.jobs.as_ref().filter(|_| !workers.handles.is_empty());
        let (done_tx, done_rx) = unbounded::<thread::Result<()>>();
        let f = &f;
        let mut pending = 0usize;

        for chunk in items.chunks_mut(chunk_size) {
            let done = done_tx.clone();
            let job: Box<dyn FnOnce() + Send + '_> = Box::new(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| chunk.iter_mut().for_each(f)));
                let _ = done.send(result);
            });
            // SAFETY: the job borrows `items` and `f`. This function does not
            // return before every job has either run to completion or been
            // dropped unexecuted, both of which drop its `done` sender, and
            // the receive loop below only ends once all senders are gone.
            let job: Job = unsafe { std::mem::transmute::<Box<dyn FnOnce() + Send + '_>, Job>(job) };
            pending += 1;
            match queue {
                Some(jobs) => {
                    if let Err(SendError(job)) = jobs.send(job) {
                        job();
                    }
                }
                None => job(),
            }
        }
        drop(done_tx);

        let mut first_panic: Option<Box<dyn Any + Send>> = None;
        while let Ok(result) = done_rx.recv() {
            pending -= 1;
            if let Err(payload) = result {
                first_panic.get_or_insert(payload);
            }
        }
        debug_assert_eq!(pending, 0);

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }
    }
}
