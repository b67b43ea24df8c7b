//! The scheduler bridge: a bounded worker pool that runs CoW jobs
//! asynchronously off the mapper's hot path.
//!
//! Modeled on `BlockWorker::run`/`work()`
//! (`src/devices/src/virtio/block/worker.rs`): one `thread::spawn` per
//! worker, each looping on a channel recv, generalized from "one thread
//! per virtio queue" to "N threads draining one job queue". Shutdown
//! closes the channel and joins every thread, giving the drain-to-
//! quiescence operation teardown needs — the same shape as that module's
//! `STOP_WORKER` signal followed by `JoinHandle::join` in the device's
//! drop path.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::job::Job;

/// Anything that can accept a CoW job for asynchronous execution. A real
/// framework embedding would bridge this to its own workqueue; this
/// crate ships `ThreadPoolScheduler` for standalone use.
pub trait Scheduler: Send + Sync {
    /// Enqueue `job`. Must not block; returns an error only if the
    /// scheduler itself cannot accept more work (e.g. already shut down).
    fn submit(&self, job: Job) -> Result<()>;
}

/// A fixed-size pool of worker threads draining one job queue.
pub struct ThreadPoolScheduler {
    sender: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolScheduler {
    /// Spawn `worker_count` threads (must be >= 1). Defaulting to the
    /// host's available parallelism is the caller's choice (see
    /// `Target::activate`), mirroring the config surface note in the
    /// design document: there is nothing else to configure here beyond
    /// this one constructor parameter.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let receiver: Receiver<Job> = receiver.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("cowtarget-worker-{id}"))
                    .spawn(move || Self::work(receiver))
                    .expect("failed to spawn cow worker thread"),
            );
        }
        Self { sender, workers }
    }

    fn work(receiver: Receiver<Job>) {
        // `recv()` returns `Err` once every `Sender` half has been
        // dropped (i.e. on shutdown), which is this loop's exit
        // condition — the channel closing is the "drain, then stop"
        // signal, replacing `BlockDevSignalMask::STOP_WORKER`.
        while let Ok(job) = receiver.recv() {
            job.run();
        }
    }

    /// Drain outstanding jobs and join every worker thread. Consumes
    /// `self`: once shut down, a scheduler cannot be resubmitted to.
    pub fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.join() {
                error!(?e, "cow worker thread panicked during shutdown");
            }
        }
    }
}

impl Scheduler for ThreadPoolScheduler {
    fn submit(&self, job: Job) -> Result<()> {
        self.sender.send(job).map_err(|_| {
            warn!("cow job submitted after scheduler shutdown");
            Error::ResourceExhausted("scheduler is shut down")
        })
    }
}
