//! The CoW job: the per-first-write state machine that copies a chunk
//! from origin to cow, updates the in-memory bitmap, persists the
//! changed metadata sector, and finally completes the original write.
//!
//! State names and transitions follow the design document literally:
//! INITIALIZED -> COPYING -> UPDATING -> PERSISTING -> COMPLETING, with
//! any state able to transition to ERROR. Modeled as a plain tagged enum
//! per the design notes ("model explicitly as a tagged variant... the
//! ERROR variant carries the underlying I/O error").

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::Sender;
use crossbeam_queue::ArrayQueue;
use tracing::{error, trace, warn};

use crate::bitmap::sector_index_for_chunk;
use crate::chunk::{cow_chunk_base_sector, cow_sector, origin_chunk_base_sector, SECTOR_SIZE, SECTORS_PER_CHUNK};
use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::target::Shared;

/// Default/minimum job-pool capacity (spec.md §4.6: "capacity >= 256
/// pre-allocated records").
pub const DEFAULT_JOB_POOL_CAPACITY: usize = 256;

/// A write that arrived for a chunk that is already being copied by
/// another in-flight `Job`. Rather than starting a second independent
/// copy — which could race its own full-chunk copy against the first
/// job's completed write and silently clobber it — the request waits
/// for the owning job to finish the copy/persist, then performs its own
/// write against the now-valid cow chunk. See `Shared::pending` and
/// `Job::notify_waiters`.
pub(crate) struct Waiter {
    pub(crate) write_start_sector: u64,
    pub(crate) write_data: Vec<u8>,
    pub(crate) completion: Sender<Result<()>>,
}

/// The job's state tag. Carries no payload itself; `Job::error` is the
/// separate error field the design document calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Initialized,
    Copying,
    Updating,
    Persisting,
    Completing,
    Error,
}

/// A bounded, pre-reserved pool of job admission permits.
///
/// The original design pools fixed job *records* so a worker never has to
/// call into the allocator (which may sleep or fail) while under memory
/// pressure. Rust's allocator does not need that slab discipline for
/// correctness, but the pool still needs to bound how many jobs are
/// in flight and to fail admission immediately — never block — when
/// exhausted (P5). We get both with a fixed-capacity permit queue:
/// acquiring a permit is the non-blocking "allocate a job record" step,
/// and dropping the returned `JobPermit` (when the job reaches a terminal
/// state) is "free the job".
pub struct JobPool {
    permits: ArrayQueue<()>,
    capacity: usize,
    in_use: AtomicUsize,
}

impl JobPool {
    pub fn new(capacity: usize) -> Self {
        let permits = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Queue was just constructed with this exact capacity; push
            // cannot fail.
            let _ = permits.push(());
        }
        Self {
            permits,
            capacity,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Non-blocking acquire. Returns `None` on exhaustion — the mapper
    /// must map that to a KILL, not a retry loop.
    pub fn try_acquire(self: &Arc<Self>) -> Option<JobPermit> {
        self.permits.pop()?;
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(JobPermit { pool: self.clone() })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }
}

/// RAII admission permit; returns its slot to the pool on drop.
pub struct JobPermit {
    pool: Arc<JobPool>,
}

impl Drop for JobPermit {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::AcqRel);
        // Queue was sized to `capacity` and we only ever hand out
        // `capacity` permits, so this can never overflow the queue.
        let _ = self.pool.permits.push(());
    }
}

/// A CoW job: allocated from the job pool in the mapper under a reader
/// critical section, enqueued to the scheduler, and run to completion (or
/// error) on a worker thread.
pub struct Job {
    _permit: JobPermit,
    ctx: Arc<Shared>,
    chunk: u64,
    write_start_sector: u64,
    write_data: Vec<u8>,
    state: JobState,
    error: Option<Error>,
    completion: Sender<Result<()>>,
}

impl Job {
    pub fn new(
        permit: JobPermit,
        ctx: Arc<Shared>,
        chunk: u64,
        write_start_sector: u64,
        write_data: Vec<u8>,
        completion: Sender<Result<()>>,
    ) -> Self {
        Self {
            _permit: permit,
            ctx,
            chunk,
            write_start_sector,
            write_data,
            state: JobState::Initialized,
            error: None,
            completion,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Drive the job to completion. Consumes `self`: a job never outlives
    /// its single run, matching "the job must not outlive its
    /// submission."
    ///
    /// A `Job` is the sole owner of its chunk's `Shared::pending` entry
    /// for its entire run (`Target::submit_cow_job` only ever creates one
    /// `Job` per chunk per pending window; concurrent writers to the same
    /// chunk instead register as waiters on this entry). That makes it
    /// safe to perform the 4 KiB copy exactly once here and only let any
    /// writer's bytes — this job's own, or a waiter's — land on cow after
    /// that copy (and the bitmap persist, if needed) has completed.
    pub fn run(mut self) {
        trace!(chunk = self.chunk, "cow job starting");

        // Step 1: early short-circuit. A prior, already-finished-and-
        // retired job may have already won the race for this chunk
        // before this one was even created (submit_cow_job re-checks the
        // pending map, but not the bitmap itself, under its lock).
        let already_set = {
            let snapshot = self.ctx.bitmap.read_snapshot();
            snapshot.test(self.chunk)
        };

        if !already_set {
            if let Err(e) = self.copy_chunk() {
                self.fail_everyone(e);
                return;
            }
            if let Err(e) = self.update_and_persist() {
                self.fail_everyone(e);
                return;
            }
        } else {
            trace!(chunk = self.chunk, "chunk already valid on cow, skipping copy");
        }

        self.finish_own_write();
        self.notify_waiters();
    }

    /// State COPYING: synchronously copy the whole 4 KiB chunk from
    /// origin to cow.
    fn copy_chunk(&mut self) -> Result<()> {
        self.state = JobState::Copying;
        let mut page = vec![0u8; (SECTORS_PER_CHUNK * SECTOR_SIZE) as usize];
        self.ctx
            .origin
            .read_at(&mut page, origin_chunk_base_sector(self.chunk))?;
        self.ctx
            .cow
            .write_at_durable(&page, cow_chunk_base_sector(self.chunk))?;
        Ok(())
    }

    /// States UPDATING + PERSISTING: under the single write-lock critical
    /// section, re-test (another job may have won while we were copying),
    /// set the bit, and persist exactly the one metadata sector it lives
    /// in. Rolls the bit back on a persist failure (I2).
    fn update_and_persist(&mut self) -> Result<()> {
        self.state = JobState::Updating;
        let chunk = self.chunk;
        let ctx = self.ctx.clone();

        let outcome = ctx.bitmap.with_write_lock(|bm| -> Result<()> {
            // Defensive: with pending-chunk dedup this job is the sole
            // owner of `chunk`'s copy, so the bit cannot have been set by
            // anyone else here. Kept to match the design document's
            // literal step 3 ("re-test... if already set, skip to
            // completion") and to stay correct if that invariant is ever
            // loosened.
            if bm.test(chunk) {
                return Ok(());
            }
            bm.set(chunk);

            let sector_index = sector_index_for_chunk(chunk);
            let bytes = bm.sector_bytes(sector_index)?;

            if let Err(e) = ctx.cow.write_at_durable(&bytes, sector_index) {
                bm.clear(chunk);
                warn!(chunk, error = %e, "metadata persist failed, rolled back bit");
                return Err(Error::from(e));
            }
            Ok(())
        });
        if outcome.is_ok() {
            self.state = JobState::Persisting;
        }
        outcome
    }

    /// State COMPLETING: the chunk is now valid on cow; perform this
    /// job's own original write against cow and signal its completion.
    /// Waiters riding along on the same chunk are handled separately by
    /// `notify_waiters`, after this.
    fn finish_own_write(&mut self) {
        self.state = JobState::Completing;
        let sector = cow_sector(self.write_start_sector);
        match self.ctx.cow.write_at_durable(&self.write_data, sector) {
            Ok(()) => {
                trace!(chunk = self.chunk, "cow job completed");
                let _ = self.completion.send(Ok(()));
            }
            Err(e) => {
                self.state = JobState::Error;
                error!(chunk = self.chunk, error = %e, "cow job's own write failed");
                let _ = self.completion.send(Err(Error::from(e)));
            }
        }
    }

    /// Drain every waiter that queued up behind this job's chunk while it
    /// was in flight and perform each one's write now that the chunk is
    /// confirmed valid on cow. Removes the chunk's `Shared::pending` entry
    /// so the next request for this chunk takes the ordinary
    /// already-set-bit fast path instead of registering as a waiter.
    fn notify_waiters(&mut self) {
        for waiter in self.take_waiters() {
            let sector = cow_sector(waiter.write_start_sector);
            let result = self
                .ctx
                .cow
                .write_at_durable(&waiter.write_data, sector)
                .map_err(Error::from);
            let _ = waiter.completion.send(result);
        }
    }

    fn take_waiters(&self) -> Vec<Waiter> {
        self.ctx.pending.lock().remove(&self.chunk).unwrap_or_default()
    }

    /// The copy or the metadata persist failed before the chunk could be
    /// made valid on cow: nobody waiting on this chunk can proceed, so
    /// every one of them — this job's own submitter included — gets the
    /// same error and must retry at a higher layer.
    fn fail_everyone(&mut self, e: Error) {
        error!(chunk = self.chunk, error = %e, "cow job failed");
        self.state = JobState::Error;
        self.error = Some(e);
        let err = self.error.as_ref().unwrap();
        let _ = self.completion.send(Err(err.duplicate()));
        for waiter in self.take_waiters() {
            let _ = waiter.completion.send(Err(err.duplicate()));
        }
    }
}
