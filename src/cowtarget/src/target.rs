//! The target context: one per active virtual device. Owns the backing
//! device handles, the published bitmap, the job pool and the scheduler,
//! and drives activation/teardown (§4.6).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bitmap::{sectors_for_chunks, BitmapSnapshot, RedirectionBitmap};
use crate::chunk::{self, SECTOR_SIZE};
use crate::device::{BlockDevice, FileBlockDevice};
use crate::error::{Error, Result};
use crate::job::{Job, JobPool, Waiter, DEFAULT_JOB_POOL_CAPACITY};
use crate::mapper::{self, Decision};
use crate::request::Direction;
use crate::scheduler::{Scheduler, ThreadPoolScheduler};

/// Fields every CoW job needs a handle to; split out from `Target` itself
/// so a `Job` can hold an `Arc<Shared>` without also needing the job pool
/// or scheduler (which only the mapper touches).
pub(crate) struct Shared {
    pub(crate) bitmap: RedirectionBitmap,
    pub(crate) cow: Arc<dyn BlockDevice>,
    pub(crate) origin: Arc<dyn BlockDevice>,
    /// Chunks with a `Job` currently copying them, each mapped to the
    /// writes queued up behind that job rather than starting a redundant
    /// second copy. An entry exists from the moment `submit_cow_job`
    /// creates the owning `Job` until that job drains it in
    /// `Job::notify_waiters`.
    pub(crate) pending: Mutex<HashMap<u64, Vec<Waiter>>>,
}

/// One active CoW virtual device.
///
/// # Deployment contract
///
/// The cow device's reserved metadata region (its first 8 sectors) must
/// be zeroed before first activation, either because it is freshly
/// allocated/zero-filled storage or because the deployer explicitly zeros
/// it. This crate does not attempt to distinguish "freshly zeroed" from
/// "previously used by a different target" (see DESIGN.md's notes on this
/// open question); activating against a recycled, non-zeroed cow device
/// from an unrelated target will silently misinterpret its leftover bits.
pub struct Target {
    scheduler: ThreadPoolScheduler,
    job_pool: Arc<JobPool>,
    shared: Arc<Shared>,
    nr_chunks: u64,
}

impl Target {
    /// Activate with default worker-pool sizing (host parallelism) and
    /// the default job-pool capacity.
    pub fn activate(origin_path: impl AsRef<Path>, cow_path: impl AsRef<Path>) -> Result<Self> {
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::activate_with(origin_path, cow_path, workers, DEFAULT_JOB_POOL_CAPACITY)
    }

    /// Activate from the framework's raw argument list: exactly two
    /// tokens, origin path then cow path (§6's "Activation arguments").
    pub fn activate_from_args(args: &[String]) -> Result<Self> {
        if args.len() != 2 {
            return Err(Error::InvalidArgument("Invalid argument count".into()));
        }
        Self::activate(&args[0], &args[1])
    }

    /// Activate with explicit worker-pool and job-pool sizing.
    pub fn activate_with(
        origin_path: impl AsRef<Path>,
        cow_path: impl AsRef<Path>,
        worker_count: usize,
        job_pool_capacity: usize,
    ) -> Result<Self> {
        let origin = FileBlockDevice::open_origin(origin_path)?;
        let cow = FileBlockDevice::open_cow(cow_path)?;

        let nr_chunks = chunk::nr_chunks_for_sectors(origin.sector_count());
        if nr_chunks > chunk::MAX_CHUNKS {
            return Err(Error::TooLarge {
                chunks: nr_chunks,
                max_chunks: chunk::MAX_CHUNKS,
            });
        }

        let bitmap = Self::load_metadata(&cow, nr_chunks)?;
        info!(nr_chunks, worker_count, job_pool_capacity, "cow target activated");

        Ok(Self {
            scheduler: ThreadPoolScheduler::new(worker_count),
            job_pool: Arc::new(JobPool::new(job_pool_capacity)),
            shared: Arc::new(Shared {
                bitmap: RedirectionBitmap::new(bitmap),
                cow: Arc::new(cow),
                origin: Arc::new(origin),
                pending: Mutex::new(HashMap::new()),
            }),
            nr_chunks,
        })
    }

    /// §4.5: read the bitmap back from the cow device's reserved header
    /// region. A zeroed region round-trips to a zeroed, all-origin
    /// bitmap, which is exactly the "cow device has never been
    /// initialized" case.
    fn load_metadata(cow: &FileBlockDevice, nr_chunks: u64) -> Result<BitmapSnapshot> {
        let sectors = sectors_for_chunks(nr_chunks);
        if sectors > chunk::METADATA_SECTORS {
            return Err(Error::TooLarge {
                chunks: nr_chunks,
                max_chunks: chunk::MAX_CHUNKS,
            });
        }
        let mut bytes = vec![0u8; (sectors * SECTOR_SIZE) as usize];
        cow.read_at(&mut bytes, 0)?;
        BitmapSnapshot::from_sector_bytes(nr_chunks, &bytes)
    }

    pub fn nr_chunks(&self) -> u64 {
        self.nr_chunks
    }

    /// Read `buf.len()` bytes (a multiple of 512, confined to one chunk)
    /// starting at virtual-device sector `start_sector`.
    pub fn read(&self, start_sector: u64, buf: &mut [u8]) -> Result<()> {
        let sector_count = self.sector_count_of(buf.len())?;
        match mapper::decide(
            &self.shared.bitmap,
            self.nr_chunks,
            Direction::Read,
            start_sector,
            sector_count,
        ) {
            Decision::RemapToOrigin => self
                .shared
                .origin
                .read_at(buf, start_sector)
                .map_err(Error::from),
            Decision::RemapToCow { device_sector } => self
                .shared
                .cow
                .read_at(buf, device_sector)
                .map_err(Error::from),
            Decision::NeedsCow { .. } => {
                unreachable!("the mapper never returns NeedsCow for a read")
            }
            Decision::Kill(e) => Err(e),
        }
    }

    /// Write `buf` (a multiple of 512 bytes, confined to one chunk)
    /// starting at virtual-device sector `start_sector`. Blocks until the
    /// write — including any first-touch CoW job it triggers — has
    /// durably landed on cow.
    pub fn write(&self, start_sector: u64, buf: &[u8]) -> Result<()> {
        let sector_count = self.sector_count_of(buf.len())?;
        match mapper::decide(
            &self.shared.bitmap,
            self.nr_chunks,
            Direction::Write,
            start_sector,
            sector_count,
        ) {
            Decision::RemapToCow { device_sector } => self
                .shared
                .cow
                .write_at_durable(buf, device_sector)
                .map_err(Error::from),
            Decision::NeedsCow { chunk } => self.submit_cow_job(chunk, start_sector, buf.to_vec()),
            Decision::RemapToOrigin => {
                unreachable!("the mapper never returns RemapToOrigin for a write")
            }
            Decision::Kill(e) => Err(e),
        }
    }

    fn sector_count_of(&self, byte_len: usize) -> Result<u64> {
        if byte_len == 0 || byte_len as u64 % SECTOR_SIZE != 0 {
            return Err(Error::InvalidArgument(format!(
                "buffer length {byte_len} is not a positive multiple of the sector size"
            )));
        }
        Ok(byte_len as u64 / SECTOR_SIZE)
    }

    /// §4.3 step 5: either register as a waiter behind an already
    /// in-flight job for this chunk, or allocate a job from the pool and
    /// enqueue it as that chunk's owner. Two truly concurrent writers to
    /// an untouched chunk must never both perform the 4 KiB copy
    /// independently — the slower one's copy could land after the
    /// faster one's completed write and silently overwrite it — so
    /// `shared.pending` ensures at most one `Job` ever owns a given
    /// chunk's copy at a time (P3's "at most one winner" extended from
    /// the bitmap bit to the in-flight window before it's set).
    ///
    /// Job-pool acquisition and scheduler enqueue happen within one
    /// reader critical section so the bitmap (and, through `shared`, the
    /// devices and scheduler it's entangled with) cannot be retired out
    /// from under the mapper while it still holds a reference. Blocks
    /// the caller on a completion channel, this crate's synchronous
    /// stand-in for "SUBMITTED — will complete asynchronously, the
    /// framework resumes the request later."
    fn submit_cow_job(&self, chunk: u64, write_start_sector: u64, data: Vec<u8>) -> Result<()> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        {
            // Reader critical section: held across job-pool acquisition
            // and scheduler enqueue, per the design document's note that
            // this is deliberate (it's what keeps the pool/scheduler
            // alive for the job's benefit during teardown races).
            let _snapshot = self.shared.bitmap.read_snapshot();

            let mut pending = self.shared.pending.lock();
            if let Some(waiters) = pending.get_mut(&chunk) {
                waiters.push(Waiter {
                    write_start_sector,
                    write_data: data,
                    completion: tx,
                });
                drop(pending);
                return Self::await_completion(chunk, rx);
            }

            let permit = self
                .job_pool
                .try_acquire()
                .ok_or(Error::ResourceExhausted("job pool exhausted"))?;
            pending.insert(chunk, Vec::new());
            drop(pending);

            let job = Job::new(permit, self.shared.clone(), chunk, write_start_sector, data, tx);
            if let Err(e) = self.scheduler.submit(job) {
                // The job never ran and never will drain its pending
                // entry; remove it ourselves so the chunk isn't wedged.
                self.shared.pending.lock().remove(&chunk);
                return Err(e);
            }
        }

        Self::await_completion(chunk, rx)
    }

    fn await_completion(chunk: u64, rx: crossbeam_channel::Receiver<Result<()>>) -> Result<()> {
        match rx.recv() {
            Ok(result) => result,
            Err(_) => {
                warn!(chunk, "cow job sender dropped without completing");
                Err(Error::ResourceExhausted("cow job did not complete"))
            }
        }
    }

    /// Teardown (§4.6): drain the worker pool (no new jobs are admitted
    /// once this call starts, and every in-flight job is run to
    /// completion before the threads join), then drop the job pool and
    /// the bitmap/device handles. Consumes `self` so nothing can submit
    /// another request afterward.
    pub fn shutdown(self) {
        let Target {
            scheduler,
            job_pool,
            shared,
            ..
        } = self;
        scheduler.shutdown();
        drop(job_pool);
        drop(shared);
        info!("cow target torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_origin(pattern: u8, chunks: u64) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        let bytes = vec![pattern; (chunks * chunk::SECTORS_PER_CHUNK * SECTOR_SIZE) as usize];
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();
        f
    }

    fn make_zeroed_cow(chunks: u64) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        let data_bytes = chunks * chunk::SECTORS_PER_CHUNK * SECTOR_SIZE;
        let total = chunk::METADATA_SECTORS * SECTOR_SIZE + data_bytes;
        f.as_file_mut().set_len(total).unwrap();
        f
    }

    #[test]
    fn fresh_activation_pure_read_returns_origin_pattern() {
        let origin = make_origin(0xAA, 4);
        let cow = make_zeroed_cow(4);
        let target = Target::activate_with(origin.path(), cow.path(), 2, 16).unwrap();

        let mut buf = vec![0u8; 4096];
        target.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));

        target.shutdown();
    }

    #[test]
    fn first_write_then_read_round_trips_through_cow() {
        let origin = make_origin(0xAA, 4);
        let cow = make_zeroed_cow(4);
        let target = Target::activate_with(origin.path(), cow.path(), 2, 16).unwrap();

        let data = vec![0xBBu8; 4096];
        target.write(0, &data).unwrap();

        let mut readback = vec![0u8; 4096];
        target.read(0, &mut readback).unwrap();
        assert_eq!(readback, data);

        // Origin itself is untouched.
        use std::io::Read;
        let mut origin_bytes = vec![0u8; 4096];
        File::open(origin.path())
            .unwrap()
            .read_exact(&mut origin_bytes)
            .unwrap();
        assert!(origin_bytes.iter().all(|&b| b == 0xAA));

        target.shutdown();
    }

    #[test]
    fn partial_write_preserves_rest_of_chunk() {
        let origin = make_origin(0xAA, 4);
        let cow = make_zeroed_cow(4);
        let target = Target::activate_with(origin.path(), cow.path(), 2, 16).unwrap();

        target.write(3, &[0xCC; 512]).unwrap();

        let mut readback = vec![0u8; 4096];
        target.read(0, &mut readback).unwrap();
        assert_eq!(&readback[0..1536], &vec![0xAA; 1536][..]);
        assert_eq!(&readback[1536..2048], &[0xCC; 512][..]);
        assert_eq!(&readback[2048..], &vec![0xAA; 2048][..]);

        target.shutdown();
    }

    #[test]
    fn oversized_activation_is_rejected() {
        // One chunk beyond the 32768-chunk / 128 MiB ceiling.
        let huge_chunks = chunk::MAX_CHUNKS + 1;
        let mut origin = NamedTempFile::new().unwrap();
        origin
            .as_file_mut()
            .set_len(huge_chunks * chunk::SECTORS_PER_CHUNK * SECTOR_SIZE)
            .unwrap();
        let cow = NamedTempFile::new().unwrap();
        cow.as_file()
            .set_len(chunk::METADATA_SECTORS * SECTOR_SIZE)
            .unwrap();

        let result = Target::activate_with(origin.path(), cow.path(), 1, 16);
        assert!(matches!(result, Err(Error::TooLarge { .. })));
    }

    #[test]
    fn wrong_argument_count_rejected() {
        let result = Target::activate_from_args(&["only-one".to_string()]);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        if let Err(Error::InvalidArgument(msg)) = result {
            assert_eq!(msg, "Invalid argument count");
        }
    }
}
