//! The request mapper: the hot path that decides, per request, whether a
//! sector currently lives on origin or cow.
//!
//! This module holds only the pure bitmap-driven decision (§4.3 steps
//! 1-4); it never touches the job pool or the scheduler so it can be unit
//! tested without any I/O. `Target::submit` (in `target.rs`) is what
//! extends the reader critical section across job allocation and
//! enqueue, as the design requires.

use crate::bitmap::RedirectionBitmap;
use crate::chunk::{chunk, cow_sector};
use crate::error::Error;
use crate::request::{validate_span, Direction};

/// What the mapper decided for one request, before any job-pool
/// involvement.
#[derive(Debug)]
pub enum Decision {
    /// Chunk bit was set: redirect straight to the cow device.
    RemapToCow { device_sector: u64 },
    /// Chunk bit was clear and this is a read: redirect straight to
    /// origin (identity sector mapping).
    RemapToOrigin,
    /// Chunk bit was clear and this is a write: the caller must perform
    /// a CoW job for this chunk before the write can land.
    NeedsCow { chunk: u64 },
    /// Reject the request outright.
    Kill(Error),
}

/// Manual `PartialEq`: `Error` itself has no `PartialEq` (it wraps a
/// non-comparable `io::Error`), so `Kill` variants compare by rendered
/// message rather than deriving structural equality crate-wide.
impl PartialEq for Decision {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Decision::RemapToCow { device_sector: a }, Decision::RemapToCow { device_sector: b }) => a == b,
            (Decision::RemapToOrigin, Decision::RemapToOrigin) => true,
            (Decision::NeedsCow { chunk: a }, Decision::NeedsCow { chunk: b }) => a == b,
            (Decision::Kill(a), Decision::Kill(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

/// Map one request against the current bitmap snapshot (§4.3 algorithm,
/// steps 1-4). `start_sector`/`sector_count` describe the request; it must
/// already be known to fit within one chunk (see `validate_span`) — this
/// function re-validates defensively and returns `Kill` if it does not.
pub fn decide(
    bitmap: &RedirectionBitmap,
    nr_chunks: u64,
    direction: Direction,
    start_sector: u64,
    sector_count: u64,
) -> Decision {
    let c = match validate_span(start_sector, sector_count, nr_chunks) {
        Ok(c) => c,
        Err(e) => return Decision::Kill(e),
    };

    // Reader critical section: borrowing the guard's target is wait-free
    // and bounded — no syscalls, no allocation, no blocking.
    let snapshot = bitmap.read_snapshot();
    if snapshot.test(c) {
        Decision::RemapToCow {
            device_sector: cow_sector(start_sector),
        }
    } else if direction == Direction::Read {
        Decision::RemapToOrigin
    } else {
        Decision::NeedsCow { chunk: c }
    }
    // `snapshot` (the guard) drops here, ending the reader critical
    // section for the bitmap test itself; `Target::submit` re-enters its
    // own critical section around job allocation for the NeedsCow case,
    // since that step additionally touches the job pool and scheduler.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{BitmapSnapshot, RedirectionBitmap};

    fn bitmap(nr_chunks: u64) -> RedirectionBitmap {
        RedirectionBitmap::new(BitmapSnapshot::new_zeroed(nr_chunks).unwrap())
    }

    #[test]
    fn untouched_chunk_read_goes_to_origin() {
        let b = bitmap(10);
        let d = decide(&b, 10, Direction::Read, 0, 8);
        assert_eq!(d, Decision::RemapToOrigin);
    }

    #[test]
    fn untouched_chunk_write_needs_cow() {
        let b = bitmap(10);
        let d = decide(&b, 10, Direction::Write, 3, 1);
        assert_eq!(d, Decision::NeedsCow { chunk: 0 });
    }

    #[test]
    fn touched_chunk_remaps_to_cow_for_either_direction() {
        let b = bitmap(10);
        b.with_write_lock(|bm| bm.set(0));
        assert_eq!(
            decide(&b, 10, Direction::Read, 3, 1),
            Decision::RemapToCow { device_sector: 11 }
        );
        assert_eq!(
            decide(&b, 10, Direction::Write, 0, 8),
            Decision::RemapToCow { device_sector: 8 }
        );
    }

    #[test]
    fn out_of_range_chunk_is_killed() {
        let b = bitmap(1);
        match decide(&b, 1, Direction::Read, 8, 1) {
            Decision::Kill(_) => {}
            other => panic!("expected Kill, got {other:?}"),
        }
    }
}
