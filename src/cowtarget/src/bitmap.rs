//! The redirection bitmap and its lock-free publication.
//!
//! One bit per chunk: set iff the chunk currently lives on the cow device.
//! Bit-packing follows the scheme in `mmap.rs`'s `AtomicBitmap` (word =
//! bit / 64, offset = bit % 64, little-endian bit order within the word),
//! except a `BitmapSnapshot` is an immutable value published wholesale
//! through `arc_swap::ArcSwap` rather than a word array of per-bit
//! atomics: readers never mutate, so there is nothing to race once a
//! snapshot is published, and publication itself is what needs to be
//! atomic (design option (b) from the original design notes: clone the
//! bitmap, mutate the clone, atomically publish it).

use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;

use crate::chunk::{self, BITS_PER_METADATA_SECTOR, METADATA_SECTORS, SECTOR_SIZE};
use crate::error::{Error, Result};

const WORD_BITS: u64 = 64;

/// An immutable snapshot of the redirection bitmap.
///
/// `nr_chunks` bounds which bits are meaningful; the word array is always
/// padded out to whole sectors so `sector_bytes` never has to special-case
/// a partial trailing word.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BitmapSnapshot {
    nr_chunks: u64,
    words: Vec<u64>,
}

impl BitmapSnapshot {
    /// A zeroed snapshot sized for `nr_chunks` chunks, word count rounded
    /// up so that whole 512-byte metadata sectors can always be read or
    /// written without overrunning the buffer.
    pub fn new_zeroed(nr_chunks: u64) -> Result<Self> {
        if nr_chunks > chunk::MAX_CHUNKS {
            return Err(Error::TooLarge {
                chunks: nr_chunks,
                max_chunks: chunk::MAX_CHUNKS,
            });
        }
        let words_per_sector = (SECTOR_SIZE * 8 / WORD_BITS) as usize;
        let sectors = sectors_for_chunks(nr_chunks) as usize;
        let words = vec![0u64; sectors * words_per_sector];
        Ok(Self { nr_chunks, words })
    }

    /// Reconstruct a snapshot from raw metadata-sector bytes read off the
    /// cow device (as produced by the metadata loader).
    pub fn from_sector_bytes(nr_chunks: u64, bytes: &[u8]) -> Result<Self> {
        let mut snap = Self::new_zeroed(nr_chunks)?;
        let word_bytes = (WORD_BITS / 8) as usize;
        for (i, word) in snap.words.iter_mut().enumerate() {
            let start = i * word_bytes;
            if start + word_bytes > bytes.len() {
                break;
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[start..start + word_bytes]);
            *word = u64::from_le_bytes(buf);
        }
        Ok(snap)
    }

    pub fn nr_chunks(&self) -> u64 {
        self.nr_chunks
    }

    /// Whether chunk `c` currently lives on the cow device.
    #[inline]
    pub fn test(&self, c: u64) -> bool {
        debug_assert!(chunk::chunk_bounds_ok(c, self.nr_chunks));
        let word = (c / WORD_BITS) as usize;
        let offset = c % WORD_BITS;
        (self.words[word] >> offset) & 1 != 0
    }

    #[inline]
    pub fn set(&mut self, c: u64) {
        debug_assert!(chunk::chunk_bounds_ok(c, self.nr_chunks));
        let word = (c / WORD_BITS) as usize;
        let offset = c % WORD_BITS;
        self.words[word] |= 1u64 << offset;
    }

    #[inline]
    pub fn clear(&mut self, c: u64) {
        debug_assert!(chunk::chunk_bounds_ok(c, self.nr_chunks));
        let word = (c / WORD_BITS) as usize;
        let offset = c % WORD_BITS;
        self.words[word] &= !(1u64 << offset);
    }

    /// The 512 bytes of `sector_index` within the reserved metadata
    /// region, as written verbatim to cow-device sector `sector_index`.
    pub fn sector_bytes(&self, sector_index: u64) -> Result<[u8; SECTOR_SIZE as usize]> {
        if sector_index >= METADATA_SECTORS {
            return Err(Error::OutOfBounds {
                sector: sector_index,
            });
        }
        let words_per_sector = (SECTOR_SIZE * 8 / WORD_BITS) as usize;
        let start = sector_index as usize * words_per_sector;
        let mut out = [0u8; SECTOR_SIZE as usize];
        for (i, word) in self.words[start..start + words_per_sector].iter().enumerate() {
            out[i * 8..i * 8 + 8].copy_from_slice(&word.to_le_bytes());
        }
        Ok(out)
    }
}

/// Number of metadata sectors needed to cover `nr_chunks` bits.
pub fn sectors_for_chunks(nr_chunks: u64) -> u64 {
    nr_chunks.div_ceil(BITS_PER_METADATA_SECTOR).max(1)
}

/// The metadata-sector index that bit `chunk` is persisted in: one sector
/// covers 4096 bits.
#[inline]
pub fn sector_index_for_chunk(c: u64) -> u64 {
    c / BITS_PER_METADATA_SECTOR
}

/// Many-readers/one-writer publication of a `BitmapSnapshot`.
///
/// Readers call `read_snapshot` and hold the returned guard for the
/// duration of their use of the bitmap; this is the reader critical
/// section from the design document. `arc_swap::Guard` keeps the
/// snapshot's backing `Arc` alive for exactly as long as the guard is
/// held, which is this crate's substitute for the original's hazard-
/// pointer/epoch-based deferred reclamation: a writer's `ArcSwap::store`
/// never frees memory a live guard still points at.
pub struct RedirectionBitmap {
    published: ArcSwap<BitmapSnapshot>,
    write_lock: Mutex<()>,
}

impl RedirectionBitmap {
    pub fn new(initial: BitmapSnapshot) -> Self {
        Self {
            published: ArcSwap::from_pointee(initial),
            write_lock: Mutex::new(()),
        }
    }

    /// Enter a reader critical section and borrow the current snapshot.
    pub fn read_snapshot(&self) -> Guard<Arc<BitmapSnapshot>> {
        self.published.load()
    }

    /// Serialize a mutation under the write-side mutex: clone the
    /// currently published snapshot, hand the clone to `f`, then publish
    /// the mutated clone. `f`'s return value is passed through.
    ///
    /// Atomicity of test-and-set is guaranteed for the duration of `f`
    /// because `write_lock` excludes concurrent mutators; a concurrent
    /// *reader* may still observe either the pre- or post-mutation
    /// snapshot, consistent with the design document's guarantee.
    pub fn with_write_lock<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut BitmapSnapshot) -> R,
    {
        let _guard = self.write_lock.lock();
        let mut next = (**self.published.load()).clone();
        let result = f(&mut next);
        self.published.store(Arc::new(next));
        result
    }
}
