//! The `BlockDevice` trait: the boundary to "the host block-layer
//! framework" that `spec.md` places out of scope, plus a file-backed
//! implementation modeled on `DiskProperties`
//! (`src/devices/src/virtio/block/device.rs`) for standalone use and
//! testing.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::chunk::SECTOR_SIZE;
use crate::io::{durable_write_at, pread_exact_at, sector_to_byte_offset};

/// A block device the core can issue positioned, synchronous I/O
/// against. Production embeddings (an NBD server, a device-mapper
/// binding, a FUSE passthrough) provide their own implementation over
/// whatever "submit I/O"/"synchronous I/O" primitives their framework
/// already exposes; `FileBlockDevice` below is this crate's stand-in for
/// standalone use.
pub trait BlockDevice: Send + Sync {
    /// Read `buf.len()` bytes starting at `sector`.
    fn read_at(&self, buf: &mut [u8], sector: u64) -> io::Result<()>;

    /// Write `buf` starting at `sector` with write-through + FUA
    /// semantics: the call does not return until the bytes are durable.
    fn write_at_durable(&self, buf: &[u8], sector: u64) -> io::Result<()>;

    /// Total sectors addressable on this device.
    fn sector_count(&self) -> u64;
}

/// A `BlockDevice` backed by a plain file or block special file, opened
/// the way `DiskProperties::new` opens a disk image: read-write unless
/// `read_only`, sized by `fstat`.
pub struct FileBlockDevice {
    file: File,
    sector_count: u64,
}

impl FileBlockDevice {
    /// Open `path` for origin-style use: read-only, no write-through
    /// flag needed since the core never writes to origin.
    pub fn open_origin(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file)
    }

    /// Open `path` for cow-style use: read-write, `O_DSYNC` so every
    /// write call already implies write-through before `durable_write_at`
    /// issues its completion-barrier `fdatasync`.
    pub fn open_cow(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DSYNC)
            .open(path.as_ref())?;
        Self::from_file(file)
    }

    fn from_file(file: File) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            sector_count: len / SECTOR_SIZE,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_at(&self, buf: &mut [u8], sector: u64) -> io::Result<()> {
        pread_exact_at(&self.file, buf, sector_to_byte_offset(sector))
    }

    fn write_at_durable(&self, buf: &[u8], sector: u64) -> io::Result<()> {
        durable_write_at(&self.file, buf, sector_to_byte_offset(sector))
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}
