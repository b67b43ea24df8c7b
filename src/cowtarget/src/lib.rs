//! A block-level copy-on-write virtual device.
//!
//! Presents a logical block device composed of two physical backing
//! devices — an **origin**, preserved read-only from the moment of
//! activation, and a **cow**, which receives every post-activation write
//! plus the pre-write copy of whichever chunk that write first touches.
//! See `SPEC_FULL.md` (alongside this crate in the repository) for the
//! full design.
//!
//! The crate's public entry point is [`Target`]: activate one against an
//! origin and cow path, then issue [`Target::read`]/[`Target::write`]
//! calls against it.

pub mod bitmap;
pub mod chunk;
pub mod device;
pub mod error;
pub mod io;
pub mod job;
pub mod mapper;
pub mod request;
pub mod scheduler;
pub mod target;

pub use device::{BlockDevice, FileBlockDevice};
pub use error::{Error, Result};
pub use request::Direction;
pub use scheduler::{Scheduler, ThreadPoolScheduler};
pub use target::Target;
