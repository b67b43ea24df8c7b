use std::fmt;
use std::io;
use std::result;

/// Errors produced by the CoW target.
///
/// Mirrors the taxonomy in the design document: a failed activation
/// argument, an oversized target, pool/resource exhaustion, an I/O
/// failure against either backing device, or a request landing outside
/// the target's sector range.
#[derive(Debug)]
pub enum Error {
    InvalidArgument(String),
    TooLarge { chunks: u64, max_chunks: u64 },
    ResourceExhausted(&'static str),
    Io(io::Error),
    OutOfBounds { sector: u64 },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use self::Error::*;

        match self {
            InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            TooLarge { chunks, max_chunks } => write!(
                f,
                "target too large: {chunks} chunks exceeds the {max_chunks}-chunk limit"
            ),
            ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
            Io(e) => write!(f, "I/O error: {e}"),
            OutOfBounds { sector } => write!(f, "sector {sector} is out of bounds"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl Error {
    /// `io::Error` is not `Clone`, but a single job failure must be
    /// reported to its own submitter *and* to every request riding along
    /// on the same in-flight chunk (see `job::Job::fail_everyone`).
    /// Reconstructs an equivalent `Error` rather than deriving `Clone`
    /// crate-wide, so ordinary call sites still get a real `io::Error`
    /// with its original `raw_os_error`.
    pub(crate) fn duplicate(&self) -> Error {
        match self {
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::TooLarge { chunks, max_chunks } => Error::TooLarge {
                chunks: *chunks,
                max_chunks: *max_chunks,
            },
            Error::ResourceExhausted(s) => Error::ResourceExhausted(s),
            Error::Io(e) => Error::Io(io::Error::new(e.kind(), e.to_string())),
            Error::OutOfBounds { sector } => Error::OutOfBounds { sector: *sector },
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
