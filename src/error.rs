use std::fmt::Display;

/// All errors produced by this crate.
///
/// This is a flat enum rather than a tree of per-component error types: every
/// caller across the log, journal, compactor, and runtime ends up handling
/// the same handful of conditions, and a single enum lets them match on the
/// ones they care about without a pile of `From` conversions at each layer.
#[derive(Debug)]
pub enum Error {
    /// A read addressed an index outside `[firstIndex, lastIndex]`.
    OutOfBounds(u64),
    /// A truncate targeted an index at or below `commitIndex`.
    CannotTruncateCommitted(u64),
    /// Appending the next entry would exceed a segment's size cap. Internal
    /// to the journal, which catches this and rolls to a new segment.
    SegmentFull,
    /// A segment's on-disk entry failed CRC validation at or below
    /// `commitIndex`.
    Corrupted(String),
    /// `Segment::load` found a gap, overlap, or malformed header among the
    /// segment files in a directory. Distinct from `Corrupted`: this is a
    /// structural defect in the segment list itself, not a single bad
    /// record.
    CorruptedLog(String),
    /// An apply handler returned an error for a specific committed index.
    /// The runtime records this and continues; it is not fatal.
    Apply(u64, String),
    /// The underlying storage failed in a way that can't be recovered
    /// locally (filesystem I/O, fsync, rename).
    Io(std::io::Error),
    /// A payload failed to (de)serialize.
    Serialization(String),
    /// A caller violated an API invariant (e.g. appending in term 0,
    /// committing to a non-existent index). These indicate a programming
    /// error upstream of this crate and are never expected at runtime.
    Internal(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::OutOfBounds(index) => write!(f, "index {index} is out of bounds"),
            Error::CannotTruncateCommitted(index) => {
                write!(f, "cannot truncate committed index {index}")
            }
            Error::SegmentFull => write!(f, "segment is full"),
            Error::Corrupted(msg) => write!(f, "corrupted entry: {msg}"),
            Error::CorruptedLog(msg) => write!(f, "corrupted log: {msg}"),
            Error::Apply(index, msg) => write!(f, "apply failed at index {index}: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Serialization(msg) => write!(f, "serialization error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
