use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    ReadError(&'static str, io::Error),
    WriteError(&'static str, io::Error),
    /// A short read or write: fewer bytes moved than requested.
    ShortIo { expected: usize, actual: usize },
    /// The part's handle was closed and reopened while an operation was in flight.
    StaleHandle { part: u32, captured: u64, current: u64 },
    /// The file is being unlinked or renamed; queued reads abort with this.
    PendingUnlink(PathBuf),
    /// A queued job was cancelled before it started.
    Cancelled,
    OutOfMemory(usize),
    BufferTooSmall { needed: usize, available: usize },
    RecordTooLarge { size: usize, limit: usize },
    /// Damaged data: out-of-order keys, impossible lengths, cache mismatches.
    Corrupt(String),
    IndexCorruption(String),
    InvalidConfig(String),
    InvalidOperation(String),
    InvalidState(String),
    LockError(io::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::IoError(_)
                | Error::ReadError(..)
                | Error::WriteError(..)
                | Error::ShortIo { .. }
                | Error::StaleHandle { .. }
        )
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupt(_) | Error::IndexCorruption(_))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::ShortIo { expected, actual } => {
                write!(f, "Short I/O: expected {} bytes, got {}", expected, actual)
            }
            Error::StaleHandle {
                part,
                captured,
                current,
            } => write!(
                f,
                "File closed under us: part {} generation {} is now {}",
                part, captured, current
            ),
            Error::PendingUnlink(path) => {
                write!(f, "File is being unlinked: {}", path.display())
            }
            Error::Cancelled => write!(f, "Job cancelled before it started"),
            Error::OutOfMemory(size) => write!(f, "Out of memory allocating {} bytes", size),
            Error::BufferTooSmall { needed, available } => write!(
                f,
                "Buffer too small: needed {} bytes, have {}",
                needed, available
            ),
            Error::RecordTooLarge { size, limit } => {
                write!(f, "Record of {} bytes exceeds limit of {}", size, limit)
            }
            Error::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
        }
    }
}

impl std::error::Error for Error {}
