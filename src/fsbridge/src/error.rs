//! Per-request error taxonomy.
//!
//! Every filesystem operation recovers locally into one of these variants;
//! the FUSE bridge translates them to errno values in one place. End-of-file
//! is part of the taxonomy so that a read at the exact end position stays
//! distinguishable from a hard I/O failure; the bridge answers it with an
//! empty buffer, not an error.

use std::fmt;
use std::io;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type for filesystem operations.
pub type FsResult<T> = std::result::Result<T, FsError>;

/// Errors surfaced by the operation dispatcher.
#[derive(Debug)]
pub enum FsError {
    /// The path resolves to nothing.
    NotFound,

    /// A directory operation hit a non-directory.
    NotDirectory,

    /// A file operation hit a directory.
    IsDirectory,

    /// The open flags cannot be honored by the object.
    UnsupportedFlags(i32),

    /// The operation is not defined for this object.
    InvalidArgument,

    /// No open object behind this handle.
    BadHandle(u64),

    /// Read positioned exactly at the end of the object.
    EndOfFile,

    /// Whatever the backing image, volume or guest filesystem reported.
    Io(io::Error),
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FsError {
    /// The errno the FUSE reply carries for this error.
    pub fn to_errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::UnsupportedFlags(_) => libc::EINVAL,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::BadHandle(_) => libc::EBADF,
            // Not reached through the bridge; reads at end answer with an
            // empty buffer instead.
            FsError::EndOfFile => 0,
            FsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "not found"),
            FsError::NotDirectory => write!(f, "not a directory"),
            FsError::IsDirectory => write!(f, "is a directory"),
            FsError::UnsupportedFlags(flags) => write!(f, "unsupported open flags {:#x}", flags),
            FsError::InvalidArgument => write!(f, "invalid argument"),
            FsError::BadHandle(h) => write!(f, "no open object for handle {}", h),
            FsError::EndOfFile => write!(f, "end of file"),
            FsError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for FsError {}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            _ => FsError::Io(e),
        }
    }
}
