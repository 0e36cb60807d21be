//! Storage layer for imgmount.
//!
//! This crate turns a chain of differencing disk images into one composed
//! logical block device, enumerates the volumes (partitions) found on it and
//! optionally mounts a recognized guest filesystem per volume. It also hosts
//! the in-memory secret key store used for encrypted images.

pub mod chain;
pub mod disk;
pub mod dvm;
pub mod format;
pub mod guestfs;
pub mod keystore;
pub mod volume;

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;

use std::fmt;
use std::io;

pub use chain::{open_chain, ChainConfig, ChainError, CryptoConfig, ImageLayer, OpenedChain};
pub use disk::ComposedDisk;
pub use dvm::{PartitionInfo, SectorSource};
pub use format::{ImageFormat, ImageProbe};
pub use guestfs::{GuestFs, GuestKind, GuestStat};
pub use keystore::{KeyStoreError, SecretKeyStore};
pub use volume::{CatalogError, CatalogOptions, Volume, VolumeCatalog, VolumeView};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for the storage layer.
#[derive(Debug)]
pub enum Error {
    /// Image chain opening error.
    Chain(ChainError),

    /// Volume catalog error.
    Catalog(CatalogError),

    /// Secret key store error.
    KeyStore(KeyStoreError),

    /// I/O error.
    Io(io::Error),
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Chain(e) => write!(f, "image chain error: {}", e),
            Error::Catalog(e) => write!(f, "volume catalog error: {}", e),
            Error::KeyStore(e) => write!(f, "key store error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<ChainError> for Error {
    fn from(e: ChainError) -> Self {
        Error::Chain(e)
    }
}

impl From<CatalogError> for Error {
    fn from(e: CatalogError) -> Self {
        Error::Catalog(e)
    }
}

impl From<KeyStoreError> for Error {
    fn from(e: KeyStoreError) -> Self {
        Error::KeyStore(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
