//! Synthetic filesystem bridge for imgmount.
//!
//! Exposes a composed disk and its volumes as a small synthetic directory
//! tree (`/vhdd`, `/vol<N>`, `/fs<N>`, plus a symlink named after the base
//! image) through the FUSE operation table. Path resolution and operation
//! dispatch are independent of the FUSE layer and are what the tests drive.

pub mod bridge;
pub mod dispatch;
pub mod error;
pub mod resolve;
pub mod session;

#[cfg(test)]
#[path = "tests/mod.rs"]
mod tests;

pub use bridge::ImgFs;
pub use dispatch::{Attr, Dispatcher, EntryKind};
pub use error::FsError;
pub use resolve::{resolve, Resolved};
pub use session::MountSession;
