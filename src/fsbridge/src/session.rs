//! The per-mount session context.
//!
//! All process-wide state of a mount lives here: the locked image layers,
//! the composed disk, the volume table and the base-image identity. It is
//! built once at startup and never mutated afterwards, which is what makes
//! the resolver safe to call from concurrent FUSE workers without a lock of
//! its own. Teardown is the drop order of the fields: catalog first (volume
//! views and guest mounts), then the disk, then the layer locks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use storage::{
    CatalogOptions, ComposedDisk, GuestFs, ImageLayer, OpenedChain, Volume, VolumeCatalog,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Immutable per-session mount context.
pub struct MountSession {
    catalog: VolumeCatalog,
    disk: Arc<ComposedDisk>,
    layers: Vec<ImageLayer>,
    base_name: String,
    base_path: PathBuf,
    writable: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MountSession {
    /// Assembles the session from an opened chain: wraps the composed disk
    /// for shared access and enumerates the volume catalog over it.
    pub fn open(chain: OpenedChain, opts: &CatalogOptions) -> storage::Result<Self> {
        let OpenedChain {
            layers,
            disk,
            base_name,
            base_path,
        } = chain;

        let writable = disk.writable();
        let disk = Arc::new(disk);
        let catalog = VolumeCatalog::open(&disk, opts)?;

        Ok(MountSession {
            catalog,
            disk,
            layers,
            base_name,
            base_path,
            writable,
        })
    }

    /// The composed block device.
    pub fn disk(&self) -> &Arc<ComposedDisk> {
        &self.disk
    }

    /// Display name of the base image; the name of the root symlink entry.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    /// Absolute path of the base image; the target of the root symlink.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Whether the session was opened in write mode.
    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn volume_count(&self) -> usize {
        self.catalog.len()
    }

    pub fn volume(&self, index: usize) -> Option<&Volume> {
        self.catalog.get(index)
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.catalog.iter()
    }

    /// The guest filesystem of volume `index`, when one was mounted.
    pub fn guest_fs(&self, index: usize) -> Option<&Arc<GuestFs>> {
        self.catalog.get(index).and_then(|v| v.guest_fs())
    }

    /// Locked image layers, leaf to base.
    pub fn layers(&self) -> &[ImageLayer] {
        &self.layers
    }
}
