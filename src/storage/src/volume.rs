//! Volume catalog.
//!
//! Turns the partition walk into a table of volumes, each with an eager
//! byte-range view into the composed disk and, when requested, an attempted
//! guest-filesystem mount. The table is built once at mount time and is
//! immutable for the session.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use log::{info, warn};

use crate::disk::ComposedDisk;
use crate::dvm;
use crate::guestfs::GuestFs;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Options for building the catalog.
#[derive(Clone, Debug, Default)]
pub struct CatalogOptions {
    /// Attempt a per-volume guest-filesystem mount.
    pub guest_fs: bool,
}

/// Errors from building the volume catalog.
#[derive(Debug)]
pub enum CatalogError {
    /// Reading or parsing the partition table failed.
    Io(io::Error),
}

/// A cloneable byte-range view over the composed disk.
#[derive(Clone)]
pub struct VolumeView {
    disk: Arc<ComposedDisk>,
    start: u64,
    len: u64,
}

/// A seekable cursor over a `VolumeView`, for byte-stream consumers.
pub struct VolumeCursor {
    view: VolumeView,
    pos: u64,
}

/// One enumerated volume.
pub struct Volume {
    index: usize,
    start_sector: u64,
    sector_count: u64,
    boot: bool,
    type_label: String,
    view: VolumeView,
    guest: Option<Arc<GuestFs>>,
}

/// The immutable per-session volume table.
pub struct VolumeCatalog {
    volumes: Vec<Volume>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VolumeView {
    pub fn new(disk: Arc<ComposedDisk>, start: u64, len: u64) -> Self {
        VolumeView { disk, start, len }
    }

    /// Size of the view in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Byte offset of the view inside the composed disk.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Reads at a view-relative offset, clamped to the view.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let len = buf.len().min((self.len - offset) as usize);
        self.disk.read_at(&mut buf[..len], self.start + offset)
    }

    /// Writes at a view-relative offset, clamped to the view.
    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let len = data.len().min((self.len - offset) as usize);
        self.disk.write_at(&data[..len], self.start + offset)
    }

    /// A fresh cursor positioned at the start of the view.
    pub fn cursor(&self) -> VolumeCursor {
        VolumeCursor {
            view: self.clone(),
            pos: 0,
        }
    }
}

impl Volume {
    /// Stable 0-based index for the session.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn start_sector(&self) -> u64 {
        self.start_sector
    }

    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    /// Byte offset of the volume on the composed disk.
    pub fn byte_offset(&self) -> u64 {
        self.view.start()
    }

    /// Size of the volume in bytes.
    pub fn size(&self) -> u64 {
        self.view.len()
    }

    pub fn boot(&self) -> bool {
        self.boot
    }

    pub fn type_label(&self) -> &str {
        &self.type_label
    }

    pub fn view(&self) -> &VolumeView {
        &self.view
    }

    /// The mounted guest filesystem, when the mount succeeded.
    pub fn guest_fs(&self) -> Option<&Arc<GuestFs>> {
        self.guest.as_ref()
    }
}

impl VolumeCatalog {
    /// Enumerates all volumes on `disk`.
    ///
    /// Zero volumes is a valid result (unpartitioned disk). A per-volume
    /// guest-mount failure degrades that volume to raw-only with a warning;
    /// it never fails the catalog.
    pub fn open(disk: &Arc<ComposedDisk>, opts: &CatalogOptions) -> Result<Self, CatalogError> {
        let partitions = dvm::enumerate_partitions(disk.as_ref()).map_err(CatalogError::Io)?;
        let sector_size = disk.sector_size() as u64;

        let mut volumes = Vec::with_capacity(partitions.len());
        for (index, part) in partitions.into_iter().enumerate() {
            let view = VolumeView::new(
                Arc::clone(disk),
                part.start_sector * sector_size,
                part.sector_count * sector_size,
            );

            let guest = if opts.guest_fs {
                match GuestFs::mount(view.clone()) {
                    Ok(fs) => {
                        info!("vol{}: mounted guest filesystem ({})", index, fs.label());
                        Some(Arc::new(fs))
                    }
                    Err(e) => {
                        warn!("vol{}: no recognized guest filesystem: {}", index, e);
                        None
                    }
                }
            } else {
                None
            };

            volumes.push(Volume {
                index,
                start_sector: part.start_sector,
                sector_count: part.sector_count,
                boot: part.boot,
                type_label: part.type_label,
                view,
                guest,
            });
        }

        info!("enumerated {} volume(s)", volumes.len());
        Ok(VolumeCatalog { volumes })
    }

    /// An empty catalog, for sessions without partition exposure.
    pub fn empty() -> Self {
        VolumeCatalog { volumes: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Volume> {
        self.volumes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Read for VolumeCursor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.view.read_at(buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for VolumeCursor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.view.write_at(buf, self.pos)?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past the end of the volume",
            ));
        }
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.view.disk.flush()
    }
}

impl Seek for VolumeCursor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(d) => self.view.len.checked_add_signed(d),
            SeekFrom::Current(d) => self.pos.checked_add_signed(d),
        };
        match new {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )),
        }
    }
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "partition table I/O error: {}", e),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<io::Error> for CatalogError {
    fn from(e: io::Error) -> Self {
        CatalogError::Io(e)
    }
}
