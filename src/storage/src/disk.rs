//! The composed logical block device.
//!
//! A `ComposedDisk` stacks a differencing-image chain behind one read/write
//! interface, using `imago` for the actual format access. The backend is not
//! reentrant, so every read and write goes through one process-wide critical
//! section (`io_lock`), held only for the duration of a single I/O call.

use std::io;
use std::path::Path;
use std::sync::Mutex;

use imago::file::File;
use imago::qcow2::Qcow2;
use imago::raw::Raw;
use imago::SyncFormatAccess;

use crate::dvm::SectorSource;
use crate::format::ImageFormat;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Default sector size of the composed device.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One logical block device over an opened image chain.
pub struct ComposedDisk {
    access: SyncFormatAccess<File>,

    /// Serializes all backend I/O.
    io_lock: Mutex<()>,

    sector_size: u32,
    size: u64,
    writable: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ComposedDisk {
    /// Opens the leaf image at `path` and composes it with its implicit
    /// backing dependencies into one block device.
    pub fn open(path: &Path, format: ImageFormat, writable: bool) -> io::Result<Self> {
        let access = match format {
            ImageFormat::Raw => {
                let raw = Raw::<File>::open_path_sync(path, writable)?;
                SyncFormatAccess::new(raw)?
            }
            ImageFormat::Qcow2 => {
                let mut qcow2 = Qcow2::<File>::open_path_sync(path, writable)?;
                qcow2.open_implicit_dependencies_sync()?;
                SyncFormatAccess::new(qcow2)?
            }
        };

        let size = access.size();
        Ok(ComposedDisk {
            access,
            io_lock: Mutex::new(()),
            sector_size: DEFAULT_SECTOR_SIZE,
            size,
            writable,
        })
    }

    /// Total size of the composed device in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Sector size in bytes (power of two).
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Whether the leaf layer was opened for writing.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Reads at `offset`, clamped to the device size. Returns the number of
    /// bytes read; zero when `offset` is at or past the end.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let len = buf.len().min((self.size - offset) as usize);

        let _io = self.io_lock.lock().unwrap();
        self.access.read(&mut buf[..len], offset)?;
        Ok(len)
    }

    /// Writes at `offset`, clamped to the device size. The caller is expected
    /// to have checked the session write mode; this enforces only the backend
    /// open mode.
    pub fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "composed disk is read-only",
            ));
        }
        if offset >= self.size {
            return Ok(0);
        }
        let len = data.len().min((self.size - offset) as usize);

        let _io = self.io_lock.lock().unwrap();
        self.access.write(&data[..len], offset)?;
        Ok(len)
    }

    /// Flushes pending writes down the chain.
    pub fn flush(&self) -> io::Result<()> {
        let _io = self.io_lock.lock().unwrap();
        self.access.flush()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl SectorSource for ComposedDisk {
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> io::Result<()> {
        let offset = lba
            .checked_mul(self.sector_size as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "sector offset overflow"))?;
        let n = self.read_at(buf, offset)?;
        if n != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read inside the device",
            ));
        }
        Ok(())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        self.size / self.sector_size as u64
    }
}
