//! Guest filesystem mounting.
//!
//! Mounts a recognized FAT filesystem on a volume view and exposes stat,
//! directory iteration and offset-based file I/O by path. The `fatfs` handle
//! is not reentrant, so all access goes through a per-mount mutex.
//!
//! Lookups are by path on every call rather than by retained file object;
//! that keeps the mount free of self-referential borrows and matches the
//! open-by-path contract of the path resolver.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fatfs::{DateTime, FileAttributes, FileSystem, FsOptions};

use crate::volume::{VolumeCursor, VolumeView};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Kind of a guest filesystem object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestKind {
    File,
    Directory,
}

/// Metadata of one guest filesystem object.
#[derive(Clone, Debug)]
pub struct GuestStat {
    pub kind: GuestKind,
    pub size: u64,
    pub read_only: bool,
    pub modified: Option<SystemTime>,
}

/// One mounted guest filesystem.
pub struct GuestFs {
    fs: Mutex<FileSystem<VolumeCursor>>,
    label: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GuestFs {
    /// Probes and mounts the filesystem on `view`. An unrecognized
    /// filesystem is an error; the caller degrades the volume to raw-only.
    pub fn mount(view: VolumeView) -> io::Result<Self> {
        let fs = FileSystem::new(view.cursor(), FsOptions::new())?;
        let label = fs.volume_label();
        Ok(GuestFs {
            fs: Mutex::new(fs),
            label,
        })
    }

    /// Volume label, for logging and listings.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Metadata for the object at `path` ("" or "/" is the root directory).
    pub fn stat(&self, path: &str) -> io::Result<GuestStat> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(GuestStat {
                kind: GuestKind::Directory,
                size: 0,
                read_only: false,
                modified: None,
            });
        }

        let fs = self.fs.lock().unwrap();
        let root = fs.root_dir();
        let (parent, name) = split_parent(&path);
        let dir = if parent.is_empty() {
            root
        } else {
            root.open_dir(parent)?
        };

        for entry in dir.iter() {
            let entry = entry?;
            if entry.file_name().eq_ignore_ascii_case(name) {
                return Ok(GuestStat {
                    kind: if entry.is_dir() {
                        GuestKind::Directory
                    } else {
                        GuestKind::File
                    },
                    size: entry.len(),
                    read_only: entry.attributes().contains(FileAttributes::READ_ONLY),
                    modified: fat_datetime_to_system(entry.modified()),
                });
            }
        }

        Err(io::Error::new(io::ErrorKind::NotFound, path))
    }

    /// Lists the directory at `path`, forwarding entry names unmodified.
    /// Dot entries and the volume-label entry are not part of the result.
    pub fn read_dir(&self, path: &str) -> io::Result<Vec<(String, GuestKind)>> {
        let path = normalize(path);
        let fs = self.fs.lock().unwrap();
        let root = fs.root_dir();
        let dir = if path.is_empty() {
            root
        } else {
            root.open_dir(&path)?
        };

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            if entry.attributes().contains(FileAttributes::VOLUME_ID) {
                continue;
            }
            let kind = if entry.is_dir() {
                GuestKind::Directory
            } else {
                GuestKind::File
            };
            entries.push((name, kind));
        }
        Ok(entries)
    }

    /// Reads up to `size` bytes of the file at `path`, starting at `offset`.
    /// Short or empty results at end of file are not errors.
    pub fn read_at(&self, path: &str, offset: u64, size: usize) -> io::Result<Vec<u8>> {
        let stat = self.stat(path)?;
        if stat.kind == GuestKind::Directory {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"));
        }
        if offset >= stat.size {
            return Ok(Vec::new());
        }
        let len = size.min((stat.size - offset) as usize);

        let path = normalize(path);
        let fs = self.fs.lock().unwrap();
        let mut file = fs.root_dir().open_file(&path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; len];
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..])? {
                0 => break,
                n => total += n,
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Writes `data` to the file at `path`, starting at `offset`. Writing
    /// past the current end extends the file; starting beyond it does not
    /// (FAT has no sparse files).
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> io::Result<usize> {
        let stat = self.stat(path)?;
        if stat.kind == GuestKind::Directory {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"));
        }
        if offset > stat.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write would leave a hole in the file",
            ));
        }

        let path = normalize(path);
        let fs = self.fs.lock().unwrap();
        let mut file = fs.root_dir().open_file(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        file.flush()?;
        Ok(data.len())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// FAT timestamps are civil dates; convert through days-since-epoch.
fn fat_datetime_to_system(dt: DateTime) -> Option<SystemTime> {
    let days = days_from_civil(dt.date.year as i64, dt.date.month as i64, dt.date.day as i64);
    if days < 0 {
        return None;
    }
    let secs = days as u64 * 86_400
        + dt.time.hour as u64 * 3_600
        + dt.time.min as u64 * 60
        + dt.time.sec as u64;
    Some(UNIX_EPOCH + Duration::from_secs(secs))
}

/// Days between 1970-01-01 and the given civil date (proleptic Gregorian).
fn days_from_civil(mut y: i64, m: i64, d: i64) -> i64 {
    if m <= 2 {
        y -= 1;
    }
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let doy = (153 * (if m > 2 { m - 3 } else { m + 9 }) + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
