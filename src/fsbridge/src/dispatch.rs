//! Filesystem operation dispatch.
//!
//! One method per POSIX filesystem verb, written against resolved objects
//! and opaque handles rather than FUSE types, so the whole contract is
//! testable without a kernel. The FUSE bridge is a thin translation layer on
//! top of this.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use log::debug;

use storage::GuestKind;

use crate::error::{FsError, FsResult};
use crate::resolve::{resolve, Resolved};
use crate::session::MountSession;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Open flags no synthetic object can honor.
#[cfg(target_os = "linux")]
const REJECTED_OPEN_FLAGS: i32 = libc::O_CREAT
    | libc::O_EXCL
    | libc::O_TRUNC
    | libc::O_APPEND
    | libc::O_NONBLOCK
    | libc::O_NOFOLLOW
    | libc::O_TMPFILE;

#[cfg(not(target_os = "linux"))]
const REJECTED_OPEN_FLAGS: i32 = libc::O_CREAT
    | libc::O_EXCL
    | libc::O_TRUNC
    | libc::O_APPEND
    | libc::O_NONBLOCK
    | libc::O_NOFOLLOW;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Kind of a synthetic directory entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    RegularFile,
    Symlink,
}

/// Metadata of one synthetic object, in host-neutral form.
#[derive(Clone, Debug)]
pub struct Attr {
    pub kind: EntryKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub mtime: Option<SystemTime>,
}

/// An object held open by a handle. The closed set of openable things.
#[derive(Clone, Debug)]
enum OpenObject {
    Disk,
    Volume(usize),
    GuestFile { volume: usize, path: String },
}

/// Path/handle-based operation table over one mount session.
pub struct Dispatcher {
    session: Arc<MountSession>,
    handles: RwLock<BTreeMap<u64, OpenObject>>,
    next_handle: AtomicU64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Dispatcher {
    pub fn new(session: Arc<MountSession>) -> Self {
        Dispatcher {
            session,
            handles: RwLock::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn session(&self) -> &MountSession {
        &self.session
    }

    /// `getattr`: metadata for the object at `path`.
    pub fn getattr(&self, path: &str) -> FsResult<Attr> {
        let file_perm = if self.session.writable() { 0o644 } else { 0o444 };

        match resolve(&self.session, path).ok_or(FsError::NotFound)? {
            Resolved::Root => Ok(Attr {
                kind: EntryKind::Directory,
                size: 0,
                perm: 0o755,
                nlink: 2,
                mtime: None,
            }),
            Resolved::BaseImageLink => Ok(Attr {
                kind: EntryKind::Symlink,
                size: 0,
                perm: 0o777,
                nlink: 1,
                mtime: None,
            }),
            Resolved::Disk => Ok(Attr {
                kind: EntryKind::RegularFile,
                size: self.session.disk().size(),
                perm: file_perm,
                nlink: 1,
                mtime: None,
            }),
            Resolved::Volume(n) => {
                let volume = self.session.volume(n).ok_or(FsError::NotFound)?;
                Ok(Attr {
                    kind: EntryKind::RegularFile,
                    size: volume.size(),
                    perm: file_perm,
                    nlink: 1,
                    mtime: None,
                })
            }
            Resolved::FsRoot(_) => Ok(Attr {
                kind: EntryKind::Directory,
                size: 0,
                perm: 0o755,
                nlink: 2,
                mtime: None,
            }),
            Resolved::FsEntry(n, rest) => {
                let guest = self.session.guest_fs(n).ok_or(FsError::NotFound)?;
                let stat = guest.stat(&rest)?;
                Ok(guest_attr(&stat, self.session.writable()))
            }
        }
    }

    /// `open`: resolves `path` and returns a handle bound to the object.
    ///
    /// Flags the object cannot honor are rejected distinctly; directories
    /// cannot be opened here at all, and no object supports simultaneous
    /// read+write.
    pub fn open(&self, path: &str, flags: i32) -> FsResult<u64> {
        if flags & REJECTED_OPEN_FLAGS != 0 {
            return Err(FsError::UnsupportedFlags(flags));
        }
        let accmode = flags & libc::O_ACCMODE;
        if accmode == libc::O_RDWR {
            return Err(FsError::UnsupportedFlags(flags));
        }

        let object = match resolve(&self.session, path).ok_or(FsError::NotFound)? {
            Resolved::Root | Resolved::FsRoot(_) => return Err(FsError::IsDirectory),
            Resolved::BaseImageLink => return Err(FsError::InvalidArgument),
            Resolved::Disk => OpenObject::Disk,
            Resolved::Volume(n) => OpenObject::Volume(n),
            Resolved::FsEntry(n, rest) => {
                let guest = self.session.guest_fs(n).ok_or(FsError::NotFound)?;
                if guest.stat(&rest)?.kind == GuestKind::Directory {
                    return Err(FsError::IsDirectory);
                }
                OpenObject::GuestFile {
                    volume: n,
                    path: rest,
                }
            }
        };

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.write().unwrap().insert(handle, object);
        debug!("open {:?} -> handle {}", path, handle);
        Ok(handle)
    }

    /// `read`: up to `size` bytes at `offset` from the object behind
    /// `handle`. Short reads near the end are success; a read positioned
    /// exactly at (or past) the end is `EndOfFile`.
    pub fn read(&self, handle: u64, offset: u64, size: usize) -> FsResult<Vec<u8>> {
        let object = self.object(handle)?;
        match object {
            OpenObject::Disk => {
                let disk = self.session.disk();
                if offset >= disk.size() {
                    return Err(FsError::EndOfFile);
                }
                let len = size.min((disk.size() - offset) as usize);
                let mut buf = vec![0u8; len];
                let n = disk.read_at(&mut buf, offset).map_err(FsError::Io)?;
                buf.truncate(n);
                Ok(buf)
            }
            OpenObject::Volume(n) => {
                let view = self
                    .session
                    .volume(n)
                    .ok_or(FsError::BadHandle(handle))?
                    .view();
                if offset >= view.len() {
                    return Err(FsError::EndOfFile);
                }
                let len = size.min((view.len() - offset) as usize);
                let mut buf = vec![0u8; len];
                let n = view.read_at(&mut buf, offset).map_err(FsError::Io)?;
                buf.truncate(n);
                Ok(buf)
            }
            OpenObject::GuestFile { volume, path } => {
                let guest = self.session.guest_fs(volume).ok_or(FsError::BadHandle(handle))?;
                let buf = guest.read_at(&path, offset, size)?;
                if buf.is_empty() && size > 0 {
                    return Err(FsError::EndOfFile);
                }
                Ok(buf)
            }
        }
    }

    /// `write`: writes `data` at `offset` through the object behind
    /// `handle`.
    ///
    /// On a read-only session this reports full success while writing
    /// nothing. That pass-through no-op is the documented contract: callers
    /// cannot detect that their write was discarded, and a subsequent read
    /// returns the original bytes.
    pub fn write(&self, handle: u64, offset: u64, data: &[u8]) -> FsResult<usize> {
        let object = self.object(handle)?;
        if !self.session.writable() {
            return Ok(data.len());
        }

        match object {
            OpenObject::Disk => self
                .session
                .disk()
                .write_at(data, offset)
                .map_err(FsError::Io),
            OpenObject::Volume(n) => self
                .session
                .volume(n)
                .ok_or(FsError::BadHandle(handle))?
                .view()
                .write_at(data, offset)
                .map_err(FsError::Io),
            OpenObject::GuestFile { volume, path } => {
                let guest = self.session.guest_fs(volume).ok_or(FsError::BadHandle(handle))?;
                Ok(guest.write_at(&path, offset, data)?)
            }
        }
    }

    /// `release`: drops the object reference behind `handle`. Always
    /// succeeds, even for handles this dispatcher never issued.
    pub fn release(&self, handle: u64) {
        self.handles.write().unwrap().remove(&handle);
    }

    /// `readdir`: entry names (plus kinds) of the directory at `path`,
    /// including `.` and `..`.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<(String, EntryKind)>> {
        match resolve(&self.session, path).ok_or(FsError::NotFound)? {
            Resolved::Root => {
                let mut entries = vec![
                    (".".to_string(), EntryKind::Directory),
                    ("..".to_string(), EntryKind::Directory),
                    (self.session.base_name().to_string(), EntryKind::Symlink),
                    ("vhdd".to_string(), EntryKind::RegularFile),
                ];
                for volume in self.session.volumes() {
                    entries.push((format!("vol{}", volume.index()), EntryKind::RegularFile));
                    if volume.guest_fs().is_some() {
                        entries.push((format!("fs{}", volume.index()), EntryKind::Directory));
                    }
                }
                Ok(entries)
            }
            Resolved::FsRoot(n) => self.guest_dir(n, ""),
            Resolved::FsEntry(n, rest) => {
                let guest = self.session.guest_fs(n).ok_or(FsError::NotFound)?;
                if guest.stat(&rest)?.kind != GuestKind::Directory {
                    return Err(FsError::NotDirectory);
                }
                self.guest_dir(n, &rest)
            }
            Resolved::BaseImageLink | Resolved::Disk | Resolved::Volume(_) => {
                Err(FsError::NotDirectory)
            }
        }
    }

    /// `readlink`: defined only for the base-image symlink entry.
    pub fn readlink(&self, path: &str) -> FsResult<PathBuf> {
        match resolve(&self.session, path).ok_or(FsError::NotFound)? {
            Resolved::BaseImageLink => Ok(self.session.base_path().to_path_buf()),
            _ => Err(FsError::InvalidArgument),
        }
    }

    fn object(&self, handle: u64) -> FsResult<OpenObject> {
        self.handles
            .read()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(FsError::BadHandle(handle))
    }

    fn guest_dir(&self, volume: usize, path: &str) -> FsResult<Vec<(String, EntryKind)>> {
        let guest = self.session.guest_fs(volume).ok_or(FsError::NotFound)?;
        let mut entries = vec![
            (".".to_string(), EntryKind::Directory),
            ("..".to_string(), EntryKind::Directory),
        ];
        for (name, kind) in guest.read_dir(path)? {
            let kind = match kind {
                GuestKind::Directory => EntryKind::Directory,
                GuestKind::File => EntryKind::RegularFile,
            };
            entries.push((name, kind));
        }
        Ok(entries)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Translates guest metadata one-to-one; FAT has no Unix permission bits, so
/// they are derived from its read-only attribute and the session mode.
fn guest_attr(stat: &storage::GuestStat, session_writable: bool) -> Attr {
    let writable = session_writable && !stat.read_only;
    match stat.kind {
        GuestKind::Directory => Attr {
            kind: EntryKind::Directory,
            size: 0,
            perm: if writable { 0o755 } else { 0o555 },
            nlink: 2,
            mtime: stat.modified,
        },
        GuestKind::File => Attr {
            kind: EntryKind::RegularFile,
            size: stat.size,
            perm: if writable { 0o644 } else { 0o444 },
            nlink: 1,
            mtime: stat.modified,
        },
    }
}
