//! FUSE protocol bridge.
//!
//! Implements `fuser::Filesystem` by keeping an inode-to-path table and
//! delegating every callback to the dispatcher. This file owns exactly two
//! jobs: inode bookkeeping and translating `FsError` / `Attr` into what the
//! FUSE reply objects want.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry,
    ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use log::debug;

use crate::dispatch::{Attr, Dispatcher, EntryKind};
use crate::error::FsError;
use crate::session::MountSession;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The synthetic filesystem as seen by the FUSE session loop.
pub struct ImgFs {
    dispatcher: Dispatcher,
    inodes: BTreeMap<u64, String>,
    paths: HashMap<String, u64>,
    next_ino: u64,
    uid: u32,
    gid: u32,
    mount_time: SystemTime,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImgFs {
    pub fn new(session: Arc<MountSession>, uid: u32, gid: u32) -> Self {
        let mut inodes = BTreeMap::new();
        let mut paths = HashMap::new();
        inodes.insert(ROOT_INO, String::new());
        paths.insert(String::new(), ROOT_INO);

        ImgFs {
            dispatcher: Dispatcher::new(session),
            inodes,
            paths,
            next_ino: ROOT_INO + 1,
            uid,
            gid,
            mount_time: SystemTime::now(),
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.inodes.get(&ino).cloned()
    }

    fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.paths.get(path) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, path.to_string());
        self.paths.insert(path.to_string(), ino);
        ino
    }

    fn file_attr(&self, ino: u64, attr: &Attr) -> FileAttr {
        let kind = match attr.kind {
            EntryKind::Directory => FileType::Directory,
            EntryKind::RegularFile => FileType::RegularFile,
            EntryKind::Symlink => FileType::Symlink,
        };
        let mtime = attr.mtime.unwrap_or(self.mount_time);
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.size.div_ceil(512),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm: attr.perm,
            nlink: attr.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Filesystem for ImgFs {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_path) = self.path_of(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        let path = join(&parent_path, name);
        match self.dispatcher.getattr(&path) {
            Ok(attr) => {
                let ino = self.ino_for(&path);
                let fa = self.file_attr(ino, &attr);
                reply.entry(&TTL, &fa, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.dispatcher.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, &attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.dispatcher.readlink(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.dispatcher.open(&path, flags) {
            Ok(handle) => reply.opened(handle, 0),
            Err(e) => {
                debug!("open {:?} flags {:#x} rejected: {}", path, flags, e);
                reply.error(e.to_errno());
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.dispatcher.read(fh, offset as u64, size as usize) {
            Ok(buf) => reply.data(&buf),
            // End of file is not an error on the wire; it is an empty read.
            Err(FsError::EndOfFile) => reply.data(&[]),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.dispatcher.write(fh, offset as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.dispatcher.release(fh);
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.dispatcher.getattr(&path) {
            Ok(attr) if attr.kind == EntryKind::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.dispatcher.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        for (i, (name, kind)) in entries.iter().enumerate().skip(offset as usize) {
            let child_ino = match name.as_str() {
                "." => ino,
                ".." => self.paths.get(parent_of(&path)).copied().unwrap_or(ROOT_INO),
                name => self.ino_for(&join(&path, name)),
            };
            let ft = match kind {
                EntryKind::Directory => FileType::Directory,
                EntryKind::RegularFile => FileType::RegularFile,
                EntryKind::Symlink => FileType::Symlink,
            };
            if reply.add(child_ino, (i + 1) as i64, ft, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let session = self.dispatcher.session();
        let bsize = session.disk().sector_size();
        let blocks = session.disk().size() / bsize as u64;
        let files = 2 + 2 * session.volume_count() as u64;
        reply.statfs(blocks, 0, 0, files, 0, bsize, 255, bsize);
    }
}
