//! Synthetic path resolution.
//!
//! Maps a path inside the mount point to the object behind it. Resolution is
//! a pure function of the immutable session state; `None` means "not found"
//! for the whole path.

use crate::session::MountSession;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The closed set of objects a synthetic path can name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// The mount point root; enumerable, not openable.
    Root,

    /// The symlink named after the base image.
    BaseImageLink,

    /// The composed disk as one byte-addressable file (`/vhdd`).
    Disk,

    /// The raw byte range of volume N (`/vol<N>`).
    Volume(usize),

    /// The root directory of volume N's mounted guest filesystem (`/fs<N>`).
    FsRoot(usize),

    /// A path inside volume N's mounted guest filesystem, with the in-guest
    /// remainder reassembled from the leftover components.
    FsEntry(usize, String),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves `path` against the session.
pub fn resolve(session: &MountSession, path: &str) -> Option<Resolved> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Some(Resolved::Root);
    }

    let (first, rest) = match trimmed.split_once('/') {
        Some((first, rest)) => (first, Some(rest)),
        None => (trimmed, None),
    };

    if let Some(rest) = rest {
        // Only a mounted guest filesystem has anything below the top level.
        let n = parse_indexed(first, "fs")?;
        if session.guest_fs(n).is_none() {
            return None;
        }
        return Some(Resolved::FsEntry(n, rest.to_string()));
    }

    if first == session.base_name() {
        return Some(Resolved::BaseImageLink);
    }
    if first == "vhdd" {
        return Some(Resolved::Disk);
    }
    if let Some(n) = parse_indexed(first, "vol") {
        if n < session.volume_count() {
            return Some(Resolved::Volume(n));
        }
        return None;
    }
    if let Some(n) = parse_indexed(first, "fs") {
        if session.guest_fs(n).is_some() {
            return Some(Resolved::FsRoot(n));
        }
        return None;
    }

    None
}

/// Parses `<prefix><N>` with a strictly numeric, canonically spelled N.
/// `vol01` is not an alias for `vol1`: only the spelling readdir lists
/// resolves.
fn parse_indexed(name: &str, prefix: &str) -> Option<usize> {
    let digits = name.strip_prefix(prefix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: usize = digits.parse().ok()?;
    if digits != n.to_string() {
        return None;
    }
    Some(n)
}
