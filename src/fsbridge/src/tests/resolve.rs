use std::io;

use crate::resolve::{resolve, Resolved};

use super::helper::{patterned_image, session_over, two_partition_image};

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn root_and_fixed_entries() -> io::Result<()> {
    let (_dir, session) = session_over(&patterned_image(2048), "base.img", false, false)?;

    assert_eq!(resolve(&session, "/"), Some(Resolved::Root));
    assert_eq!(resolve(&session, ""), Some(Resolved::Root));
    assert_eq!(resolve(&session, "/vhdd"), Some(Resolved::Disk));
    assert_eq!(resolve(&session, "/base.img"), Some(Resolved::BaseImageLink));
    // The file stem alone is not an alias for the entry.
    assert_eq!(resolve(&session, "/base"), None);
    assert_eq!(resolve(&session, "/other.img"), None);
    Ok(())
}

#[test]
fn volume_indices_are_bounds_checked() -> io::Result<()> {
    let image = two_partition_image(&[])?;
    let (_dir, session) = session_over(&image, "parts.img", false, false)?;

    assert_eq!(resolve(&session, "/vol0"), Some(Resolved::Volume(0)));
    assert_eq!(resolve(&session, "/vol1"), Some(Resolved::Volume(1)));
    // One past the last volume is not found.
    assert_eq!(resolve(&session, "/vol2"), None);
    assert_eq!(resolve(&session, "/vol99"), None);
    Ok(())
}

#[test]
fn malformed_names_are_not_found() -> io::Result<()> {
    let image = two_partition_image(&[])?;
    let (_dir, session) = session_over(&image, "parts.img", false, false)?;

    // Leading zeros are not an alias for the listed spelling.
    for path in [
        "/vol", "/vol0x", "/volx0", "/vol-1", "/vol 0", "/vol01", "/vol00", "/fs", "/fsx",
        "/fs00", "/junk",
    ] {
        assert_eq!(resolve(&session, path), None, "path {:?}", path);
    }
    Ok(())
}

#[test]
fn fs_entries_require_a_mounted_guest() -> io::Result<()> {
    let image = two_partition_image(&[("a.txt", b"a")])?;
    let (_dir, session) = session_over(&image, "parts.img", false, true)?;

    // Volume 0 carries FAT, volume 1 does not.
    assert_eq!(resolve(&session, "/fs0"), Some(Resolved::FsRoot(0)));
    assert_eq!(resolve(&session, "/fs1"), None);
    assert_eq!(resolve(&session, "/vol1"), Some(Resolved::Volume(1)));

    assert_eq!(
        resolve(&session, "/fs0/dir/file.txt"),
        Some(Resolved::FsEntry(0, "dir/file.txt".to_string()))
    );
    assert_eq!(resolve(&session, "/fs1/file.txt"), None);
    Ok(())
}

#[test]
fn without_guest_exposure_fs_names_do_not_exist() -> io::Result<()> {
    let image = two_partition_image(&[("a.txt", b"a")])?;
    let (_dir, session) = session_over(&image, "parts.img", false, false)?;

    assert_eq!(resolve(&session, "/fs0"), None);
    assert_eq!(resolve(&session, "/fs0/a.txt"), None);
    Ok(())
}

#[test]
fn nothing_nests_under_file_entries() -> io::Result<()> {
    let (_dir, session) = session_over(&patterned_image(2048), "base.img", false, false)?;

    assert_eq!(resolve(&session, "/vhdd/x"), None);
    assert_eq!(resolve(&session, "/vol0/x"), None);
    assert_eq!(resolve(&session, "/base.img/x"), None);
    Ok(())
}
