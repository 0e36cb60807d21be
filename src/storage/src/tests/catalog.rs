use std::io;
use std::sync::Arc;

use crate::disk::ComposedDisk;
use crate::format::ImageFormat;
use crate::guestfs::GuestKind;
use crate::volume::{CatalogOptions, VolumeCatalog};

use super::helper::{format_fat, write_image, write_mbr, PartSpec, SECTOR};

//--------------------------------------------------------------------------------------------------
// Helper
//--------------------------------------------------------------------------------------------------

/// A 4 MiB disk with a FAT partition and a blank one.
fn two_partition_image(files: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
    let mut image = vec![0u8; 8192 * SECTOR];
    write_mbr(
        &mut image,
        &[
            PartSpec {
                kind: 0x06,
                start: 64,
                count: 4096,
                boot: true,
            },
            PartSpec::new(0x83, 4160, 2048),
        ],
    );
    format_fat(&mut image, 64, 4096, files)?;
    Ok(image)
}

fn open_disk(path: &std::path::Path) -> io::Result<Arc<ComposedDisk>> {
    Ok(Arc::new(ComposedDisk::open(path, ImageFormat::Raw, false)?))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn unpartitioned_disk_gives_an_empty_catalog() -> io::Result<()> {
    let (_dir, path) = write_image("plain.img", &vec![0u8; 1 << 20])?;
    let disk = open_disk(&path)?;

    let catalog = VolumeCatalog::open(&disk, &CatalogOptions::default()).unwrap();
    assert!(catalog.is_empty());
    Ok(())
}

#[test]
fn volumes_carry_catalog_geometry() -> io::Result<()> {
    let image = two_partition_image(&[])?;
    let (_dir, path) = write_image("parts.img", &image)?;
    let disk = open_disk(&path)?;

    let catalog = VolumeCatalog::open(&disk, &CatalogOptions::default()).unwrap();
    assert_eq!(catalog.len(), 2);

    let vol0 = catalog.get(0).unwrap();
    assert_eq!(vol0.index(), 0);
    assert_eq!(vol0.start_sector(), 64);
    assert_eq!(vol0.sector_count(), 4096);
    assert_eq!(vol0.byte_offset(), 64 * SECTOR as u64);
    assert_eq!(vol0.size(), 4096 * SECTOR as u64);
    assert!(vol0.boot());
    assert_eq!(vol0.type_label(), "FAT16");
    assert!(vol0.guest_fs().is_none()); // not requested

    let vol1 = catalog.get(1).unwrap();
    assert_eq!(vol1.type_label(), "Linux");
    assert!(catalog.get(2).is_none());
    Ok(())
}

#[test]
fn guest_mount_failure_degrades_to_raw_only() -> io::Result<()> {
    let image = two_partition_image(&[("hello.txt", b"hi there")])?;
    let (_dir, path) = write_image("parts.img", &image)?;
    let disk = open_disk(&path)?;

    let catalog = VolumeCatalog::open(&disk, &CatalogOptions { guest_fs: true }).unwrap();
    assert_eq!(catalog.len(), 2);

    // Volume 0 carries FAT and mounts; volume 1 is blank and degrades.
    assert!(catalog.get(0).unwrap().guest_fs().is_some());
    assert!(catalog.get(1).unwrap().guest_fs().is_none());
    Ok(())
}

#[test]
fn guest_filesystem_contents_are_reachable() -> io::Result<()> {
    let image = two_partition_image(&[
        ("hello.txt", b"hi there"),
        ("nested/deep.txt", b"below the root"),
    ])?;
    let (_dir, path) = write_image("parts.img", &image)?;
    let disk = open_disk(&path)?;

    let catalog = VolumeCatalog::open(&disk, &CatalogOptions { guest_fs: true }).unwrap();
    let guest = catalog.get(0).unwrap().guest_fs().unwrap();

    let mut names: Vec<String> = guest.read_dir("")?.into_iter().map(|(n, _)| n).collect();
    names.sort();
    assert_eq!(names, ["hello.txt", "nested"]);

    let stat = guest.stat("hello.txt")?;
    assert_eq!(stat.kind, GuestKind::File);
    assert_eq!(stat.size, 8);

    let stat = guest.stat("nested")?;
    assert_eq!(stat.kind, GuestKind::Directory);

    assert_eq!(guest.read_at("hello.txt", 0, 64)?, b"hi there");
    assert_eq!(guest.read_at("hello.txt", 3, 64)?, b"there");
    assert_eq!(guest.read_at("nested/deep.txt", 0, 5)?, b"below");
    assert!(guest.read_at("hello.txt", 8, 64)?.is_empty());
    assert!(guest.stat("missing.txt").is_err());
    Ok(())
}

#[test]
fn volume_view_round_trips_against_the_disk() -> io::Result<()> {
    let mut image = vec![0u8; 2048 * SECTOR];
    write_mbr(&mut image, &[PartSpec::new(0x83, 8, 1024)]);
    // Recognizable pattern inside the partition.
    for (i, b) in image[8 * SECTOR..8 * SECTOR + 256].iter_mut().enumerate() {
        *b = i as u8;
    }
    let (_dir, path) = write_image("pattern.img", &image)?;
    let disk = open_disk(&path)?;

    let catalog = VolumeCatalog::open(&disk, &CatalogOptions::default()).unwrap();
    let view = catalog.get(0).unwrap().view();

    let mut buf = [0u8; 16];
    assert_eq!(view.read_at(&mut buf, 100)?, 16);
    let expect: Vec<u8> = (100u16..116).map(|i| i as u8).collect();
    assert_eq!(&buf[..], &expect[..]);

    // Reads clamp at the end of the view.
    let mut buf = [0u8; 64];
    let end = view.len() - 10;
    assert_eq!(view.read_at(&mut buf, end)?, 10);
    assert_eq!(view.read_at(&mut buf, view.len())?, 0);
    Ok(())
}
