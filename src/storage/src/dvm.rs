//! Partition-table walking.
//!
//! Enumerates MBR primary partitions, MBR logical partitions through the EBR
//! chain, and GPT entries behind a protective MBR. The walk order is the
//! natural forward-enumeration order of the table, which gives every volume
//! its stable 0-based index for the session.

use std::io;

use log::warn;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MBR_SIGNATURE: u16 = 0xaa55;
const MBR_ENTRY_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;

const MBR_TYPE_EXTENDED_CHS: u8 = 0x05;
const MBR_TYPE_EXTENDED_LBA: u8 = 0x0f;
const MBR_TYPE_EXTENDED_LINUX: u8 = 0x85;
const MBR_TYPE_GPT_PROTECTIVE: u8 = 0xee;

/// Cap on the EBR chain walk, against self-referencing links.
const MAX_LOGICAL_PARTITIONS: usize = 128;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Sector-granular read access, the only thing the walker needs from the
/// underlying device.
pub trait SectorSource {
    fn read_sectors(&self, lba: u64, buf: &mut [u8]) -> io::Result<()>;
    fn sector_size(&self) -> u32;
    fn sector_count(&self) -> u64;
}

/// One discovered partition, in walk order.
#[derive(Clone, Debug)]
pub struct PartitionInfo {
    pub start_sector: u64,
    pub sector_count: u64,
    pub boot: bool,
    pub type_label: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Walks the partition table of `source`.
///
/// An unpartitioned or unrecognized disk yields an empty list; that is not an
/// error.
pub fn enumerate_partitions(source: &dyn SectorSource) -> io::Result<Vec<PartitionInfo>> {
    let sector_size = source.sector_size() as usize;
    let mut sector = vec![0u8; sector_size];
    if source.sector_count() == 0 {
        return Ok(Vec::new());
    }
    source.read_sectors(0, &mut sector)?;

    if sector_size < 512 || le_u16(&sector[510..512]) != MBR_SIGNATURE {
        return Ok(Vec::new());
    }

    // A protective MBR hands the whole disk over to GPT.
    if primary_entries(&sector).any(|e| e.kind == MBR_TYPE_GPT_PROTECTIVE) {
        return enumerate_gpt(source);
    }

    let mut partitions = Vec::new();
    let mut extended_start = None;

    for entry in primary_entries(&sector) {
        if entry.kind == 0 || entry.sectors == 0 {
            continue;
        }
        if is_extended(entry.kind) {
            if extended_start.is_none() {
                extended_start = Some(entry.start as u64);
            }
            continue;
        }
        partitions.push(PartitionInfo {
            start_sector: entry.start as u64,
            sector_count: entry.sectors as u64,
            boot: entry.boot,
            type_label: mbr_type_label(entry.kind).to_string(),
        });
    }

    if let Some(ext_base) = extended_start {
        walk_ebr_chain(source, ext_base, &mut partitions)?;
    }

    Ok(partitions)
}

/// Walks the chain of extended boot records starting at `ext_base`.
///
/// Each EBR holds one logical partition (relative to that EBR) and one link
/// entry (relative to the extended partition's base).
fn walk_ebr_chain(
    source: &dyn SectorSource,
    ext_base: u64,
    partitions: &mut Vec<PartitionInfo>,
) -> io::Result<()> {
    let sector_size = source.sector_size() as usize;
    let mut sector = vec![0u8; sector_size];
    let mut ebr_lba = ext_base;

    for _ in 0..MAX_LOGICAL_PARTITIONS {
        source.read_sectors(ebr_lba, &mut sector)?;
        if le_u16(&sector[510..512]) != MBR_SIGNATURE {
            warn!("EBR at sector {} has no boot signature, stopping the walk", ebr_lba);
            break;
        }

        let entries: Vec<_> = primary_entries(&sector).collect();

        let logical = &entries[0];
        if logical.kind != 0 && logical.sectors != 0 && !is_extended(logical.kind) {
            partitions.push(PartitionInfo {
                start_sector: ebr_lba + logical.start as u64,
                sector_count: logical.sectors as u64,
                boot: logical.boot,
                type_label: mbr_type_label(logical.kind).to_string(),
            });
        }

        let link = &entries[1];
        if link.kind == 0 || link.sectors == 0 {
            break;
        }
        let next = ext_base + link.start as u64;
        if next == ebr_lba {
            warn!("EBR chain links to itself at sector {}, stopping the walk", ebr_lba);
            break;
        }
        ebr_lba = next;
    }

    Ok(())
}

/// Enumerates GPT entries behind a protective MBR.
fn enumerate_gpt(source: &dyn SectorSource) -> io::Result<Vec<PartitionInfo>> {
    let sector_size = source.sector_size() as usize;
    let mut header = vec![0u8; sector_size];
    source.read_sectors(1, &mut header)?;

    if &header[0..8] != GPT_SIGNATURE {
        warn!("protective MBR present but no GPT header at LBA 1");
        return Ok(Vec::new());
    }

    let entries_lba = le_u64(&header[72..80]);
    let entry_count = le_u32(&header[80..84]) as usize;
    let entry_size = le_u32(&header[84..88]) as usize;
    if entry_size < 128 || entry_size > 4096 || entry_count > 1024 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "implausible GPT entry layout",
        ));
    }

    let table_bytes = entry_count * entry_size;
    let table_sectors = table_bytes.div_ceil(sector_size);
    let mut table = vec![0u8; table_sectors * sector_size];
    source.read_sectors(entries_lba, &mut table)?;

    let mut partitions = Vec::new();
    for i in 0..entry_count {
        let entry = &table[i * entry_size..(i + 1) * entry_size];
        let type_guid = &entry[0..16];
        if type_guid.iter().all(|&b| b == 0) {
            continue;
        }
        let first_lba = le_u64(&entry[32..40]);
        let last_lba = le_u64(&entry[40..48]);
        if last_lba < first_lba {
            continue;
        }

        let name = utf16le_name(&entry[56..entry_size.min(56 + 72)]);
        let type_label = if name.is_empty() {
            gpt_type_label(type_guid).to_string()
        } else {
            name
        };

        partitions.push(PartitionInfo {
            start_sector: first_lba,
            sector_count: last_lba - first_lba + 1,
            boot: false,
            type_label,
        });
    }

    Ok(partitions)
}

//--------------------------------------------------------------------------------------------------
// Helpers
//--------------------------------------------------------------------------------------------------

struct MbrEntry {
    boot: bool,
    kind: u8,
    start: u32,
    sectors: u32,
}

fn primary_entries(sector: &[u8]) -> impl Iterator<Item = MbrEntry> + '_ {
    (0..4).map(move |i| {
        let e = &sector[MBR_ENTRY_OFFSET + i * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
        MbrEntry {
            boot: e[0] == 0x80,
            kind: e[4],
            start: le_u32(&e[8..12]),
            sectors: le_u32(&e[12..16]),
        }
    })
}

fn is_extended(kind: u8) -> bool {
    matches!(
        kind,
        MBR_TYPE_EXTENDED_CHS | MBR_TYPE_EXTENDED_LBA | MBR_TYPE_EXTENDED_LINUX
    )
}

fn mbr_type_label(kind: u8) -> &'static str {
    match kind {
        0x01 => "FAT12",
        0x04 | 0x06 | 0x0e => "FAT16",
        0x07 => "NTFS/exFAT",
        0x0b | 0x0c => "FAT32",
        0x82 => "Linux swap",
        0x83 => "Linux",
        0x8e => "Linux LVM",
        0xa5 => "FreeBSD",
        0xa6 => "OpenBSD",
        0xa9 => "NetBSD",
        0xaf => "Mac HFS",
        0xfd => "Linux RAID",
        _ => "Unknown",
    }
}

fn gpt_type_label(guid: &[u8]) -> &'static str {
    // Mixed-endian on-disk GUID layout.
    const EFI_SYSTEM: [u8; 16] = [
        0x28, 0x73, 0x2a, 0xc1, 0x1f, 0xf8, 0xd2, 0x11, 0xba, 0x4b, 0x00, 0xa0, 0xc9, 0x3e, 0xc9,
        0x3b,
    ];
    const LINUX_FS: [u8; 16] = [
        0xaf, 0x3d, 0xc6, 0x0f, 0x83, 0x84, 0x72, 0x47, 0x8e, 0x79, 0x3d, 0x69, 0xd8, 0x47, 0x7d,
        0xe4,
    ];
    const MS_BASIC_DATA: [u8; 16] = [
        0xa2, 0xa0, 0xd0, 0xeb, 0xe5, 0xb9, 0x33, 0x44, 0x87, 0xc0, 0x68, 0xb6, 0xb7, 0x26, 0x99,
        0xc7,
    ];

    if guid == EFI_SYSTEM {
        "EFI System"
    } else if guid == LINUX_FS {
        "Linux filesystem"
    } else if guid == MS_BASIC_DATA {
        "Basic data"
    } else {
        "Unknown"
    }
}

fn utf16le_name(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

fn le_u64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}
