//! Volume listing output.
//!
//! A reporting view over the session's volume table; one row per volume,
//! plain column padding, nothing here carries state of its own.

use fsbridge::MountSession;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Prints the volume table of `session` to standard output.
pub fn print_volumes(session: &MountSession, wide: bool) {
    println!(
        "image: {} ({} bytes)",
        session.base_path().display(),
        session.disk().size()
    );

    if session.volume_count() == 0 {
        println!("no volumes (unpartitioned disk)");
        return;
    }

    if wide {
        println!(
            "{:<6} {:<4} {:>12} {:>12} {:>9} {:>14} {:>14}  {}",
            "volume", "boot", "start", "sectors", "size", "offset", "bytes", "type"
        );
    } else {
        println!(
            "{:<6} {:<4} {:>12} {:>12} {:>9} {:>14}  {}",
            "volume", "boot", "start", "sectors", "size", "offset", "type"
        );
    }

    for volume in session.volumes() {
        let boot = if volume.boot() { "*" } else { " " };
        if wide {
            println!(
                "vol{:<3} {:<4} {:>12} {:>12} {:>9} {:>14} {:>14}  {}",
                volume.index(),
                boot,
                volume.start_sector(),
                volume.sector_count(),
                human_size(volume.size()),
                volume.byte_offset(),
                volume.size(),
                volume.type_label(),
            );
        } else {
            println!(
                "vol{:<3} {:<4} {:>12} {:>12} {:>9} {:>14}  {}",
                volume.index(),
                boot,
                volume.start_sector(),
                volume.sector_count(),
                human_size(volume.size()),
                volume.byte_offset(),
                volume.type_label(),
            );
        }
    }
}

/// Scales a byte count to a short human-readable figure.
fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::human_size;

    #[test]
    fn sizes_scale_by_powers_of_two() {
        assert_eq!(human_size(0), "0 B");
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1024), "1.0 KiB");
        assert_eq!(human_size(1536), "1.5 KiB");
        assert_eq!(human_size(1 << 20), "1.0 MiB");
        assert_eq!(human_size(5u64 << 30), "5.0 GiB");
    }
}
