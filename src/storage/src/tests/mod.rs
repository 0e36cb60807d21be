#[cfg(test)]
mod catalog;

#[cfg(test)]
mod chain;


//--------------------------------------------------------------------------------------------------
// Modules: Helper
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod helper {
    use std::fs;
    use std::io::{self, Cursor};
    use std::path::PathBuf;

    use tempfile::TempDir;

    pub(super) const SECTOR: usize = 512;

    /// One MBR partition entry for `write_mbr`.
    pub(super) struct PartSpec {
        pub kind: u8,
        pub start: u32,
        pub count: u32,
        pub boot: bool,
    }

    impl PartSpec {
        pub fn new(kind: u8, start: u32, count: u32) -> Self {
            PartSpec {
                kind,
                start,
                count,
                boot: false,
            }
        }
    }

    /// Writes a classic MBR into sector 0 of `image`.
    pub(super) fn write_mbr(image: &mut [u8], parts: &[PartSpec]) {
        assert!(parts.len() <= 4);
        for (i, p) in parts.iter().enumerate() {
            let e = &mut image[446 + i * 16..446 + (i + 1) * 16];
            e[0] = if p.boot { 0x80 } else { 0x00 };
            e[4] = p.kind;
            e[8..12].copy_from_slice(&p.start.to_le_bytes());
            e[12..16].copy_from_slice(&p.count.to_le_bytes());
        }
        image[510] = 0x55;
        image[511] = 0xaa;
    }

    /// Formats a FAT filesystem into the given sector range of `image` and
    /// populates it with `files`.
    pub(super) fn format_fat(
        image: &mut [u8],
        start_sector: u32,
        sector_count: u32,
        files: &[(&str, &[u8])],
    ) -> io::Result<()> {
        let range =
            &mut image[start_sector as usize * SECTOR..(start_sector + sector_count) as usize * SECTOR];
        let mut cursor = Cursor::new(&mut *range);
        fatfs::format_volume(&mut cursor, fatfs::FormatVolumeOptions::new())?;

        if !files.is_empty() {
            let cursor = Cursor::new(&mut *range);
            let fs = fatfs::FileSystem::new(cursor, fatfs::FsOptions::new())?;
            for (path, content) in files {
                if let Some((parent, _)) = path.rsplit_once('/') {
                    let mut dir = fs.root_dir();
                    for comp in parent.split('/') {
                        dir = dir.create_dir(comp)?;
                    }
                }
                let mut file = fs.root_dir().create_file(path)?;
                use std::io::Write;
                file.write_all(content)?;
            }
            fs.unmount()?;
        }
        Ok(())
    }

    /// Materializes `image` as a raw image file inside a fresh tempdir.
    pub(super) fn write_image(name: &str, image: &[u8]) -> io::Result<(TempDir, PathBuf)> {
        let dir = TempDir::new()?;
        let path = dir.path().join(name);
        fs::write(&path, image)?;
        Ok((dir, path))
    }
}
