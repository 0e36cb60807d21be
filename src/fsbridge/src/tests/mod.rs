

#[cfg(test)]
mod resolve;

//--------------------------------------------------------------------------------------------------
// Modules: Helper
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod helper {
    use std::fs;
    use std::io::{self, Cursor, Write};
    use std::sync::Arc;

    use tempfile::TempDir;

    use storage::{open_chain, CatalogOptions, ChainConfig, SecretKeyStore};

    use crate::session::MountSession;

    pub(super) const SECTOR: usize = 512;

    /// An unpartitioned raw image with a position-dependent byte pattern.
    pub(super) fn patterned_image(sectors: usize) -> Vec<u8> {
        (0..sectors * SECTOR)
            .map(|i| (i / 7 + i) as u8)
            .collect()
    }

    /// A disk with two MBR partitions; the first carries a FAT filesystem
    /// populated with `files`, the second stays blank.
    pub(super) fn two_partition_image(files: &[(&str, &[u8])]) -> io::Result<Vec<u8>> {
        let mut image = vec![0u8; 8192 * SECTOR];

        for (i, (kind, start, count)) in [(0x06u8, 64u32, 4096u32), (0x83, 4160, 2048)]
            .iter()
            .enumerate()
        {
            let e = &mut image[446 + i * 16..446 + (i + 1) * 16];
            e[4] = *kind;
            e[8..12].copy_from_slice(&start.to_le_bytes());
            e[12..16].copy_from_slice(&count.to_le_bytes());
        }
        image[510] = 0x55;
        image[511] = 0xaa;

        let range = &mut image[64 * SECTOR..(64 + 4096) * SECTOR];
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
                file.write_all(content)?;
            }
            fs.unmount()?;
        }
        Ok(image)
    }

    /// Materializes `image` under `name` and opens a full session over it.
    pub(super) fn session_over(
        image: &[u8],
        name: &str,
        write: bool,
        guest_fs: bool,
    ) -> io::Result<(TempDir, Arc<MountSession>)> {
        let dir = TempDir::new()?;
        let path = dir.path().join(name);
        fs::write(&path, image)?;

        let keystore = SecretKeyStore::new();
        let chain = open_chain(
            &ChainConfig {
                image: path,
                write,
                crypto: None,
            },
            &keystore,
        )
        .expect("chain open");
        let session =
            MountSession::open(chain, &CatalogOptions { guest_fs }).expect("session open");
        Ok((dir, Arc::new(session)))
    }
}
