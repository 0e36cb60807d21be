//! Image format probing.
//!
//! Only enough of the image headers is inspected here to classify an image,
//! to follow its backing-file pointer and to notice a declared encryption
//! method. All actual decoding of the formats is left to `imago`.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const QCOW2_MAGIC: u32 = 0x5146_49fb; // "QFI\xfb"

/// Upper bound on the backing file name length we are willing to read.
const MAX_BACKING_NAME_LEN: u32 = 1023;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Disk image format, as far as this crate distinguishes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageFormat {
    /// Flat raw image; always terminates a backing chain.
    Raw,

    /// qcow2 image; may reference a backing file and declare encryption.
    Qcow2,
}

/// Encryption method declared in a qcow2 header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes,
    Luks,
    Unknown(u32),
}

/// Result of probing one image file header.
#[derive(Debug)]
pub struct ImageProbe {
    pub format: ImageFormat,

    /// Backing image path, resolved against the probed image's directory
    /// when the header stores a relative name.
    pub backing_file: Option<PathBuf>,

    /// Encryption method, when the header declares one.
    pub encryption: Option<EncryptionMethod>,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Probes the header of the image at `path`.
///
/// Files too short to hold a qcow2 header, or without the qcow2 magic, are
/// classified as raw.
pub fn probe(path: &Path) -> io::Result<ImageProbe> {
    let mut file = File::open(path)?;

    let mut header = [0u8; 104];
    let n = read_up_to(&mut file, &mut header)?;
    if n < 72 || be_u32(&header[0..4]) != QCOW2_MAGIC {
        return Ok(ImageProbe {
            format: ImageFormat::Raw,
            backing_file: None,
            encryption: None,
        });
    }

    let backing_offset = be_u64(&header[8..16]);
    let backing_len = be_u32(&header[16..20]);
    let crypt_method = be_u32(&header[32..36]);

    let backing_file = if backing_offset != 0 && backing_len != 0 {
        if backing_len > MAX_BACKING_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: implausible backing file name length {}", path.display(), backing_len),
            ));
        }
        let mut name = vec![0u8; backing_len as usize];
        file.seek(SeekFrom::Start(backing_offset))?;
        file.read_exact(&mut name)?;
        let name = String::from_utf8(name).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: backing file name is not valid UTF-8", path.display()),
            )
        })?;
        Some(resolve_backing_path(path, &name))
    } else {
        None
    };

    let encryption = match crypt_method {
        0 => None,
        1 => Some(EncryptionMethod::Aes),
        2 => Some(EncryptionMethod::Luks),
        other => Some(EncryptionMethod::Unknown(other)),
    };

    Ok(ImageProbe {
        format: ImageFormat::Qcow2,
        backing_file,
        encryption,
    })
}

/// Resolves a backing file name relative to the referring image's directory.
fn resolve_backing_path(referrer: &Path, name: &str) -> PathBuf {
    let backing = Path::new(name);
    if backing.is_absolute() {
        backing.to_path_buf()
    } else {
        match referrer.parent() {
            Some(dir) => dir.join(backing),
            None => backing.to_path_buf(),
        }
    }
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Builds a minimal qcow2 header with the given backing name and crypt
    /// method, good enough for the probe (not for opening).
    fn write_qcow2_header(
        file: &mut impl Write,
        backing: Option<&str>,
        crypt_method: u32,
    ) -> io::Result<()> {
        let mut header = [0u8; 104];
        header[0..4].copy_from_slice(&QCOW2_MAGIC.to_be_bytes());
        header[4..8].copy_from_slice(&3u32.to_be_bytes()); // version
        header[32..36].copy_from_slice(&crypt_method.to_be_bytes());
        if let Some(name) = backing {
            header[8..16].copy_from_slice(&104u64.to_be_bytes());
            header[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
        }
        file.write_all(&header)?;
        if let Some(name) = backing {
            file.write_all(name.as_bytes())?;
        }
        Ok(())
    }

    #[test]
    fn raw_image_is_detected() -> io::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(&[0u8; 4096])?;
        let probe = probe(f.path())?;
        assert_eq!(probe.format, ImageFormat::Raw);
        assert!(probe.backing_file.is_none());
        assert!(probe.encryption.is_none());
        Ok(())
    }

    #[test]
    fn short_file_is_raw() -> io::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(b"QFI")?;
        assert_eq!(probe(f.path())?.format, ImageFormat::Raw);
        Ok(())
    }

    #[test]
    fn qcow2_backing_file_is_resolved_relative() -> io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("leaf.qcow2");
        let mut f = File::create(&path)?;
        write_qcow2_header(&mut f, Some("base.img"), 0)?;

        let probe = probe(&path)?;
        assert_eq!(probe.format, ImageFormat::Qcow2);
        assert_eq!(probe.backing_file.as_deref(), Some(dir.path().join("base.img").as_path()));
        Ok(())
    }

    #[test]
    fn qcow2_encryption_is_reported() -> io::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("crypt.qcow2");
        let mut f = File::create(&path)?;
        write_qcow2_header(&mut f, None, 2)?;

        let probe = probe(&path)?;
        assert_eq!(probe.encryption, Some(EncryptionMethod::Luks));
        Ok(())
    }
}
