use std::fs;
use std::io;

use crate::chain::{open_chain, ChainConfig, ChainError, CryptoConfig};
use crate::keystore::SecretKeyStore;

use super::helper::write_image;

//--------------------------------------------------------------------------------------------------
// Helper
//--------------------------------------------------------------------------------------------------

fn config(image: std::path::PathBuf, write: bool) -> ChainConfig {
    ChainConfig {
        image,
        write,
        crypto: None,
    }
}

/// Minimal qcow2 header declaring LUKS encryption; enough for probing, which
/// is all that happens before the encryption error is raised.
fn encrypted_header() -> Vec<u8> {
    let mut header = vec![0u8; 104];
    header[0..4].copy_from_slice(&0x5146_49fbu32.to_be_bytes());
    header[4..8].copy_from_slice(&3u32.to_be_bytes());
    header[32..36].copy_from_slice(&2u32.to_be_bytes());
    header
}

/// Minimal qcow2 header referencing `backing`; probe-only, like above.
fn backing_header(backing: &str) -> Vec<u8> {
    let mut image = vec![0u8; 104];
    image[0..4].copy_from_slice(&0x5146_49fbu32.to_be_bytes());
    image[4..8].copy_from_slice(&3u32.to_be_bytes());
    image[8..16].copy_from_slice(&104u64.to_be_bytes());
    image[16..20].copy_from_slice(&(backing.len() as u32).to_be_bytes());
    image.extend_from_slice(backing.as_bytes());
    image
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test]
fn raw_image_opens_as_single_layer_chain() -> io::Result<()> {
    let (_dir, path) = write_image("base.img", &vec![0u8; 1 << 20])?;
    let keystore = SecretKeyStore::new();

    let chain = open_chain(&config(path.clone(), false), &keystore).unwrap();
    assert_eq!(chain.layers.len(), 1);
    assert_eq!(chain.base_name, "base.img");
    assert_eq!(chain.base_path, path.canonicalize()?);
    assert!(!chain.layers[0].writable());
    assert_eq!(chain.disk.size(), 1 << 20);
    assert!(!chain.disk.writable());
    Ok(())
}

#[test]
fn base_name_keeps_its_extension() -> io::Result<()> {
    let (_dir, path) = write_image("disk.vdi", &vec![0u8; 1 << 20])?;
    let keystore = SecretKeyStore::new();

    let chain = open_chain(&config(path, false), &keystore).unwrap();
    assert_eq!(chain.base_name, "disk.vdi");
    assert_eq!(chain.layers[0].name(), "disk.vdi");
    Ok(())
}

#[test]
fn cyclic_backing_chain_is_rejected() -> io::Result<()> {
    let (dir, a) = write_image("a.qcow2", &backing_header("b.qcow2"))?;
    fs::write(dir.path().join("b.qcow2"), backing_header("a.qcow2"))?;
    let keystore = SecretKeyStore::new();

    let err = open_chain(&config(a, false), &keystore).unwrap_err();
    assert!(matches!(err, ChainError::TooDeep(_)));
    Ok(())
}

#[test]
fn missing_image_is_not_found() {
    let keystore = SecretKeyStore::new();
    let err = open_chain(
        &config("/nonexistent/image.img".into(), false),
        &keystore,
    )
    .unwrap_err();
    assert!(matches!(err, ChainError::NotFound(_)));
}

#[test]
fn write_mode_takes_an_exclusive_lock() -> io::Result<()> {
    let (_dir, path) = write_image("leaf.img", &vec![0u8; 1 << 20])?;
    let keystore = SecretKeyStore::new();

    let first = open_chain(&config(path.clone(), true), &keystore).unwrap();
    assert!(first.layers[0].writable());
    assert!(first.disk.writable());

    // A second open of the same leaf must be denied while the exclusive
    // lock is held, and succeed once it is released.
    let err = open_chain(&config(path.clone(), false), &keystore).unwrap_err();
    assert!(matches!(err, ChainError::LockDenied(_)));

    drop(first);
    open_chain(&config(path, false), &keystore).unwrap();
    Ok(())
}

#[test]
fn shared_locks_coexist() -> io::Result<()> {
    let (_dir, path) = write_image("leaf.img", &vec![0u8; 1 << 20])?;
    let keystore = SecretKeyStore::new();

    let first = open_chain(&config(path.clone(), false), &keystore).unwrap();
    let second = open_chain(&config(path, false), &keystore).unwrap();
    drop((first, second));
    Ok(())
}

#[test]
fn encrypted_image_fails_distinctly() -> io::Result<()> {
    let (_dir, path) = write_image("crypt.qcow2", &encrypted_header())?;
    let keystore = SecretKeyStore::new();

    let err = open_chain(&config(path.clone(), false), &keystore).unwrap_err();
    match err {
        ChainError::Encrypted { detail, .. } => {
            assert!(detail.contains("no key material"));
        }
        other => panic!("expected Encrypted, got {other:?}"),
    }

    // With a password supplied the failure text changes, and the staged key
    // is drained from the store again.
    let mut cfg = config(path, false);
    cfg.crypto = Some(CryptoConfig {
        password: Some("hunter2".to_string()),
        ..Default::default()
    });
    let err = open_chain(&cfg, &keystore).unwrap_err();
    match err {
        ChainError::Encrypted { detail, .. } => {
            assert!(detail.contains("cannot apply"));
        }
        other => panic!("expected Encrypted, got {other:?}"),
    }
    assert!(!keystore.contains("chain/leaf"));
    Ok(())
}

#[test]
fn readonly_leaf_file_still_opens_readonly() -> io::Result<()> {
    let (_dir, path) = write_image("ro.img", &vec![0u8; 1 << 20])?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(&path, perms)?;

    let keystore = SecretKeyStore::new();
    open_chain(&config(path, false), &keystore).unwrap();
    Ok(())
}
