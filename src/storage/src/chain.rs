//! Image chain opening.
//!
//! Walks a differencing chain from the user-requested leaf down to its base
//! image, taking an advisory file lock on every layer. Lock acquisition is
//! all-or-nothing: a denial anywhere drops every guard taken so far (RAII)
//! and fails the whole open. The composed block device itself is then opened
//! through `imago`, which follows the same backing pointers internally.

use std::fmt;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info};
use nix::fcntl::{Flock, FlockArg};

use crate::disk::ComposedDisk;
use crate::format;
use crate::keystore::{KeyStoreError, SecretKeyStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Cap on the chain length, against backing-file cycles.
const MAX_CHAIN_DEPTH: usize = 64;

/// Key id under which crypto material for the chain is staged.
const CHAIN_KEY_ID: &str = "chain/leaf";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Typed crypto configuration for an encrypted chain.
#[derive(Clone, Debug, Default)]
pub struct CryptoConfig {
    pub cipher: Option<String>,
    pub password: Option<String>,
    pub key_store_blob: Option<String>,
    pub create_key_store: bool,
}

/// What to open and how.
#[derive(Clone, Debug)]
pub struct ChainConfig {
    /// Path of the leaf (user-requested) image.
    pub image: PathBuf,

    /// Open the leaf for writing.
    pub write: bool,

    /// Crypto material, when the operator supplied any.
    pub crypto: Option<CryptoConfig>,
}

/// One opened layer of the chain. Dropping the layer releases its lock.
pub struct ImageLayer {
    name: String,
    path: PathBuf,
    writable: bool,
    _lock: Flock<std::fs::File>,
}

/// Result of a successful chain open.
pub struct OpenedChain {
    /// Leaf-to-base layer list; non-empty, last element is the base image.
    pub layers: Vec<ImageLayer>,

    /// The composed block device over the whole chain.
    pub disk: ComposedDisk,

    /// Display name of the base image (its file name).
    pub base_name: String,

    /// Absolute path of the base image.
    pub base_path: PathBuf,
}

/// Errors from opening an image chain.
#[derive(Debug)]
pub enum ChainError {
    /// An image of the chain does not exist.
    NotFound(PathBuf),

    /// An advisory lock on a layer was denied.
    LockDenied(PathBuf),

    /// The chain declares encryption. Distinct from `NotFound`: the image
    /// exists but is inaccessible.
    Encrypted { path: PathBuf, detail: String },

    /// The chain is longer than `MAX_CHAIN_DEPTH` layers, which also covers
    /// backing-file cycles the per-layer probe cannot see.
    TooDeep(PathBuf),

    /// Key store bookkeeping failed while staging crypto material.
    KeyStore(KeyStoreError),

    /// The image backend reported an error.
    Image(io::Error),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Opens the whole chain rooted at `cfg.image`.
///
/// Layers are probed and locked leaf to base: shared lock everywhere, an
/// exclusive lock on the leaf when write mode was requested. Crypto material,
/// when supplied, is staged in `keystore` before the backend open so that a
/// missing key and a backend failure stay distinguishable; the staged key is
/// released again on every failure path.
pub fn open_chain(cfg: &ChainConfig, keystore: &SecretKeyStore) -> Result<OpenedChain, ChainError> {
    let leaf = canonical_image_path(&cfg.image)?;
    let leaf_format = format::probe(&leaf).map_err(ChainError::Image)?.format;

    let mut layers = Vec::new();
    let mut current = leaf.clone();
    let mut encrypted: Option<PathBuf> = None;
    let mut reached_base = false;

    for depth in 0..MAX_CHAIN_DEPTH {
        let probe = format::probe(&current).map_err(ChainError::Image)?;
        let writable = depth == 0 && cfg.write;
        layers.push(lock_layer(&current, writable)?);
        debug!(
            "layer {}: {} ({:?}, {})",
            depth,
            current.display(),
            probe.format,
            if writable { "rw" } else { "ro" }
        );

        if probe.encryption.is_some() && encrypted.is_none() {
            encrypted = Some(current.clone());
        }

        match probe.backing_file {
            Some(next) => current = canonical_image_path(&next)?,
            None => {
                reached_base = true;
                break;
            }
        }
    }

    // Every ancestor must end up locked. A walk that never hit a base layer
    // is either absurdly deep or cycling through its backing pointers.
    if !reached_base {
        return Err(ChainError::TooDeep(current));
    }

    if let Some(path) = encrypted {
        return Err(handle_encrypted_chain(&path, cfg.crypto.as_ref(), keystore));
    }

    // The chain is fully locked; hand the leaf to the backend, which opens
    // the backing dependencies behind the same locks.
    let disk = ComposedDisk::open(&leaf, leaf_format, cfg.write).map_err(ChainError::Image)?;

    let base_path = layers.last().map(|l| l.path.clone()).unwrap_or(leaf);
    let base_name = base_path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "disk".to_string());

    info!(
        "opened {} layer(s), composed size {} bytes",
        layers.len(),
        disk.size()
    );

    Ok(OpenedChain {
        layers,
        disk,
        base_name,
        base_path,
    })
}

/// Stages crypto material for an encrypted chain and produces the error the
/// open must fail with.
///
/// The consumed format backend exposes no decryption filter, so an encrypted
/// chain cannot currently be composed; the two failure modes (no retrievable
/// key material vs. backend cannot apply the key) still produce distinct
/// messages for the operator.
fn handle_encrypted_chain(
    path: &Path,
    crypto: Option<&CryptoConfig>,
    keystore: &SecretKeyStore,
) -> ChainError {
    let material = crypto.and_then(|c| c.password.as_deref().or(c.key_store_blob.as_deref()));

    let Some(material) = material else {
        return ChainError::Encrypted {
            path: path.to_path_buf(),
            detail: "no key material supplied (need a password or a key store)".to_string(),
        };
    };

    // Stage and immediately drain the key under the refcount discipline, so
    // the material is never left legible behind us.
    let staged = keystore
        .add(CHAIN_KEY_ID, material.as_bytes(), 1, true)
        .and_then(|_| keystore.retain(CHAIN_KEY_ID));
    let detail = match staged {
        Ok(()) => {
            let _ = keystore.release(CHAIN_KEY_ID);
            let _ = keystore.delete(CHAIN_KEY_ID);
            "key material is present but the image backend cannot apply a decryption filter"
                .to_string()
        }
        Err(e) => return ChainError::KeyStore(e),
    };

    ChainError::Encrypted {
        path: path.to_path_buf(),
        detail,
    }
}

/// Canonicalizes an image path, mapping absence to `ChainError::NotFound`.
fn canonical_image_path(path: &Path) -> Result<PathBuf, ChainError> {
    match path.canonicalize() {
        Ok(p) => Ok(p),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(ChainError::NotFound(path.to_path_buf()))
        }
        Err(e) => Err(ChainError::Image(e)),
    }
}

/// Opens one layer file and takes its advisory lock.
fn lock_layer(path: &Path, writable: bool) -> Result<ImageLayer, ChainError> {
    let file = OpenOptions::new()
        .read(true)
        .write(writable)
        .open(path)
        .map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ChainError::NotFound(path.to_path_buf()),
            _ => ChainError::Image(e),
        })?;

    let arg = if writable {
        FlockArg::LockExclusiveNonblock
    } else {
        FlockArg::LockSharedNonblock
    };
    let lock = Flock::lock(file, arg).map_err(|_| ChainError::LockDenied(path.to_path_buf()))?;

    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    Ok(ImageLayer {
        name,
        path: path.to_path_buf(),
        writable,
        _lock: lock,
    })
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ImageLayer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writable(&self) -> bool {
        self.writable
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Debug for OpenedChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenedChain")
            .field("layers", &self.layers.len())
            .field("base_name", &self.base_name)
            .field("base_path", &self.base_path)
            .field("size", &self.disk.size())
            .finish()
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::NotFound(p) => write!(f, "image not found: {}", p.display()),
            ChainError::LockDenied(p) => {
                write!(f, "could not lock {} (image in use?)", p.display())
            }
            ChainError::Encrypted { path, detail } => {
                write!(f, "image {} is encrypted: {}", path.display(), detail)
            }
            ChainError::TooDeep(p) => write!(
                f,
                "backing chain through {} exceeds {} layers (cycle?)",
                p.display(),
                MAX_CHAIN_DEPTH
            ),
            ChainError::KeyStore(e) => write!(f, "key staging failed: {}", e),
            ChainError::Image(e) => write!(f, "image backend error: {}", e),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<KeyStoreError> for ChainError {
    fn from(e: KeyStoreError) -> Self {
        ChainError::KeyStore(e)
    }
}
