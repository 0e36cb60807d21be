//! In-memory secret key store.
//!
//! Key material is kept XOR-scrambled with a per-key random mask while no
//! user holds a reference to it; the 0 -> 1 retain transition unscrambles the
//! bytes in place and the 1 -> 0 release transition scrambles them again.
//! Keys are never observable in legible form at reference count zero.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use rand::Rng;
use zeroize::Zeroize;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Errors from secret key store operations.
#[derive(Debug)]
pub enum KeyStoreError {
    /// A key with this id already exists.
    DuplicateKey(String),

    /// No key with this id.
    NotFound(String),

    /// The key is still retained by at least one user.
    InUse(String),

    /// The key material was requested while not retained.
    NotRetained(String),
}

/// One key: masked material plus its reference-count state.
struct SecretKey {
    /// Key bytes; legible while `users > 0`, XOR-masked otherwise.
    bytes: Vec<u8>,
    mask: Vec<u8>,
    users: u32,
    /// How many consumers the key was registered for at add time.
    expected_users: u32,
    remove_on_suspend: bool,
}

/// Mapping from key id to key, with unique ids.
#[derive(Default)]
pub struct SecretKeyStore {
    keys: Mutex<BTreeMap<String, SecretKey>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SecretKey {
    fn new(material: &[u8], expected_users: u32, remove_on_suspend: bool) -> Self {
        let mut mask = vec![0u8; material.len()];
        rand::rng().fill(&mut mask[..]);

        let mut bytes = material.to_vec();
        xor_in_place(&mut bytes, &mask);

        SecretKey {
            bytes,
            mask,
            users: 0,
            expected_users,
            remove_on_suspend,
        }
    }

    fn apply_mask(&mut self) {
        let (bytes, mask) = (&mut self.bytes, &self.mask);
        xor_in_place(bytes, mask);
    }
}

impl SecretKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key registered for `expected_users` consumers. Fails if `id`
    /// is already present.
    pub fn add(
        &self,
        id: &str,
        material: &[u8],
        expected_users: u32,
        remove_on_suspend: bool,
    ) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.lock().unwrap();
        if keys.contains_key(id) {
            return Err(KeyStoreError::DuplicateKey(id.to_string()));
        }
        keys.insert(
            id.to_string(),
            SecretKey::new(material, expected_users, remove_on_suspend),
        );
        Ok(())
    }

    /// Increments the key's reference count; the 0 -> 1 transition makes the
    /// material legible.
    pub fn retain(&self, id: &str) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.lock().unwrap();
        let key = keys
            .get_mut(id)
            .ok_or_else(|| KeyStoreError::NotFound(id.to_string()))?;
        if key.users == 0 {
            key.apply_mask();
        }
        key.users += 1;
        Ok(())
    }

    /// Decrements the key's reference count; the 1 -> 0 transition scrambles
    /// the material again.
    pub fn release(&self, id: &str) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.lock().unwrap();
        let key = keys
            .get_mut(id)
            .ok_or_else(|| KeyStoreError::NotFound(id.to_string()))?;
        if key.users == 0 {
            return Err(KeyStoreError::NotRetained(id.to_string()));
        }
        key.users -= 1;
        if key.users == 0 {
            key.apply_mask();
        }
        Ok(())
    }

    /// Calls `f` with the legible key material. The key must currently be
    /// retained by the caller.
    pub fn with_key<R>(&self, id: &str, f: impl FnOnce(&[u8]) -> R) -> Result<R, KeyStoreError> {
        let keys = self.keys.lock().unwrap();
        let key = keys
            .get(id)
            .ok_or_else(|| KeyStoreError::NotFound(id.to_string()))?;
        if key.users == 0 {
            return Err(KeyStoreError::NotRetained(id.to_string()));
        }
        Ok(f(&key.bytes))
    }

    /// Removes one key. Fails while the key is retained.
    pub fn delete(&self, id: &str) -> Result<(), KeyStoreError> {
        let mut keys = self.keys.lock().unwrap();
        let key = keys
            .get(id)
            .ok_or_else(|| KeyStoreError::NotFound(id.to_string()))?;
        if key.users > 0 {
            return Err(KeyStoreError::InUse(id.to_string()));
        }
        keys.remove(id);
        Ok(())
    }

    /// Removes every key with reference count zero (every key regardless
    /// when `force` is set), optionally restricted to keys flagged
    /// remove-on-suspend. Returns the number of keys removed.
    pub fn delete_all(&self, force: bool, suspend_only: bool) -> usize {
        let mut keys = self.keys.lock().unwrap();
        let before = keys.len();
        keys.retain(|_, key| {
            if suspend_only && !key.remove_on_suspend {
                return true;
            }
            !(force || key.users == 0)
        });
        before - keys.len()
    }

    /// Current reference count of a key.
    pub fn users(&self, id: &str) -> Result<u32, KeyStoreError> {
        let keys = self.keys.lock().unwrap();
        keys.get(id)
            .map(|k| k.users)
            .ok_or_else(|| KeyStoreError::NotFound(id.to_string()))
    }

    /// Consumer count the key was registered for.
    pub fn expected_users(&self, id: &str) -> Result<u32, KeyStoreError> {
        let keys = self.keys.lock().unwrap();
        keys.get(id)
            .map(|k| k.expected_users)
            .ok_or_else(|| KeyStoreError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.lock().unwrap().contains_key(id)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
        self.mask.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material.
        f.debug_struct("SecretKey")
            .field("len", &self.bytes.len())
            .field("users", &self.users)
            .field("expected_users", &self.expected_users)
            .field("remove_on_suspend", &self.remove_on_suspend)
            .finish()
    }
}

impl fmt::Display for KeyStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyStoreError::DuplicateKey(id) => write!(f, "key '{}' already exists", id),
            KeyStoreError::NotFound(id) => write!(f, "no key '{}'", id),
            KeyStoreError::InUse(id) => write!(f, "key '{}' is still in use", id),
            KeyStoreError::NotRetained(id) => write!(f, "key '{}' is not retained", id),
        }
    }
}

impl std::error::Error for KeyStoreError {}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn xor_in_place(bytes: &mut [u8], mask: &[u8]) {
    for (b, m) in bytes.iter_mut().zip(mask) {
        *b ^= m;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
