//! Process-wide plaintext key cache.
//!
//! Populated exactly once, by the startup loader, after every wrapped key
//! has verified; read-only from then on. Readers get shared references with
//! no locking. The slots zeroize when the cache is dropped at process
//! teardown.

use std::sync::OnceLock;

use thiserror::Error;

use super::crypto::CryptoKey;
use super::{KeyId, N_KEYS};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("internal keys are not loaded")]
    NotInstalled,

    #[error("internal keys are already loaded")]
    AlreadyInstalled,

    #[error("invalid cryptographic key identifier {0}")]
    OutOfRange(KeyId),
}

#[derive(Debug, Default)]
pub struct KeyCache {
    slots: OnceLock<Vec<CryptoKey>>,
}

impl KeyCache {
    pub const fn new() -> Self {
        Self {
            slots: OnceLock::new(),
        }
    }

    /// Bytes held once populated.
    pub fn shared_size(&self) -> usize {
        N_KEYS * size_of::<CryptoKey>()
    }

    /// Publish the full key set. Permitted once; the startup loader is the
    /// only caller.
    pub fn install(&self, keys: Vec<CryptoKey>) -> Result<(), CacheError> {
        debug_assert_eq!(keys.len(), N_KEYS);
        self.slots.set(keys).map_err(|_| CacheError::AlreadyInstalled)
    }

    /// Read-only access to one plaintext key, valid for the cache lifetime.
    pub fn get(&self, id: KeyId) -> Result<&CryptoKey, CacheError> {
        if id as usize >= N_KEYS {
            return Err(CacheError::OutOfRange(id));
        }
        let slots = self.slots.get().ok_or(CacheError::NotInstalled)?;
        Ok(&slots[id as usize])
    }

    pub fn is_installed(&self) -> bool {
        self.slots.get().is_some()
    }
}
