//! Pre-shared-key storage types.
//!
//! The key store is read-only for the server core and safe for concurrent
//! lookup from the TLS callback. Key bytes live behind
//! [`secrecy::SecretSlice`] so no `Debug` or serde path can leak them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use secrecy::SecretSlice;

/// Maximum PSK identity length in bytes (UTF-8).
pub const MAX_IDENTITY_LEN: usize = 128;

/// Errors raised while building a key store.
#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    /// Identity empty or longer than [`MAX_IDENTITY_LEN`] bytes.
    #[error("identity must be 1..={MAX_IDENTITY_LEN} bytes, got {0}")]
    InvalidIdentity(usize),
    /// PSK keys are 16 or 32 raw bytes.
    #[error("key must be 16 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    /// Identities are unique per store.
    #[error("duplicate identity {0}")]
    DuplicateIdentity(String),
}

/// One provisioned pre-shared key.
pub struct KeyEntry {
    /// Unique PSK identity the card presents in `ClientKeyExchange`.
    pub identity: String,
    /// Version counter of the provisioned key.
    pub key_version: u8,
    /// When the entry was created.
    pub created_at: SystemTime,
    key: SecretSlice<u8>,
}

impl KeyEntry {
    /// Validates identity and key length and wraps the key bytes.
    pub fn new(identity: String, key: Vec<u8>, key_version: u8) -> Result<Self, KeyStoreError> {
        if identity.is_empty() || identity.len() > MAX_IDENTITY_LEN {
            return Err(KeyStoreError::InvalidIdentity(identity.len()));
        }
        if key.len() != 16 && key.len() != 32 {
            return Err(KeyStoreError::InvalidKeyLength(key.len()));
        }
        Ok(Self {
            identity,
            key_version,
            created_at: SystemTime::now(),
            key: key.into(),
        })
    }

    /// The key bytes. Only the TLS callbacks should expose these.
    pub fn key(&self) -> &SecretSlice<u8> {
        &self.key
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("identity", &self.identity)
            .field("key_version", &self.key_version)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Read-only lookup of PSK entries by identity.
pub trait KeyStore: Send + Sync {
    /// Returns the entry for `identity`, if provisioned.
    fn lookup(&self, identity: &str) -> Option<Arc<KeyEntry>>;

    /// Number of provisioned identities.
    fn len(&self) -> usize;

    /// `true` if no identity is provisioned.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory [`KeyStore`] built once at startup.
#[derive(Debug, Default)]
pub struct StaticKeyStore {
    entries: HashMap<String, Arc<KeyEntry>>,
}

impl StaticKeyStore {
    /// Builds the store, rejecting duplicate identities.
    pub fn new(entries: Vec<KeyEntry>) -> Result<Self, KeyStoreError> {
        let mut map = HashMap::with_capacity(entries.len());
        for entry in entries {
            let identity = entry.identity.clone();
            if map.insert(identity.clone(), Arc::new(entry)).is_some() {
                return Err(KeyStoreError::DuplicateIdentity(identity));
            }
        }
        Ok(Self { entries: map })
    }
}

impl KeyStore for StaticKeyStore {
    fn lookup(&self, identity: &str) -> Option<Arc<KeyEntry>> {
        self.entries.get(identity).cloned()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_entries() {
        assert!(matches!(
            KeyEntry::new(String::new(), vec![0; 16], 1),
            Err(KeyStoreError::InvalidIdentity(0))
        ));
        assert!(matches!(
            KeyEntry::new("a".repeat(129), vec![0; 16], 1),
            Err(KeyStoreError::InvalidIdentity(129))
        ));
        assert!(matches!(
            KeyEntry::new("TEST".to_owned(), vec![0; 15], 1),
            Err(KeyStoreError::InvalidKeyLength(15))
        ));
        assert!(KeyEntry::new("TEST".to_owned(), vec![0; 16], 1).is_ok());
        assert!(KeyEntry::new("TEST".to_owned(), vec![0; 32], 1).is_ok());
    }

    #[test]
    fn lookup_and_duplicates() {
        let store = StaticKeyStore::new(vec![
            KeyEntry::new("TEST_UICC_001".to_owned(), (0u8..16).collect(), 1).expect("valid"),
        ])
        .expect("builds");
        assert_eq!(store.len(), 1);
        assert!(store.lookup("TEST_UICC_001").is_some());
        assert!(store.lookup("OTHER").is_none());

        let dup = StaticKeyStore::new(vec![
            KeyEntry::new("X".to_owned(), vec![0; 16], 1).expect("valid"),
            KeyEntry::new("X".to_owned(), vec![1; 16], 2).expect("valid"),
        ]);
        assert!(matches!(dup, Err(KeyStoreError::DuplicateIdentity(_))));
    }

    #[test]
    fn debug_redacts_key_bytes() {
        let entry = KeyEntry::new("TEST".to_owned(), vec![0xAB; 16], 1).expect("valid");
        let debug = format!("{entry:?}");
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.to_lowercase().contains("ab, ab"));
    }
}
