//! Key-store adapters.
//!
//! The core consumes any [`KeyStore`](cardlink_types::keystore::KeyStore);
//! this module provides the JSON file adapter used by the example binary
//! and test benches. The file is an array of entries:
//!
//! ```json
//! [{ "identity": "TEST_UICC_001", "key_hex": "000102…0f", "key_version": 1 }]
//! ```

use std::path::Path;

use cardlink_types::keystore::{KeyEntry, StaticKeyStore};
use eyre::Context as _;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct KeyFileEntry {
    identity: String,
    key_hex: String,
    #[serde(default = "default_key_version")]
    key_version: u8,
}

fn default_key_version() -> u8 {
    1
}

/// Parses the JSON key file format.
pub fn parse_keystore(json: &str) -> eyre::Result<StaticKeyStore> {
    let entries: Vec<KeyFileEntry> =
        serde_json::from_str(json).context("while parsing key file")?;
    let entries = entries
        .into_iter()
        .map(|entry| {
            let key = hex::decode(&entry.key_hex)
                .with_context(|| format!("key of {} is not hex", entry.identity))?;
            KeyEntry::new(entry.identity.clone(), key, entry.key_version)
                .with_context(|| format!("invalid entry {}", entry.identity))
        })
        .collect::<eyre::Result<Vec<_>>>()?;
    StaticKeyStore::new(entries).context("while building keystore")
}

/// Loads a [`StaticKeyStore`] from a JSON file.
pub fn load_keystore_file(path: &Path) -> eyre::Result<StaticKeyStore> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("while reading key file {}", path.display()))?;
    parse_keystore(&json)
}
