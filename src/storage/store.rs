//! Key-value persistence
//!
//! Values are JSON text. [`FileStore`] keeps one file per key; [`MemoryStore`]
//! keeps everything in a map. Writes are last-writer-wins.

use crate::{Result, VoxError};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// Read and deserialize a key; a corrupt value reads as absent
pub fn get_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    let Some(raw) = store.get(key)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Discarding unreadable value for '{}': {}", key, e);
            Ok(None)
        }
    }
}

pub fn set_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

/// In-process store, shared by clones
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

const EXTENSION: &str = "json";

/// One `<encoded key>.json` file per key under a directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            VoxError::StorageError(format!("cannot create {}: {}", dir.display(), e))
        })?;
        debug!("File store at {}", dir.display());
        Ok(Self { dir })
    }

    /// `dirs::data_dir()/voxchat`
    pub fn default_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|dir| dir.join("voxchat"))
            .ok_or_else(|| VoxError::StorageError("Could not determine data directory".into()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), EXTENSION))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(VoxError::StorageError(format!("read '{}': {}", key, e))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, value)
            .and_then(|_| fs::rename(&tmp, &path))
            .map_err(|e| VoxError::StorageError(format!("write '{}': {}", key, e)))
    }

    fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VoxError::StorageError(format!("remove '{}': {}", key, e))),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| VoxError::StorageError(format!("list {}: {}", self.dir.display(), e)))?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// Percent-encode everything outside `[A-Za-z0-9_-]` so keys like
/// `draft:<id>` are valid file names
fn encode_key(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

fn decode_key(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            decoded.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding() {
        let key = "draft:3f2a-b.c";
        let encoded = encode_key(key);
        assert!(!encoded.contains(':'));
        assert!(!encoded.contains('.'));
        assert_eq!(decode_key(&encoded).as_deref(), Some(key));
        assert_eq!(decode_key("bad%Z"), None);
    }

    #[test]
    fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.get("settings").unwrap(), None);
        store.set("settings", "{\"a\":1}").unwrap();
        store.set("draft:abc", "\"hi\"").unwrap();
        assert_eq!(store.get("settings").unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(store.keys().unwrap(), vec!["draft:abc", "settings"]);

        store.remove("draft:abc").unwrap();
        store.remove("draft:abc").unwrap();
        assert_eq!(store.keys().unwrap(), vec!["settings"]);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        FileStore::open(dir.path())
            .unwrap()
            .set("conversations", "{}")
            .unwrap();

        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get("conversations").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn test_corrupt_json_reads_as_absent() {
        let store = MemoryStore::new();
        store.set("settings", "{not json").unwrap();
        let value: Option<serde_json::Value> = get_json(&store, "settings").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_memory_store_is_shared_by_clones() {
        let store = MemoryStore::new();
        let clone = store.clone();
        set_json(&clone, "active-conversation", "abc").unwrap();
        let active: Option<String> = get_json(&store, "active-conversation").unwrap();
        assert_eq!(active.as_deref(), Some("abc"));
    }
}
