#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use patlab_kernel_contracts::storage_keys::LocalStorageKey;
use patlab_kernel_contracts::ContractViolation;
use serde::{Deserialize, Serialize};

const LOCAL_STORE_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, thiserror::Error)]
pub enum LocalStorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported local storage schema version {0}")]
    UnsupportedSchema(u8),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
}

/// String key-value store that survives page reloads.
pub trait LocalStorage {
    fn get_item(&self, key: LocalStorageKey) -> Result<Option<String>, LocalStorageError>;
    fn set_item(&mut self, key: LocalStorageKey, value: &str) -> Result<(), LocalStorageError>;
    fn remove_item(&mut self, key: LocalStorageKey) -> Result<(), LocalStorageError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLocalStorage {
    entries: BTreeMap<LocalStorageKey, String>,
}

impl MemoryLocalStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items<'a>(items: impl IntoIterator<Item = (LocalStorageKey, &'a str)>) -> Self {
        Self {
            entries: items
                .into_iter()
                .map(|(k, v)| (k, v.to_string()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl LocalStorage for MemoryLocalStorage {
    fn get_item(&self, key: LocalStorageKey) -> Result<Option<String>, LocalStorageError> {
        Ok(self.entries.get(&key).cloned())
    }

    fn set_item(&mut self, key: LocalStorageKey, value: &str) -> Result<(), LocalStorageError> {
        self.entries.insert(key, value.to_string());
        Ok(())
    }

    fn remove_item(&mut self, key: LocalStorageKey) -> Result<(), LocalStorageError> {
        self.entries.remove(&key);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct LocalStoreDocument {
    schema_version: u8,
    entries: BTreeMap<String, String>,
    updated_at_unix_ms: u64,
}

/// JSON-file store for running the client pipeline outside a browser.
#[derive(Debug, Clone)]
pub struct FileLocalStorage {
    path: PathBuf,
}

impl FileLocalStorage {
    pub fn default_local() -> Self {
        let path = env::var("PATLAB_LOCAL_STORAGE_PATH")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_local_store_path);
        Self::for_path(path)
    }

    pub fn for_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drops every stored key.
    pub fn clear(&mut self) -> Result<(), LocalStorageError> {
        self.write_document(&LocalStoreDocument::default())
    }

    fn read_document(&self) -> Result<Option<LocalStoreDocument>, LocalStorageError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(Some(LocalStoreDocument::default()));
        }
        let doc = serde_json::from_str::<LocalStoreDocument>(&raw)?;
        if doc.schema_version != LOCAL_STORE_SCHEMA_VERSION {
            return Err(LocalStorageError::UnsupportedSchema(doc.schema_version));
        }
        Ok(Some(doc))
    }

    fn write_document(&self, doc: &LocalStoreDocument) -> Result<(), LocalStorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut doc = doc.clone();
        doc.schema_version = LOCAL_STORE_SCHEMA_VERSION;
        doc.updated_at_unix_ms = now_unix_ms();
        let serialized = serde_json::to_vec_pretty(&doc)?;
        atomic_write(&self.path, &serialized)?;
        Ok(())
    }
}

impl LocalStorage for FileLocalStorage {
    fn get_item(&self, key: LocalStorageKey) -> Result<Option<String>, LocalStorageError> {
        let Some(doc) = self.read_document()? else {
            return Ok(None);
        };
        Ok(doc.entries.get(key.as_str()).cloned())
    }

    fn set_item(&mut self, key: LocalStorageKey, value: &str) -> Result<(), LocalStorageError> {
        let mut doc = self.read_document()?.unwrap_or_default();
        doc.entries
            .insert(key.as_str().to_string(), value.to_string());
        self.write_document(&doc)
    }

    fn remove_item(&mut self, key: LocalStorageKey) -> Result<(), LocalStorageError> {
        let Some(mut doc) = self.read_document()? else {
            return Ok(());
        };
        if doc.entries.remove(key.as_str()).is_some() {
            self.write_document(&doc)?;
        }
        Ok(())
    }
}

fn default_local_store_path() -> PathBuf {
    if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg_config_home)
            .join("patlab")
            .join("local_storage.json");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("patlab")
            .join("local_storage.json");
    }
    PathBuf::from(".patlab").join("local_storage.json")
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
        .max(1)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), LocalStorageError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
