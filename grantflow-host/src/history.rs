//! Durable request history
//!
//! One boolean per capability identifier: "this capability has been put in
//! front of the OS prompt at least once". The flag is what separates a
//! first-time request from an inferred "don't ask again" denial, so it must
//! survive process restarts. Flags are only ever set, never cleared.

use crate::presets::app_config_dir;
use grantflow_api::Capability;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Error type for history store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access history store: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse history store: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Trait for the per-capability request history
///
/// Writes are idempotent and commutative across capabilities, so
/// implementations need no ordering guarantees between keys.
pub trait HistoryStore: Send + Sync {
    /// Whether the capability was previously put in front of the OS prompt
    fn was_requested(&self, capability: &Capability) -> Result<bool, StoreError>;

    /// Record that the capability was put in front of the OS prompt
    fn mark_requested(&self, capability: &Capability) -> Result<(), StoreError>;

    /// All capabilities recorded as requested
    fn list(&self) -> Result<Vec<Capability>, StoreError>;
}

// ============================================================================
// File-based History Store
// ============================================================================

/// Persistent file data structure; keys are raw capability identifiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HistoryFileData {
    version: u32,
    requested: BTreeMap<String, bool>,
}

impl HistoryFileData {
    fn new() -> Self {
        Self {
            version: 1,
            requested: BTreeMap::new(),
        }
    }
}

/// File-based history store
///
/// Default location: `~/.config/<app>/capability_history.json`
pub struct FileHistoryStore {
    path: PathBuf,
    data: RwLock<HistoryFileData>,
}

impl FileHistoryStore {
    /// Open (or lazily create) a store at the specified path
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            serde_json::from_reader(reader)?
        } else {
            HistoryFileData::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Create a store in the default location for an application
    pub fn default_for_app(app_name: &str) -> Result<Self, StoreError> {
        Self::new(app_config_dir(app_name).join("capability_history.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &HistoryFileData) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, data)?;
        Ok(())
    }
}

impl HistoryStore for FileHistoryStore {
    fn was_requested(&self, capability: &Capability) -> Result<bool, StoreError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .requested
            .get(capability.as_str())
            .copied()
            .unwrap_or(false))
    }

    fn mark_requested(&self, capability: &Capability) -> Result<(), StoreError> {
        let mut data = self.data.write().unwrap_or_else(PoisonError::into_inner);
        if data.requested.get(capability.as_str()) == Some(&true) {
            return Ok(());
        }

        // Only commit in memory what made it to disk
        let mut updated = data.clone();
        updated.requested.insert(capability.as_str().to_string(), true);
        self.save(&updated)?;
        *data = updated;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Capability>, StoreError> {
        let data = self.data.read().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .requested
            .iter()
            .filter(|(_, requested)| **requested)
            .map(|(id, _)| Capability::new(id.as_str()))
            .collect())
    }
}

impl std::fmt::Debug for FileHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHistoryStore")
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// In-Memory History Store
// ============================================================================

/// In-memory history store for testing or hosts without durable storage
#[derive(Default)]
pub struct MemoryHistoryStore {
    requested: RwLock<BTreeMap<Capability, bool>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store with capabilities already recorded as requested
    pub fn with_requested<I, C>(capabilities: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        Self {
            requested: RwLock::new(
                capabilities
                    .into_iter()
                    .map(|c| (c.into(), true))
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.requested
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn was_requested(&self, capability: &Capability) -> Result<bool, StoreError> {
        let requested = self.requested.read().unwrap_or_else(PoisonError::into_inner);
        Ok(requested.get(capability).copied().unwrap_or(false))
    }

    fn mark_requested(&self, capability: &Capability) -> Result<(), StoreError> {
        let mut requested = self
            .requested
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        requested.insert(capability.clone(), true);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Capability>, StoreError> {
        let requested = self.requested.read().unwrap_or_else(PoisonError::into_inner);
        Ok(requested
            .iter()
            .filter(|(_, flag)| **flag)
            .map(|(c, _)| c.clone())
            .collect())
    }
}

impl std::fmt::Debug for MemoryHistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHistoryStore")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = MemoryHistoryStore::new();
        let camera = Capability::new("camera");

        assert!(!store.was_requested(&camera).unwrap());

        store.mark_requested(&camera).unwrap();
        store.mark_requested(&camera).unwrap();

        assert!(store.was_requested(&camera).unwrap());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_preloaded() {
        let store = MemoryHistoryStore::with_requested(["location"]);
        assert!(store.was_requested(&Capability::new("location")).unwrap());
        assert!(!store.was_requested(&Capability::new("camera")).unwrap());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capability_history.json");

        let store = FileHistoryStore::new(&path).unwrap();
        store
            .mark_requested(&Capability::new("android.permission.CAMERA"))
            .unwrap();

        assert!(path.exists());

        let reopened = FileHistoryStore::new(&path).unwrap();
        assert!(reopened
            .was_requested(&Capability::new("android.permission.CAMERA"))
            .unwrap());
        assert_eq!(
            reopened.list().unwrap(),
            vec![Capability::new("android.permission.CAMERA")]
        );
    }

    #[test]
    fn test_file_store_keys_are_raw_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capability_history.json");

        let store = FileHistoryStore::new(&path).unwrap();
        store.mark_requested(&Capability::new("location")).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["requested"]["location"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_failed_write_leaves_flag_unset() {
        let dir = tempfile::tempdir().unwrap();
        // A directory at the store path makes every write fail
        let path = dir.path().join("capability_history.json");
        std::fs::create_dir(&path).unwrap();
        let store = FileHistoryStore {
            path: path.clone(),
            data: RwLock::new(HistoryFileData::new()),
        };
        let camera = Capability::new("camera");

        assert!(matches!(store.mark_requested(&camera), Err(StoreError::Io(_))));
        assert!(!store.was_requested(&camera).unwrap());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capability_history.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            FileHistoryStore::new(&path),
            Err(StoreError::Parse(_))
        ));
    }
}
