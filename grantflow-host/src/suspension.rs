//! Suspension snapshots
//!
//! While the user is away in the host settings surface the application may be
//! torn down and recreated. Before handing off, the session persists a
//! [`SessionSnapshot`] here; after the hand-off returns (in this process or a
//! recreated one) the snapshot is taken back and the session resumes.

use crate::presets::app_config_dir;
use grantflow_api::{SessionSnapshot, SnapshotError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Error type for suspension store operations
#[derive(Debug, Error)]
pub enum SuspensionError {
    #[error("Failed to access suspension store: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Trait for persisting the one pending snapshot of a host surface
pub trait SuspensionStore: Send + Sync {
    /// Persist the snapshot, replacing any previous one
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SuspensionError>;

    /// Remove and return the pending snapshot, if any
    fn take(&self) -> Result<Option<SessionSnapshot>, SuspensionError>;

    /// Whether a snapshot is pending
    fn has_pending(&self) -> bool;
}

// ============================================================================
// In-Memory Suspension Store
// ============================================================================

/// Keeps the snapshot in memory; survives suspension but not process death
#[derive(Debug, Default)]
pub struct MemorySuspensionStore {
    pending: Mutex<Option<SessionSnapshot>>,
}

impl MemorySuspensionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SuspensionStore for MemorySuspensionStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SuspensionError> {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());
        Ok(())
    }

    fn take(&self) -> Result<Option<SessionSnapshot>, SuspensionError> {
        Ok(self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take())
    }

    fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

// ============================================================================
// File-based Suspension Store
// ============================================================================

/// Stores the snapshot as MessagePack in a file
///
/// Default location: `~/.config/<app>/pending_session.msgpack`
#[derive(Debug)]
pub struct FileSuspensionStore {
    path: PathBuf,
}

impl FileSuspensionStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create a store in the default location for an application
    pub fn default_for_app(app_name: &str) -> Self {
        Self::new(app_config_dir(app_name).join("pending_session.msgpack"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SuspensionStore for FileSuspensionStore {
    fn save(&self, snapshot: &SessionSnapshot) -> Result<(), SuspensionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, snapshot.to_bytes()?)?;
        Ok(())
    }

    fn take(&self) -> Result<Option<SessionSnapshot>, SuspensionError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&self.path)?;
        Ok(Some(SessionSnapshot::from_bytes(&bytes)?))
    }

    fn has_pending(&self) -> bool {
        self.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantflow_api::{CapabilitySet, DialogConfig, SessionPhase, SNAPSHOT_VERSION};

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            requested: ["storage", "camera"].into_iter().collect(),
            dialog: DialogConfig::new().with_settings("Storage is off", "", ""),
            phase: SessionPhase::SettingsEscalation,
            granted: CapabilitySet::new(),
            denied: ["camera"].into_iter().collect(),
            deferred: ["camera"].into_iter().collect(),
            escalated: ["storage"].into_iter().collect(),
        }
    }

    #[test]
    fn test_memory_store_take_clears() {
        let store = MemorySuspensionStore::new();
        store.save(&snapshot()).unwrap();

        assert!(store.has_pending());
        assert_eq!(store.take().unwrap(), Some(snapshot()));
        assert!(!store.has_pending());
        assert_eq!(store.take().unwrap(), None);
    }

    #[test]
    fn test_file_store_restores_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app").join("pending_session.msgpack");

        FileSuspensionStore::new(&path).save(&snapshot()).unwrap();

        let reopened = FileSuspensionStore::new(&path);
        assert!(reopened.has_pending());
        assert_eq!(reopened.take().unwrap(), Some(snapshot()));
        assert!(!path.exists());
    }

    #[test]
    fn test_file_store_without_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSuspensionStore::new(dir.path().join("missing.msgpack"));

        assert!(!store.has_pending());
        assert_eq!(store.take().unwrap(), None);
    }

    #[test]
    fn test_file_store_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pending_session.msgpack");
        std::fs::write(&path, b"\xc1garbage").unwrap();

        let store = FileSuspensionStore::new(&path);
        assert!(matches!(store.take(), Err(SuspensionError::Snapshot(_))));
    }
}
