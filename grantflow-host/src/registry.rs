//! Capability registry
//!
//! Stateless queries into the host's declared-capability manifest and its
//! live grant status, plus the durable request history. The only write is
//! [`CapabilityRegistry::mark_requested`].

use grantflow_api::{Capability, CapabilitySet, GrantStatus, LiveStatus};
use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::RegistryError;
use crate::history::{HistoryStore, StoreError};

/// Live capability queries answered by the host OS
///
/// Host bindings implement this trait. All methods are expected to be cheap,
/// synchronous reads.
pub trait HostCapabilities: Send + Sync {
    /// Capabilities declared in the host manifest
    fn manifest(&self) -> Result<CapabilitySet, RegistryError>;

    /// Live grant status; unknown capabilities report `NotGranted`
    fn check(&self, capability: &Capability) -> LiveStatus;

    /// Whether the OS would show a rationale for this capability, i.e. the
    /// user denied it once but not permanently
    fn should_show_rationale(&self, capability: &Capability) -> bool;

    /// Whether the platform gates capabilities behind runtime approval.
    /// Platforms predating the gating OS version grant everything implicitly.
    fn is_gated(&self) -> bool {
        true
    }
}

/// Registry contract over a host binding and a durable history store
#[derive(Clone)]
pub struct CapabilityRegistry {
    host: Arc<dyn HostCapabilities>,
    history: Arc<dyn HistoryStore>,
}

impl CapabilityRegistry {
    pub fn new(host: Arc<dyn HostCapabilities>, history: Arc<dyn HistoryStore>) -> Self {
        Self { host, history }
    }

    /// Declared capabilities
    pub fn manifest_capabilities(&self) -> Result<CapabilitySet, RegistryError> {
        self.host.manifest()
    }

    /// Live status; always granted below the gating OS version
    pub fn current_status(&self, capability: &Capability) -> LiveStatus {
        if !self.host.is_gated() {
            return LiveStatus::Granted;
        }
        self.host.check(capability)
    }

    /// Whether a rationale can be shown; never below the gating OS version
    pub fn rationale_showable(&self, capability: &Capability) -> bool {
        self.host.is_gated() && self.host.should_show_rationale(capability)
    }

    pub fn is_gated(&self) -> bool {
        self.host.is_gated()
    }

    /// Whether the capability was put in front of the OS prompt before.
    ///
    /// An unreadable store reads as "never requested", which can only turn an
    /// inferred permanent block into a direct prompt.
    pub fn was_previously_requested(&self, capability: &Capability) -> bool {
        match self.history.was_requested(capability) {
            Ok(requested) => requested,
            Err(e) => {
                tracing::warn!(capability = %capability, error = %e, "History store unreadable");
                false
            }
        }
    }

    /// Durably record that the capability was put in front of the OS prompt
    pub fn mark_requested(&self, capability: &Capability) -> Result<(), StoreError> {
        self.history.mark_requested(capability)
    }

    /// Tri-state status combining live status, rationale and history
    pub fn grant_status(&self, capability: &Capability) -> GrantStatus {
        if self.current_status(capability).is_granted() {
            GrantStatus::Granted
        } else if self.rationale_showable(capability)
            || !self.was_previously_requested(capability)
        {
            GrantStatus::DeniedSoft
        } else {
            GrantStatus::DeniedHard
        }
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("gated", &self.host.is_gated())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// In-Memory Host
// ============================================================================

#[derive(Debug, Default)]
struct MemoryHostState {
    manifest: Option<CapabilitySet>,
    granted: BTreeSet<Capability>,
    rationale: BTreeSet<Capability>,
    gated: bool,
}

/// In-memory host binding for testing and embedding
///
/// Grants can be changed at any time, e.g. from a settings-surface callback.
#[derive(Debug)]
pub struct MemoryHost {
    state: RwLock<MemoryHostState>,
}

impl MemoryHost {
    /// Create a gated host declaring the given capabilities, none granted
    pub fn new<I, C>(manifest: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        Self {
            state: RwLock::new(MemoryHostState {
                manifest: Some(manifest.into_iter().collect()),
                gated: true,
                ..Default::default()
            }),
        }
    }

    /// Create a host whose manifest cannot be read
    pub fn without_manifest() -> Self {
        Self {
            state: RwLock::new(MemoryHostState {
                manifest: None,
                gated: true,
                ..Default::default()
            }),
        }
    }

    /// Simulate a platform predating capability gating
    pub fn ungated(self) -> Self {
        self.write().gated = false;
        self
    }

    pub fn grant(&self, capability: impl Into<Capability>) {
        let capability = capability.into();
        let mut state = self.write();
        state.rationale.remove(&capability);
        state.granted.insert(capability);
    }

    /// Mark the capability as soft-denied (rationale showable)
    pub fn allow_rationale(&self, capability: impl Into<Capability>) {
        self.write().rationale.insert(capability.into());
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryHostState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryHostState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HostCapabilities for MemoryHost {
    fn manifest(&self) -> Result<CapabilitySet, RegistryError> {
        self.read()
            .manifest
            .clone()
            .ok_or_else(|| RegistryError::ManifestUnreadable("no manifest installed".into()))
    }

    fn check(&self, capability: &Capability) -> LiveStatus {
        if self.read().granted.contains(capability) {
            LiveStatus::Granted
        } else {
            LiveStatus::NotGranted
        }
    }

    fn should_show_rationale(&self, capability: &Capability) -> bool {
        self.read().rationale.contains(capability)
    }

    fn is_gated(&self) -> bool {
        self.read().gated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryHistoryStore;

    fn registry(host: MemoryHost, history: MemoryHistoryStore) -> CapabilityRegistry {
        CapabilityRegistry::new(Arc::new(host), Arc::new(history))
    }

    #[test]
    fn test_manifest_unavailable() {
        let registry = registry(MemoryHost::without_manifest(), MemoryHistoryStore::new());
        assert!(matches!(
            registry.manifest_capabilities(),
            Err(RegistryError::ManifestUnreadable(_))
        ));
    }

    #[test]
    fn test_unknown_capability_is_not_granted() {
        let registry = registry(MemoryHost::new(["camera"]), MemoryHistoryStore::new());
        assert_eq!(
            registry.current_status(&Capability::new("telepathy")),
            LiveStatus::NotGranted
        );
    }

    #[test]
    fn test_ungated_platform_grants_everything() {
        let host = MemoryHost::new(["camera"]).ungated();
        host.allow_rationale("camera");
        let registry = registry(host, MemoryHistoryStore::new());

        let camera = Capability::new("camera");
        assert_eq!(registry.current_status(&camera), LiveStatus::Granted);
        assert!(!registry.rationale_showable(&camera));
    }

    #[test]
    fn test_grant_status_tri_state() {
        let host = MemoryHost::new(["camera", "location", "storage"]);
        host.grant("camera");
        host.allow_rationale("location");
        let history = MemoryHistoryStore::with_requested(["location", "storage"]);
        let registry = registry(host, history);

        assert_eq!(
            registry.grant_status(&Capability::new("camera")),
            GrantStatus::Granted
        );
        assert_eq!(
            registry.grant_status(&Capability::new("location")),
            GrantStatus::DeniedSoft
        );
        assert_eq!(
            registry.grant_status(&Capability::new("storage")),
            GrantStatus::DeniedHard
        );
    }

    #[test]
    fn test_mark_requested_is_durable_in_history() {
        let registry = registry(MemoryHost::new(["camera"]), MemoryHistoryStore::new());
        let camera = Capability::new("camera");

        assert!(!registry.was_previously_requested(&camera));
        registry.mark_requested(&camera).unwrap();
        assert!(registry.was_previously_requested(&camera));
    }
}
