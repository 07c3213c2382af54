//! grantflow-api: Shared types for the grantflow negotiation engine
//!
//! This crate defines the contract between callers, the negotiation engine and
//! host bindings. Session snapshots use MessagePack serialization.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Snapshot format version for compatibility checking
pub const SNAPSHOT_VERSION: u32 = 1;

/// An OS-mediated access right identified by the host's own string name
/// (e.g. `android.permission.CAMERA` or just `camera`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Capability {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for Capability {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A set of unique capabilities. Ordering is irrelevant to callers; the set is
/// kept sorted so that hashes, logs and snapshots are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Create an empty set
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Add a capability, returning `true` if it was not already present
    pub fn insert(&mut self, capability: impl Into<Capability>) -> bool {
        self.0.insert(capability.into())
    }

    /// Builder-style insert
    pub fn with(mut self, capability: impl Into<Capability>) -> Self {
        self.insert(capability);
        self
    }

    pub fn remove(&mut self, capability: &Capability) -> bool {
        self.0.remove(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Check whether every member of `self` is also in `other`
    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Check whether the two sets share no member
    pub fn is_disjoint(&self, other: &CapabilitySet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    /// Members of `self` that are not in `other`
    pub fn difference(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.difference(&other.0).cloned().collect())
    }

    /// Members of either set
    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Stable content hash, used where logging the full list would be noisy
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for capability in &self.0 {
            hasher.update(capability.as_str().as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().as_str()[..16].to_string()
    }

    /// Comma separated identifiers for display
    pub fn joined(&self) -> String {
        self.0
            .iter()
            .map(Capability::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl<C: Into<Capability>> FromIterator<C> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl IntoIterator for CapabilitySet {
    type Item = Capability;
    type IntoIter = std::collections::btree_set::IntoIter<Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::collections::btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Live status of a single capability as reported by the host OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveStatus {
    Granted,
    NotGranted,
}

impl LiveStatus {
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Per-capability tri-state derived from live status and request history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    /// Currently granted
    Granted,
    /// Not granted, but the user may be shown a rationale and asked again
    DeniedSoft,
    /// Denied permanently; only a settings visit can change it
    DeniedHard,
}

/// Per-capability answer of the OS-level prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVerdict {
    Granted,
    Denied,
}

/// The user's answer to a rationale or settings dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserChoice {
    Accept,
    Decline,
}

impl UserChoice {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Message and button labels of one dialog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogText {
    pub message: String,
    pub positive: String,
    pub negative: String,
}

impl DialogText {
    pub fn new(
        message: impl Into<String>,
        positive: impl Into<String>,
        negative: impl Into<String>,
    ) -> Self {
        Self {
            message: message.into(),
            positive: positive.into(),
            negative: negative.into(),
        }
    }

    /// Replace each field whose new value is non-empty; empty values keep the current text
    fn overlay(&mut self, message: &str, positive: &str, negative: &str) {
        if !message.is_empty() {
            self.message = message.to_string();
        }
        if !positive.is_empty() {
            self.positive = positive.to_string();
        }
        if !negative.is_empty() {
            self.negative = negative.to_string();
        }
    }
}

/// Caller supplied text for the rationale and settings-escalation dialogs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogConfig {
    /// Justification shown before re-asking a soft-denied capability
    pub rationale: DialogText,

    /// Shown before sending the user to the host settings surface
    pub settings: DialogText,

    /// Capabilities that go straight to the OS prompt even when a rationale is showable
    #[serde(default)]
    pub skip_rationale: CapabilitySet,
}

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            rationale: DialogText::new(
                "This app needs permission to work without any problems.",
                "Yes, Grant Permission",
                "No, Deny It",
            ),
            settings: DialogText::new(
                "You have denied some permissions. Allow all permissions at [Settings] > [Permissions]",
                "Go to Settings",
                "No, Deny It",
            ),
            skip_rationale: CapabilitySet::new(),
        }
    }
}

impl DialogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set only the rationale message
    pub fn with_rationale_message(mut self, message: &str) -> Self {
        self.rationale.overlay(message, "", "");
        self
    }

    /// Set the rationale dialog; empty strings keep the defaults
    pub fn with_rationale(mut self, message: &str, positive: &str, negative: &str) -> Self {
        self.rationale.overlay(message, positive, negative);
        self
    }

    /// Set the settings dialog; empty strings keep the defaults
    pub fn with_settings(mut self, message: &str, positive: &str, negative: &str) -> Self {
        self.settings.overlay(message, positive, negative);
        self
    }

    /// Never show the rationale dialog for this capability
    pub fn skip_rationale_for(mut self, capability: impl Into<Capability>) -> Self {
        self.skip_rationale.insert(capability);
        self
    }
}

/// Phase marker of a negotiation session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    Classifying,
    DirectPrompt,
    Rationale,
    SettingsEscalation,
    Resolving,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Classifying => "classifying",
            Self::DirectPrompt => "direct_prompt",
            Self::Rationale => "rationale",
            Self::SettingsEscalation => "settings_escalation",
            Self::Resolving => "resolving",
        };
        f.write_str(name)
    }
}

/// Error type for snapshot encoding
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Failed to encode session snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Failed to decode session snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Unsupported snapshot version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

/// Session state persisted across the settings-surface suspension boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Snapshot format version
    pub version: u32,

    /// The full capability request
    pub requested: CapabilitySet,

    /// Dialog configuration, restored verbatim
    pub dialog: DialogConfig,

    /// Phase the session was suspended in
    pub phase: SessionPhase,

    /// Capabilities already resolved as granted
    pub granted: CapabilitySet,

    /// Capabilities already resolved as denied
    pub denied: CapabilitySet,

    /// Capabilities deferred to a later session (subset of `denied`)
    #[serde(default)]
    pub deferred: CapabilitySet,

    /// Capabilities whose live status must be re-queried on return
    pub escalated: CapabilitySet,
}

impl SessionSnapshot {
    /// Encode as MessagePack
    pub fn to_bytes(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from MessagePack, rejecting unknown versions
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let snapshot: SessionSnapshot = rmp_serde::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_set_is_deduplicated_and_sorted() {
        let set: CapabilitySet = ["location", "camera", "location"].into_iter().collect();

        assert_eq!(set.len(), 2);
        assert_eq!(set.joined(), "camera, location");
    }

    #[test]
    fn test_capability_set_hash_ignores_insertion_order() {
        let a: CapabilitySet = ["camera", "storage"].into_iter().collect();
        let b = CapabilitySet::new().with("storage").with("camera");
        let c = CapabilitySet::new().with("camera");

        assert_eq!(a.compute_hash(), b.compute_hash());
        assert_ne!(a.compute_hash(), c.compute_hash());
    }

    #[test]
    fn test_capability_set_algebra() {
        let all: CapabilitySet = ["camera", "location", "storage"].into_iter().collect();
        let some: CapabilitySet = ["camera"].into_iter().collect();

        let rest = all.difference(&some);
        assert!(rest.is_disjoint(&some));
        assert_eq!(rest.union(&some), all);
        assert!(some.is_subset_of(&all));
    }

    #[test]
    fn test_dialog_config_defaults() {
        let config = DialogConfig::default();
        assert_eq!(config.rationale.positive, "Yes, Grant Permission");
        assert_eq!(config.settings.positive, "Go to Settings");
        assert!(config.skip_rationale.is_empty());
    }

    #[test]
    fn test_dialog_config_empty_strings_keep_defaults() {
        let config = DialogConfig::new()
            .with_rationale("We need the camera to scan receipts.", "", "Not now")
            .with_settings("", "Open Settings", "");

        assert_eq!(config.rationale.message, "We need the camera to scan receipts.");
        assert_eq!(config.rationale.positive, "Yes, Grant Permission");
        assert_eq!(config.rationale.negative, "Not now");
        assert_eq!(config.settings.positive, "Open Settings");
        assert_eq!(config.settings.negative, "No, Deny It");
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION,
            requested: ["camera", "storage"].into_iter().collect(),
            dialog: DialogConfig::new().with_settings("Enable storage", "", ""),
            phase: SessionPhase::SettingsEscalation,
            granted: CapabilitySet::new(),
            denied: ["camera"].into_iter().collect(),
            deferred: ["camera"].into_iter().collect(),
            escalated: ["storage"].into_iter().collect(),
        };

        let bytes = snapshot.to_bytes().unwrap();
        let decoded = SessionSnapshot::from_bytes(&bytes).unwrap();

        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_snapshot_rejects_unknown_version() {
        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION + 1,
            requested: CapabilitySet::new(),
            dialog: DialogConfig::default(),
            phase: SessionPhase::SettingsEscalation,
            granted: CapabilitySet::new(),
            denied: CapabilitySet::new(),
            deferred: CapabilitySet::new(),
            escalated: CapabilitySet::new(),
        };
        let bytes = rmp_serde::to_vec_named(&snapshot).unwrap();

        assert!(matches!(
            SessionSnapshot::from_bytes(&bytes),
            Err(SnapshotError::Version { .. })
        ));
    }
}
