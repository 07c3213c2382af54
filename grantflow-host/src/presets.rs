//! Pre-configured negotiator setups for common use cases
//!
//! Provides ready-to-use configurations that hosts can use directly or as
//! starting points for customization.

use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::{AuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
use crate::history::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
use crate::interstitial::{HeadlessInterstitial, Interstitial, ScriptedInterstitial, TerminalInterstitial};
use crate::policy::{DecisionPolicy, DefaultDecisionPolicy};
use crate::suspension::{FileSuspensionStore, MemorySuspensionStore, SuspensionStore};

/// Everything a [`Negotiator`](crate::Negotiator) needs besides the host itself
pub struct NegotiatorConfig {
    /// Request history ("first time") storage
    pub history: Arc<dyn HistoryStore>,
    /// Classification policy
    pub policy: Arc<dyn DecisionPolicy>,
    /// Dialogs and OS prompt
    pub interstitial: Arc<dyn Interstitial>,
    /// Snapshot storage for the settings hand-off
    pub suspension: Arc<dyn SuspensionStore>,
    /// Audit sink
    pub audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for NegotiatorConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatorConfig")
            .field("interactive", &self.interstitial.is_available())
            .finish_non_exhaustive()
    }
}

/// Builder for negotiator configurations
#[derive(Default)]
pub struct NegotiatorConfigBuilder {
    history: Option<Arc<dyn HistoryStore>>,
    policy: Option<Arc<dyn DecisionPolicy>>,
    interstitial: Option<Arc<dyn Interstitial>>,
    suspension: Option<Arc<dyn SuspensionStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    app_name: Option<String>,
}

impl NegotiatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name (used for default paths)
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    pub fn history(mut self, history: impl HistoryStore + 'static) -> Self {
        self.history = Some(Arc::new(history));
        self
    }

    pub fn policy(mut self, policy: impl DecisionPolicy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    pub fn interstitial(mut self, interstitial: impl Interstitial + 'static) -> Self {
        self.interstitial = Some(Arc::new(interstitial));
        self
    }

    pub fn suspension(mut self, suspension: impl SuspensionStore + 'static) -> Self {
        self.suspension = Some(Arc::new(suspension));
        self
    }

    pub fn audit(mut self, audit: impl AuditSink + 'static) -> Self {
        self.audit = Some(Arc::new(audit));
        self
    }

    /// Build the configuration
    ///
    /// Unset stores default to files under the application's config
    /// directory; the interstitial defaults to the terminal.
    pub fn build(self) -> Result<NegotiatorConfig, PresetError> {
        let app_name = self.app_name.as_deref().unwrap_or("grantflow");

        let history: Arc<dyn HistoryStore> = match self.history {
            Some(h) => h,
            None => {
                let store = FileHistoryStore::default_for_app(app_name)
                    .map_err(|e| PresetError::HistoryInit(e.to_string()))?;
                Arc::new(store)
            }
        };

        Ok(NegotiatorConfig {
            history,
            policy: self
                .policy
                .unwrap_or_else(|| Arc::new(DefaultDecisionPolicy)),
            interstitial: self
                .interstitial
                .unwrap_or_else(|| Arc::new(TerminalInterstitial::new())),
            suspension: self
                .suspension
                .unwrap_or_else(|| Arc::new(FileSuspensionStore::default_for_app(app_name))),
            audit: self.audit.unwrap_or_else(|| Arc::new(NullAuditSink)),
        })
    }
}

/// Error type for preset initialization
#[derive(Debug, thiserror::Error)]
pub enum PresetError {
    #[error("Failed to initialize history store: {0}")]
    HistoryInit(String),

    #[error("Failed to initialize audit: {0}")]
    AuditInit(String),
}

// ============================================================================
// Preset Configurations
// ============================================================================

/// Preset configurations for common use cases
pub struct NegotiatorPresets;

impl NegotiatorPresets {
    /// Interactive terminal mode
    ///
    /// - Default decision policy
    /// - File-based history and snapshot storage
    /// - Terminal dialogs
    /// - File-based audit log
    pub fn interactive(app_name: &str) -> Result<NegotiatorConfig, PresetError> {
        let config_dir = app_config_dir(app_name);

        let history = FileHistoryStore::new(config_dir.join("capability_history.json"))
            .map_err(|e| PresetError::HistoryInit(e.to_string()))?;

        let audit = FileAuditSink::new(config_dir.join("audit.jsonl"))
            .map_err(|e| PresetError::AuditInit(e.to_string()))?;

        Ok(NegotiatorConfig {
            history: Arc::new(history),
            policy: Arc::new(DefaultDecisionPolicy),
            interstitial: Arc::new(TerminalInterstitial::new()),
            suspension: Arc::new(FileSuspensionStore::new(
                config_dir.join("pending_session.msgpack"),
            )),
            audit: Arc::new(audit),
        })
    }

    /// Headless mode for services and CI
    ///
    /// Silent grants still resolve; anything that needs a dialog fails with
    /// `HostSurfaceUnavailable`.
    pub fn headless(app_name: &str) -> Result<NegotiatorConfig, PresetError> {
        let config_dir = app_config_dir(app_name);

        let history = FileHistoryStore::new(config_dir.join("capability_history.json"))
            .map_err(|e| PresetError::HistoryInit(e.to_string()))?;

        let audit = FileAuditSink::new(config_dir.join("audit.jsonl"))
            .map_err(|e| PresetError::AuditInit(e.to_string()))?;

        Ok(NegotiatorConfig {
            history: Arc::new(history),
            policy: Arc::new(DefaultDecisionPolicy),
            interstitial: Arc::new(HeadlessInterstitial),
            suspension: Arc::new(MemorySuspensionStore::new()),
            audit: Arc::new(audit),
        })
    }

    /// Testing mode (in-memory, no persistence)
    ///
    /// - Default decision policy
    /// - In-memory history and snapshots
    /// - Scripted interstitial that accepts every dialog and grants every prompt
    /// - Memory-based audit
    pub fn testing() -> NegotiatorConfig {
        NegotiatorConfig {
            history: Arc::new(MemoryHistoryStore::new()),
            policy: Arc::new(DefaultDecisionPolicy),
            interstitial: Arc::new(ScriptedInterstitial::accepting()),
            suspension: Arc::new(MemorySuspensionStore::new()),
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }
}

/// Per-application directory for every file the negotiator keeps:
/// `~/.config/<app>/`
pub fn app_config_dir(app_name: &str) -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join(app_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::NoInferencePolicy;

    #[test]
    fn test_builder() {
        let config = NegotiatorConfigBuilder::new()
            .app_name("test-app")
            .history(MemoryHistoryStore::new())
            .policy(NoInferencePolicy)
            .interstitial(HeadlessInterstitial)
            .suspension(MemorySuspensionStore::new())
            .audit(NullAuditSink)
            .build()
            .unwrap();

        assert!(!config.interstitial.is_available());
        assert!(!config.suspension.has_pending());
    }

    #[test]
    fn test_testing_preset() {
        let config = NegotiatorPresets::testing();
        assert!(config.interstitial.is_available());
        assert!(config.audit.flush().is_ok());
    }

    #[test]
    fn test_app_config_dir_is_per_app() {
        let dir = app_config_dir("test-app");
        assert!(dir.ends_with("test-app"));
        assert_ne!(dir, app_config_dir("other-app"));
    }

    #[test]
    fn test_config_debug_hides_components() {
        let config = NegotiatorPresets::testing();
        let debug = format!("{:?}", config);
        assert!(debug.starts_with("NegotiatorConfig"));
    }
}
