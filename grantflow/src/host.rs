//! File-backed simulated host
//!
//! Stands in for a real platform binding. The host state lives in a JSON
//! file so it can be edited by hand while the negotiator is "in settings":
//!
//! ```json
//! {
//!   "gated": true,
//!   "manifest": ["camera", "location"],
//!   "granted": ["camera"],
//!   "rationale": []
//! }
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use grantflow_api::{Capability, CapabilitySet, DialogText, LiveStatus, PromptVerdict, UserChoice};
use grantflow_host::{app_config_dir, HostCapabilities, Interstitial, InterstitialError, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Serialized host state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostState {
    pub gated: bool,
    pub manifest: CapabilitySet,
    pub granted: CapabilitySet,
    /// Capabilities the OS would show a rationale for
    pub rationale: CapabilitySet,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            gated: true,
            manifest: CapabilitySet::new(),
            granted: CapabilitySet::new(),
            rationale: CapabilitySet::new(),
        }
    }
}

impl HostState {
    /// Apply one OS prompt answer
    ///
    /// A first denial makes the rationale showable; denying again while the
    /// rationale is showable is "don't ask again" and clears it.
    pub fn apply_verdict(&mut self, capability: &Capability, verdict: PromptVerdict) {
        match verdict {
            PromptVerdict::Granted => {
                self.rationale.remove(capability);
                self.granted.insert(capability.clone());
            }
            PromptVerdict::Denied => {
                self.granted.remove(capability);
                if !self.rationale.remove(capability) {
                    self.rationale.insert(capability.clone());
                }
            }
        }
    }
}

/// Host whose live state is read from and written back to a JSON file
#[derive(Debug)]
pub struct SimulatedHost {
    path: PathBuf,
    state: RwLock<HostState>,
}

impl SimulatedHost {
    /// Open the host state file; a missing file is an empty, gated host
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = read_state(&path)?;
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Default location: `~/.config/<app>/host_state.json`
    pub fn default_path(app_name: &str) -> PathBuf {
        app_config_dir(app_name).join("host_state.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file, picking up edits made out of band
    pub fn reload(&self) -> Result<()> {
        let state = read_state(&self.path)?;
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }

    /// Apply prompt answers and persist them
    pub fn record_verdicts(&self, verdicts: &BTreeMap<Capability, PromptVerdict>) -> Result<()> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        for (capability, verdict) in verdicts {
            state.apply_verdict(capability, *verdict);
        }
        write_state(&self.path, &state)
    }
}

fn read_state(path: &Path) -> Result<HostState> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .with_context(|| format!("invalid host state in {}", path.display())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(HostState::default()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn write_state(path: &Path, state: &HostState) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(state)?;
    fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))
}

impl HostCapabilities for SimulatedHost {
    fn manifest(&self) -> Result<CapabilitySet, RegistryError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.manifest.is_empty() {
            return Err(RegistryError::ManifestUnreadable(format!(
                "no capabilities declared in {}",
                self.path.display()
            )));
        }
        Ok(state.manifest.clone())
    }

    fn check(&self, capability: &Capability) -> LiveStatus {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.granted.contains(capability) {
            LiveStatus::Granted
        } else {
            LiveStatus::NotGranted
        }
    }

    fn should_show_rationale(&self, capability: &Capability) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .rationale
            .contains(capability)
    }

    fn is_gated(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .gated
    }
}

/// Interstitial that keeps the simulated host in step with the user's answers
pub struct SimulatedInterstitial {
    inner: Arc<dyn Interstitial>,
    host: Arc<SimulatedHost>,
}

impl SimulatedInterstitial {
    pub fn new(inner: Arc<dyn Interstitial>, host: Arc<SimulatedHost>) -> Self {
        Self { inner, host }
    }
}

#[async_trait]
impl Interstitial for SimulatedInterstitial {
    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    async fn show_rationale(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        self.inner.show_rationale(dialog, capabilities).await
    }

    async fn show_settings_prompt(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        self.inner.show_settings_prompt(dialog, capabilities).await
    }

    async fn open_settings(&self) -> Result<(), InterstitialError> {
        tracing::info!(state = %self.host.path().display(), "Edit the host state file to change grants");
        self.inner.open_settings().await?;
        self.host
            .reload()
            .map_err(|e| InterstitialError::Unavailable(format!("{:#}", e)))
    }

    async fn prompt_for_capabilities(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<BTreeMap<Capability, PromptVerdict>, InterstitialError> {
        let verdicts = self.inner.prompt_for_capabilities(capabilities).await?;
        if let Err(e) = self.host.record_verdicts(&verdicts) {
            tracing::warn!(error = %format!("{:#}", e), "Failed to persist prompt answers");
        }
        Ok(verdicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantflow_host::ScriptedInterstitial;

    fn caps(ids: &[&str]) -> CapabilitySet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_missing_file_is_empty_gated_host() {
        let dir = tempfile::tempdir().unwrap();
        let host = SimulatedHost::open(dir.path().join("host_state.json")).unwrap();

        assert!(host.is_gated());
        assert!(matches!(
            host.manifest(),
            Err(RegistryError::ManifestUnreadable(_))
        ));
    }

    #[test]
    fn test_reads_partial_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_state.json");
        fs::write(&path, r#"{"manifest": ["camera", "location"], "granted": ["camera"]}"#).unwrap();

        let host = SimulatedHost::open(&path).unwrap();
        assert_eq!(host.manifest().unwrap(), caps(&["camera", "location"]));
        assert_eq!(host.check(&"camera".into()), LiveStatus::Granted);
        assert_eq!(host.check(&"location".into()), LiveStatus::NotGranted);
        assert!(host.is_gated());
    }

    #[test]
    fn test_invalid_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_state.json");
        fs::write(&path, "not json").unwrap();

        assert!(SimulatedHost::open(&path).is_err());
    }

    #[test]
    fn test_repeated_denial_clears_rationale() {
        let mut state = HostState::default();
        let location = Capability::new("location");

        state.apply_verdict(&location, PromptVerdict::Denied);
        assert!(state.rationale.contains(&location));

        state.apply_verdict(&location, PromptVerdict::Denied);
        assert!(!state.rationale.contains(&location));
        assert!(!state.granted.contains(&location));
    }

    #[tokio::test]
    async fn test_prompt_answers_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_state.json");
        let host = Arc::new(SimulatedHost::open(&path).unwrap());
        let interstitial = SimulatedInterstitial::new(
            Arc::new(ScriptedInterstitial::accepting().with_verdict("location", PromptVerdict::Denied)),
            host.clone(),
        );

        interstitial
            .prompt_for_capabilities(&caps(&["camera", "location"]))
            .await
            .unwrap();

        let reopened = SimulatedHost::open(&path).unwrap();
        assert_eq!(reopened.check(&"camera".into()), LiveStatus::Granted);
        assert_eq!(reopened.check(&"location".into()), LiveStatus::NotGranted);
        assert!(reopened.should_show_rationale(&"location".into()));
        assert!(!reopened.should_show_rationale(&"camera".into()));
    }

    #[tokio::test]
    async fn test_settings_picks_up_external_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_state.json");
        let host = Arc::new(SimulatedHost::open(&path).unwrap());
        let edited = path.clone();
        let interstitial = SimulatedInterstitial::new(
            Arc::new(ScriptedInterstitial::accepting().on_settings(move || {
                fs::write(&edited, r#"{"manifest": ["storage"], "granted": ["storage"]}"#).unwrap();
            })),
            host.clone(),
        );

        interstitial.open_settings().await.unwrap();

        assert_eq!(host.check(&"storage".into()), LiveStatus::Granted);
    }
}
