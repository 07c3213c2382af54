//! Interstitial provider: the host UI seam
//!
//! The negotiation session never renders anything itself. Rationale dialogs,
//! settings dialogs, the settings surface and the OS-level prompt are all
//! reached through the [`Interstitial`] trait, which host bindings implement.

use async_trait::async_trait;
use grantflow_api::{Capability, CapabilitySet, DialogText, PromptVerdict, UserChoice};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

/// Error type for interstitial operations
#[derive(Debug, Error)]
pub enum InterstitialError {
    #[error("Interstitial cannot be mounted: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Trait for host-rendered prompts
///
/// Every method suspends the calling session, not the thread, until the user
/// answers. No timeout is applied; the user may take arbitrarily long.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use grantflow_api::{Capability, CapabilitySet, DialogText, PromptVerdict, UserChoice};
/// use grantflow_host::interstitial::{Interstitial, InterstitialError};
/// use std::collections::BTreeMap;
///
/// struct AlwaysYes;
///
/// #[async_trait]
/// impl Interstitial for AlwaysYes {
///     fn is_available(&self) -> bool {
///         true
///     }
///
///     async fn show_rationale(
///         &self,
///         _dialog: &DialogText,
///         _capabilities: &CapabilitySet,
///     ) -> Result<UserChoice, InterstitialError> {
///         Ok(UserChoice::Accept)
///     }
///
///     async fn show_settings_prompt(
///         &self,
///         _dialog: &DialogText,
///         _capabilities: &CapabilitySet,
///     ) -> Result<UserChoice, InterstitialError> {
///         Ok(UserChoice::Accept)
///     }
///
///     async fn open_settings(&self) -> Result<(), InterstitialError> {
///         Ok(())
///     }
///
///     async fn prompt_for_capabilities(
///         &self,
///         capabilities: &CapabilitySet,
///     ) -> Result<BTreeMap<Capability, PromptVerdict>, InterstitialError> {
///         Ok(capabilities
///             .iter()
///             .map(|c| (c.clone(), PromptVerdict::Granted))
///             .collect())
///     }
/// }
/// ```
#[async_trait]
pub trait Interstitial: Send + Sync {
    /// Whether the host surface can mount prompts right now
    fn is_available(&self) -> bool;

    /// Show the justification dialog
    async fn show_rationale(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError>;

    /// Show the dialog offering a trip to the settings surface
    async fn show_settings_prompt(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError>;

    /// Hand off to the host settings surface; resolves when control returns
    async fn open_settings(&self) -> Result<(), InterstitialError>;

    /// Issue the OS-level multi-capability prompt. Capabilities missing from
    /// the returned map are treated as denied.
    async fn prompt_for_capabilities(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<BTreeMap<Capability, PromptVerdict>, InterstitialError>;
}

// ============================================================================
// Terminal Interstitial
// ============================================================================

/// Terminal-based interstitial
///
/// Renders dialogs on stdout and reads answers from stdin. The "settings
/// surface" is the user changing grants out of band and pressing Enter.
#[derive(Debug)]
pub struct TerminalInterstitial {
    /// Show the capability list under each dialog
    verbose: bool,
}

impl TerminalInterstitial {
    pub fn new() -> Self {
        Self { verbose: true }
    }

    /// Create a less verbose interstitial
    pub fn minimal() -> Self {
        Self { verbose: false }
    }

    fn format_capabilities(&self, capabilities: &CapabilitySet) -> String {
        capabilities
            .iter()
            .map(|c| format!("  - {}", c))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn ask_dialog(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        {
            let mut stdout = io::stdout();
            writeln!(stdout)?;
            writeln!(stdout, "{}", dialog.message)?;
            if self.verbose {
                writeln!(stdout)?;
                writeln!(stdout, "{}", self.format_capabilities(capabilities))?;
            }
            writeln!(stdout)?;
            write!(
                stdout,
                "[y] {} / [n] {}: ",
                dialog.positive, dialog.negative
            )?;
            stdout.flush()?;
        }

        let input = read_line().await?;
        match input.trim().to_lowercase().as_str() {
            "y" | "yes" => Ok(UserChoice::Accept),
            _ => Ok(UserChoice::Decline),
        }
    }
}

impl Default for TerminalInterstitial {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Interstitial for TerminalInterstitial {
    fn is_available(&self) -> bool {
        atty_check()
    }

    async fn show_rationale(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        if !atty_check() {
            return Err(InterstitialError::Unavailable("not a terminal".into()));
        }
        self.ask_dialog(dialog, capabilities).await
    }

    async fn show_settings_prompt(
        &self,
        dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        if !atty_check() {
            return Err(InterstitialError::Unavailable("not a terminal".into()));
        }
        self.ask_dialog(dialog, capabilities).await
    }

    async fn open_settings(&self) -> Result<(), InterstitialError> {
        {
            let mut stdout = io::stdout();
            writeln!(stdout)?;
            write!(
                stdout,
                "Change the grants in your system settings, then press Enter to return: "
            )?;
            stdout.flush()?;
        }
        read_line().await?;
        Ok(())
    }

    async fn prompt_for_capabilities(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<BTreeMap<Capability, PromptVerdict>, InterstitialError> {
        if !atty_check() {
            return Err(InterstitialError::Unavailable("not a terminal".into()));
        }

        let mut verdicts = BTreeMap::new();
        for capability in capabilities {
            {
                let mut stdout = io::stdout();
                write!(stdout, "Allow access to \"{}\"? [y]es / [n]o: ", capability)?;
                stdout.flush()?;
            }
            let input = read_line().await?;
            let verdict = match input.trim().to_lowercase().as_str() {
                "y" | "yes" => PromptVerdict::Granted,
                _ => PromptVerdict::Denied,
            };
            verdicts.insert(capability.clone(), verdict);
        }
        Ok(verdicts)
    }
}

// ============================================================================
// Headless Interstitial
// ============================================================================

/// Interstitial for environments with no UI surface at all
///
/// Sessions that only need silent grants still succeed; anything that needs
/// the user fails with `HostSurfaceUnavailable`.
#[derive(Debug, Default)]
pub struct HeadlessInterstitial;

#[async_trait]
impl Interstitial for HeadlessInterstitial {
    fn is_available(&self) -> bool {
        false
    }

    async fn show_rationale(
        &self,
        _dialog: &DialogText,
        _capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        Err(InterstitialError::Unavailable("headless".into()))
    }

    async fn show_settings_prompt(
        &self,
        _dialog: &DialogText,
        _capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        Err(InterstitialError::Unavailable("headless".into()))
    }

    async fn open_settings(&self) -> Result<(), InterstitialError> {
        Err(InterstitialError::Unavailable("headless".into()))
    }

    async fn prompt_for_capabilities(
        &self,
        _capabilities: &CapabilitySet,
    ) -> Result<BTreeMap<Capability, PromptVerdict>, InterstitialError> {
        Err(InterstitialError::Unavailable("headless".into()))
    }
}

// ============================================================================
// Scripted Interstitial (for testing)
// ============================================================================

/// One interaction recorded by [`ScriptedInterstitial`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterstitialEvent {
    Rationale(CapabilitySet),
    SettingsPrompt(CapabilitySet),
    SettingsOpened,
    Prompt(CapabilitySet),
}

type SettingsHook = Box<dyn Fn() + Send + Sync>;

/// Interstitial that answers from a script and records every interaction
///
/// An optional gate holds the OS prompt and the settings surface until the
/// test releases it, keeping a session suspended mid-flight.
pub struct ScriptedInterstitial {
    events: Mutex<Vec<InterstitialEvent>>,
    available: bool,
    rationale_choice: UserChoice,
    settings_choice: UserChoice,
    verdicts: BTreeMap<Capability, PromptVerdict>,
    default_verdict: PromptVerdict,
    gate: Option<Arc<Notify>>,
    on_settings: Option<SettingsHook>,
}

impl ScriptedInterstitial {
    /// Accept every dialog and grant every prompt
    pub fn accepting() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            available: true,
            rationale_choice: UserChoice::Accept,
            settings_choice: UserChoice::Accept,
            verdicts: BTreeMap::new(),
            default_verdict: PromptVerdict::Granted,
            gate: None,
            on_settings: None,
        }
    }

    /// Decline every dialog and deny every prompt
    pub fn declining() -> Self {
        Self {
            rationale_choice: UserChoice::Decline,
            settings_choice: UserChoice::Decline,
            default_verdict: PromptVerdict::Denied,
            ..Self::accepting()
        }
    }

    /// Simulate a surface that cannot be mounted
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::accepting()
        }
    }

    pub fn with_rationale_choice(mut self, choice: UserChoice) -> Self {
        self.rationale_choice = choice;
        self
    }

    pub fn with_settings_choice(mut self, choice: UserChoice) -> Self {
        self.settings_choice = choice;
        self
    }

    /// Verdict for prompted capabilities without an explicit one
    pub fn with_default_verdict(mut self, verdict: PromptVerdict) -> Self {
        self.default_verdict = verdict;
        self
    }

    pub fn with_verdict(
        mut self,
        capability: impl Into<Capability>,
        verdict: PromptVerdict,
    ) -> Self {
        self.verdicts.insert(capability.into(), verdict);
        self
    }

    /// Hold prompts and the settings surface until `gate` is notified
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run `hook` while the user is "in" the settings surface
    pub fn on_settings(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_settings = Some(Box::new(hook));
        self
    }

    pub fn events(&self) -> Vec<InterstitialEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded interactions
    pub fn event_count(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn record(&self, event: InterstitialEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    async fn wait_for_gate(&self) {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
    }

    fn ensure_available(&self) -> Result<(), InterstitialError> {
        if self.available {
            Ok(())
        } else {
            Err(InterstitialError::Unavailable("scripted unavailable".into()))
        }
    }
}

#[async_trait]
impl Interstitial for ScriptedInterstitial {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn show_rationale(
        &self,
        _dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        self.ensure_available()?;
        self.record(InterstitialEvent::Rationale(capabilities.clone()));
        Ok(self.rationale_choice)
    }

    async fn show_settings_prompt(
        &self,
        _dialog: &DialogText,
        capabilities: &CapabilitySet,
    ) -> Result<UserChoice, InterstitialError> {
        self.ensure_available()?;
        self.record(InterstitialEvent::SettingsPrompt(capabilities.clone()));
        Ok(self.settings_choice)
    }

    async fn open_settings(&self) -> Result<(), InterstitialError> {
        self.ensure_available()?;
        self.record(InterstitialEvent::SettingsOpened);
        self.wait_for_gate().await;
        if let Some(hook) = &self.on_settings {
            hook();
        }
        Ok(())
    }

    async fn prompt_for_capabilities(
        &self,
        capabilities: &CapabilitySet,
    ) -> Result<BTreeMap<Capability, PromptVerdict>, InterstitialError> {
        self.ensure_available()?;
        self.record(InterstitialEvent::Prompt(capabilities.clone()));
        self.wait_for_gate().await;
        Ok(capabilities
            .iter()
            .map(|c| {
                let verdict = self.verdicts.get(c).copied().unwrap_or(self.default_verdict);
                (c.clone(), verdict)
            })
            .collect())
    }
}

impl std::fmt::Debug for ScriptedInterstitial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedInterstitial")
            .field("available", &self.available)
            .field("rationale_choice", &self.rationale_choice)
            .field("settings_choice", &self.settings_choice)
            .field("events", &self.event_count())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Read one line from stdin without blocking the async runtime
async fn read_line() -> io::Result<String> {
    tokio::task::spawn_blocking(|| {
        let mut input = String::new();
        io::stdin().lock().read_line(&mut input)?;
        Ok::<_, io::Error>(input)
    })
    .await
    .map_err(io::Error::other)?
}

/// Check if stdout is connected to a terminal
fn atty_check() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: isatty is safe to call with any file descriptor
        unsafe { libc::isatty(std::io::stdout().as_raw_fd()) != 0 }
    }

    #[cfg(windows)]
    {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::System::Console::{GetConsoleMode, CONSOLE_MODE};
        let handle = std::io::stdout().as_raw_handle();
        let mut mode: CONSOLE_MODE = 0;
        // SAFETY: GetConsoleMode is safe with valid handle
        unsafe { GetConsoleMode(handle as _, &mut mode) != 0 }
    }

    #[cfg(not(any(unix, windows)))]
    {
        std::env::var("TERM").is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(ids: &[&str]) -> CapabilitySet {
        ids.iter().copied().collect()
    }

    #[tokio::test]
    async fn test_scripted_records_interactions() {
        let ui = ScriptedInterstitial::accepting().with_verdict("camera", PromptVerdict::Denied);
        let dialog = DialogText::new("why", "yes", "no");

        let choice = ui.show_rationale(&dialog, &caps(&["camera"])).await.unwrap();
        assert_eq!(choice, UserChoice::Accept);

        let verdicts = ui
            .prompt_for_capabilities(&caps(&["camera", "location"]))
            .await
            .unwrap();
        assert_eq!(verdicts[&Capability::new("camera")], PromptVerdict::Denied);
        assert_eq!(verdicts[&Capability::new("location")], PromptVerdict::Granted);

        assert_eq!(
            ui.events(),
            vec![
                InterstitialEvent::Rationale(caps(&["camera"])),
                InterstitialEvent::Prompt(caps(&["camera", "location"])),
            ]
        );
    }

    #[tokio::test]
    async fn test_scripted_declining() {
        let ui = ScriptedInterstitial::declining();
        let dialog = DialogText::new("why", "yes", "no");

        let choice = ui
            .show_settings_prompt(&dialog, &caps(&["storage"]))
            .await
            .unwrap();
        assert_eq!(choice, UserChoice::Decline);
    }

    #[tokio::test]
    async fn test_scripted_unavailable_records_nothing() {
        let ui = ScriptedInterstitial::unavailable();

        assert!(!ui.is_available());
        assert!(matches!(
            ui.prompt_for_capabilities(&caps(&["camera"])).await,
            Err(InterstitialError::Unavailable(_))
        ));
        assert_eq!(ui.event_count(), 0);
    }

    #[tokio::test]
    async fn test_settings_hook_runs_on_return() {
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = flag.clone();
        let ui = ScriptedInterstitial::accepting()
            .on_settings(move || seen.store(true, std::sync::atomic::Ordering::SeqCst));

        ui.open_settings().await.unwrap();

        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(ui.events(), vec![InterstitialEvent::SettingsOpened]);
    }

    #[tokio::test]
    async fn test_headless_is_never_available() {
        let ui = HeadlessInterstitial;
        assert!(!ui.is_available());
        assert!(ui.open_settings().await.is_err());
    }

    #[test]
    fn test_format_capabilities() {
        let ui = TerminalInterstitial::new();
        let formatted = ui.format_capabilities(&caps(&["camera", "location"]));

        assert!(formatted.contains("  - camera"));
        assert!(formatted.contains("  - location"));
    }

    #[test]
    fn test_minimal_hides_capability_list() {
        assert!(TerminalInterstitial::new().verbose);
        assert!(!TerminalInterstitial::minimal().verbose);
    }
}
