//! Negotiation sessions
//!
//! A [`Negotiator`] is bound to one host surface. Each call to
//! [`Negotiator::negotiate`] runs one session through
//!
//! ```text
//! Idle → Classifying → { DirectPrompt | Rationale | SettingsEscalation } → Resolving → Idle
//! ```
//!
//! and hands the final partition to the caller's [`OutcomeReporter`].
//!
//! Only one session may hold the surface at a time; a second request fails
//! fast with `ConcurrentSessionRejected`. Only one kind of interruption is
//! shown per session, most severe first (settings, then rationale, then the
//! direct prompt). Capabilities needing a less severe interruption are
//! reported denied and listed in `deferred`; the caller asks again later.

use grantflow_api::{
    CapabilitySet, DialogConfig, PromptVerdict, SessionPhase, SessionSnapshot, SNAPSHOT_VERSION,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::audit::{self, AuditEvent, AuditEventType, AuditSink};
use crate::error::NegotiationError;
use crate::interstitial::Interstitial;
use crate::policy::{Classification, ClassifyContext, DecisionPolicy};
use crate::presets::NegotiatorConfig;
use crate::registry::{CapabilityRegistry, HostCapabilities};
use crate::reporter::{NegotiationOutcome, OutcomeReporter};
use crate::suspension::SuspensionStore;

/// A capability set submitted together with its dialog configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationRequest {
    pub capabilities: CapabilitySet,
    pub dialog: DialogConfig,
}

impl NegotiationRequest {
    pub fn new(capabilities: CapabilitySet) -> Self {
        Self {
            capabilities,
            dialog: DialogConfig::default(),
        }
    }

    pub fn with_dialog(mut self, dialog: DialogConfig) -> Self {
        self.dialog = dialog;
        self
    }
}

impl<C: Into<grantflow_api::Capability>> FromIterator<C> for NegotiationRequest {
    fn from_iter<I: IntoIterator<Item = C>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

// ============================================================================
// Host surface slot
// ============================================================================

/// The one-session-at-a-time slot of a host surface
#[derive(Debug, Default)]
struct HostSurface {
    phase: Mutex<SessionPhase>,
    next_session: AtomicU64,
}

impl HostSurface {
    fn phase(&self) -> SessionPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive hold on the surface; dropping it returns the surface to Idle
struct SurfaceGuard {
    surface: Arc<HostSurface>,
    audit: Arc<dyn AuditSink>,
    session: u64,
    finished: bool,
}

impl SurfaceGuard {
    fn enter(&self, next: SessionPhase) {
        let mut phase = self
            .surface
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(session = self.session, from = %*phase, to = %next, "Phase transition");
        *phase = next;
    }

    /// Release the surface after a session reached Resolving
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for SurfaceGuard {
    fn drop(&mut self) {
        let mut phase = self
            .surface
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.finished {
            tracing::info!(session = self.session, phase = %*phase, "Negotiation abandoned");
            if let Err(e) = self
                .audit
                .record(audit::negotiation_abandoned(self.session, *phase))
            {
                tracing::warn!(error = %e, "Failed to record audit event");
            }
        }
        *phase = SessionPhase::Idle;
    }
}

// ============================================================================
// Classification buckets
// ============================================================================

#[derive(Debug, Default)]
struct Buckets {
    silent: CapabilitySet,
    rationale: CapabilitySet,
    direct: CapabilitySet,
    blocked: CapabilitySet,
}

/// The single interruption a session will show
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    None,
    Settings,
    Rationale,
    Direct,
}

impl Buckets {
    fn interruption(&self) -> Interruption {
        if !self.blocked.is_empty() {
            Interruption::Settings
        } else if !self.rationale.is_empty() {
            Interruption::Rationale
        } else if !self.direct.is_empty() {
            Interruption::Direct
        } else {
            Interruption::None
        }
    }
}

// ============================================================================
// Negotiator
// ============================================================================

/// Negotiation engine bound to one host surface
///
/// Cloning is cheap and clones share the surface, so a clone cannot be used
/// to run a second session concurrently.
#[derive(Clone)]
pub struct Negotiator {
    registry: CapabilityRegistry,
    policy: Arc<dyn DecisionPolicy>,
    interstitial: Arc<dyn Interstitial>,
    suspension: Arc<dyn SuspensionStore>,
    audit: Arc<dyn AuditSink>,
    surface: Arc<HostSurface>,
}

impl Negotiator {
    pub fn new(host: Arc<dyn HostCapabilities>, config: NegotiatorConfig) -> Self {
        Self {
            registry: CapabilityRegistry::new(host, config.history),
            policy: config.policy,
            interstitial: config.interstitial,
            suspension: config.suspension,
            audit: config.audit,
            surface: Arc::new(HostSurface::default()),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Phase of the active session, `Idle` if none
    pub fn phase(&self) -> SessionPhase {
        self.surface.phase()
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != SessionPhase::Idle
    }

    /// Whether a session suspended in the settings surface awaits [`resume`](Self::resume)
    pub fn has_pending_resume(&self) -> bool {
        self.suspension.has_pending()
    }

    /// Run one negotiation session to completion and report its outcome
    ///
    /// The reporter fires exactly once, unless this future is dropped before
    /// the session resolves (host teardown), in which case it never fires.
    pub async fn negotiate(&self, request: NegotiationRequest, reporter: OutcomeReporter) {
        match self.claim() {
            Ok(guard) => self.run(guard, request, reporter).await,
            Err((session, error)) => self.reject(session, &request.capabilities, error, reporter),
        }
    }

    /// Negotiate every capability declared in the host manifest
    pub async fn negotiate_manifest(&self, dialog: DialogConfig, reporter: OutcomeReporter) {
        match self.registry.manifest_capabilities() {
            Ok(manifest) => {
                self.negotiate(NegotiationRequest::new(manifest).with_dialog(dialog), reporter)
                    .await
            }
            Err(e) => {
                let session = self.next_session();
                self.reject(session, &CapabilitySet::new(), e.into(), reporter);
            }
        }
    }

    /// Spawn a session on the current tokio runtime
    ///
    /// The surface is claimed before this returns. Returns `None` if the
    /// request was rejected; the reporter has then already fired with the
    /// error.
    pub fn start(&self, request: NegotiationRequest, reporter: OutcomeReporter) -> Option<SessionHandle> {
        match self.claim() {
            Ok(guard) => {
                let session = guard.session;
                let negotiator = self.clone();
                let task = tokio::spawn(async move {
                    negotiator.run(guard, request, reporter).await;
                });
                Some(SessionHandle { session, task })
            }
            Err((session, error)) => {
                self.reject(session, &request.capabilities, error, reporter);
                None
            }
        }
    }

    /// Resume a session that was suspended in the settings surface, e.g.
    /// after the application was recreated
    ///
    /// Returns `false` without touching the reporter if no snapshot is
    /// pending.
    pub async fn resume(&self, reporter: OutcomeReporter) -> bool {
        if !self.suspension.has_pending() {
            return false;
        }

        let guard = match self.claim() {
            Ok(guard) => guard,
            Err((session, error)) => {
                self.reject(session, &CapabilitySet::new(), error, reporter);
                return true;
            }
        };

        let snapshot = match self.suspension.take() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                guard.finish();
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session snapshot");
                guard.finish();
                return false;
            }
        };

        let session = guard.session;
        tracing::info!(
            session,
            escalated = snapshot.escalated.len(),
            "Resuming negotiation after settings surface"
        );
        self.record(audit::negotiation_started(session, &snapshot.requested));
        guard.enter(SessionPhase::SettingsEscalation);

        let outcome = self
            .finish_escalation(&guard, snapshot)
            .instrument(tracing::info_span!("negotiation", session))
            .await;
        guard.finish();
        reporter.report(outcome);
        true
    }

    async fn run(&self, guard: SurfaceGuard, request: NegotiationRequest, reporter: OutcomeReporter) {
        let session = guard.session;
        let outcome = self
            .drive(&guard, request)
            .instrument(tracing::info_span!("negotiation", session))
            .await;
        // Free the surface first so the reporter may start the next session
        guard.finish();
        reporter.report(outcome);
    }

    fn next_session(&self) -> u64 {
        self.surface.next_session.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn claim(&self) -> Result<SurfaceGuard, (u64, NegotiationError)> {
        let session = self.next_session();
        let mut phase = self
            .surface
            .phase
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *phase != SessionPhase::Idle {
            return Err((session, NegotiationError::ConcurrentSessionRejected));
        }
        *phase = SessionPhase::Classifying;
        Ok(SurfaceGuard {
            surface: self.surface.clone(),
            audit: self.audit.clone(),
            session,
            finished: false,
        })
    }

    fn reject(
        &self,
        session: u64,
        requested: &CapabilitySet,
        error: NegotiationError,
        reporter: OutcomeReporter,
    ) {
        tracing::warn!(session, error = %error, "Negotiation rejected");
        self.record(audit::negotiation_rejected(session, error.kind()));
        reporter.report(NegotiationOutcome::failed(requested, error));
    }

    fn record(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(event) {
            tracing::warn!(error = %e, "Failed to record audit event");
        }
    }

    // ------------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------------

    async fn drive(&self, guard: &SurfaceGuard, request: NegotiationRequest) -> NegotiationOutcome {
        let NegotiationRequest {
            capabilities: requested,
            dialog,
        } = request;
        let session = guard.session;

        tracing::info!(session, capabilities = %requested.joined(), "Negotiation started");
        self.record(audit::negotiation_started(session, &requested));

        if requested.is_empty() {
            return self.resolve(guard, NegotiationOutcome::failed(&requested, NegotiationError::EmptyRequest));
        }

        let manifest = match self.registry.manifest_capabilities() {
            Ok(manifest) => manifest,
            Err(e) => return self.resolve(guard, NegotiationOutcome::failed(&requested, e.into())),
        };
        let undeclared = requested.difference(&manifest);
        if !undeclared.is_empty() {
            return self.resolve(
                guard,
                NegotiationOutcome::failed(&requested, NegotiationError::CapabilityNotDeclared(undeclared)),
            );
        }

        let buckets = self.classify_all(session, &requested, &dialog);

        match buckets.interruption() {
            Interruption::None => {
                let outcome = NegotiationOutcome::resolved(
                    buckets.silent,
                    CapabilitySet::new(),
                    CapabilitySet::new(),
                );
                self.resolve(guard, outcome)
            }
            Interruption::Settings => self.escalate(guard, &requested, &dialog, buckets).await,
            Interruption::Rationale => self.justify(guard, &requested, &dialog, buckets).await,
            Interruption::Direct => {
                guard.enter(SessionPhase::DirectPrompt);
                if !self.interstitial.is_available() {
                    return self.surface_unavailable(guard, &requested, &buckets.silent, "cannot mount prompt");
                }
                self.prompt(guard, buckets.silent, buckets.direct).await
            }
        }
    }

    fn classify_all(&self, session: u64, requested: &CapabilitySet, dialog: &DialogConfig) -> Buckets {
        let gated = self.registry.is_gated();
        let mut buckets = Buckets::default();

        for capability in requested {
            let ctx = ClassifyContext {
                capability,
                live_status: self.registry.current_status(capability),
                rationale_showable: self.registry.rationale_showable(capability),
                previously_requested: self.registry.was_previously_requested(capability),
                gated,
            };
            let classification = self.policy.classify(&ctx);
            tracing::debug!(session, capability = %capability, ?classification, "Classified");
            self.record(audit::capability_classified(session, capability, classification));

            let bucket = match classification {
                Classification::SilentGrant => &mut buckets.silent,
                Classification::NeedsRationale if dialog.skip_rationale.contains(capability) => {
                    &mut buckets.direct
                }
                Classification::NeedsRationale => &mut buckets.rationale,
                Classification::NeedsDirectPrompt => &mut buckets.direct,
                Classification::PermanentlyBlocked => &mut buckets.blocked,
            };
            bucket.insert(capability.clone());
        }

        buckets
    }

    /// SettingsEscalation: offer the settings surface for blocked capabilities
    async fn escalate(
        &self,
        guard: &SurfaceGuard,
        requested: &CapabilitySet,
        dialog: &DialogConfig,
        buckets: Buckets,
    ) -> NegotiationOutcome {
        guard.enter(SessionPhase::SettingsEscalation);
        if !self.interstitial.is_available() {
            return self.surface_unavailable(guard, requested, &buckets.silent, "cannot mount settings dialog");
        }

        let deferred = buckets.rationale.union(&buckets.direct);
        if !deferred.is_empty() {
            tracing::debug!(
                session = guard.session,
                deferred = %deferred.joined(),
                "Deferring capabilities to a later session"
            );
        }

        let choice = match self
            .interstitial
            .show_settings_prompt(&dialog.settings, &buckets.blocked)
            .await
        {
            Ok(choice) => choice,
            Err(e) => return self.surface_unavailable(guard, requested, &buckets.silent, &e.to_string()),
        };
        self.record(audit::dialog_answered(
            guard.session,
            AuditEventType::SettingsPromptAnswered,
            choice,
            &buckets.blocked,
        ));

        if !choice.is_accepted() {
            let denied = deferred.union(&buckets.blocked);
            return self.resolve(guard, NegotiationOutcome::resolved(buckets.silent, denied, deferred));
        }

        let snapshot = SessionSnapshot {
            version: SNAPSHOT_VERSION,
            requested: requested.clone(),
            dialog: dialog.clone(),
            phase: SessionPhase::SettingsEscalation,
            granted: buckets.silent.clone(),
            denied: deferred.clone(),
            deferred,
            escalated: buckets.blocked,
        };
        // Without a snapshot a teardown in settings would lose the session
        if let Err(e) = self.suspension.save(&snapshot) {
            let reason = format!("failed to persist session snapshot: {}", e);
            return self.surface_unavailable(guard, requested, &snapshot.granted, &reason);
        }

        self.record(audit::AuditEvent::new(
            AuditEventType::SettingsOpened,
            guard.session,
            audit::AuditDetails::Lifecycle {
                phase: SessionPhase::SettingsEscalation,
            },
        ));
        tracing::info!(session = guard.session, "Handing off to host settings surface");
        let returned = self.interstitial.open_settings().await;

        // Control is back in this session; the snapshot is no longer needed
        if let Err(e) = self.suspension.take() {
            tracing::warn!(session = guard.session, error = %e, "Failed to discard session snapshot");
        }
        if let Err(e) = returned {
            return self.surface_unavailable(guard, requested, &snapshot.granted, &e.to_string());
        }

        self.finish_escalation(guard, snapshot).await
    }

    /// Re-query exactly the escalated capabilities after the settings surface returns
    async fn finish_escalation(&self, guard: &SurfaceGuard, snapshot: SessionSnapshot) -> NegotiationOutcome {
        let SessionSnapshot {
            mut granted,
            mut denied,
            deferred,
            escalated,
            ..
        } = snapshot;

        for capability in &escalated {
            if self.registry.current_status(capability).is_granted() {
                granted.insert(capability.clone());
            } else {
                denied.insert(capability.clone());
            }
        }

        self.resolve(guard, NegotiationOutcome::resolved(granted, denied, deferred))
    }

    /// Rationale: justify, then prompt for everything outstanding
    async fn justify(
        &self,
        guard: &SurfaceGuard,
        requested: &CapabilitySet,
        dialog: &DialogConfig,
        buckets: Buckets,
    ) -> NegotiationOutcome {
        guard.enter(SessionPhase::Rationale);
        if !self.interstitial.is_available() {
            return self.surface_unavailable(guard, requested, &buckets.silent, "cannot mount rationale dialog");
        }

        let choice = match self
            .interstitial
            .show_rationale(&dialog.rationale, &buckets.rationale)
            .await
        {
            Ok(choice) => choice,
            Err(e) => return self.surface_unavailable(guard, requested, &buckets.silent, &e.to_string()),
        };
        self.record(audit::dialog_answered(
            guard.session,
            AuditEventType::RationaleAnswered,
            choice,
            &buckets.rationale,
        ));

        let outstanding = buckets.rationale.union(&buckets.direct);
        if !choice.is_accepted() {
            // Declined before the OS prompt: nothing is marked requested
            return self.resolve(
                guard,
                NegotiationOutcome::resolved(buckets.silent, outstanding, CapabilitySet::new()),
            );
        }

        self.prompt(guard, buckets.silent, outstanding).await
    }

    /// DirectPrompt: one OS prompt; results are taken as-is, no reclassification
    async fn prompt(
        &self,
        guard: &SurfaceGuard,
        mut granted: CapabilitySet,
        prompted: CapabilitySet,
    ) -> NegotiationOutcome {
        guard.enter(SessionPhase::DirectPrompt);
        self.record(audit::capabilities_prompted(guard.session, &prompted));

        let verdicts = match self.interstitial.prompt_for_capabilities(&prompted).await {
            Ok(verdicts) => verdicts,
            Err(e) => {
                let requested = granted.union(&prompted);
                return self.surface_unavailable(guard, &requested, &granted, &e.to_string());
            }
        };

        let mut denied = CapabilitySet::new();
        for capability in &prompted {
            if let Err(e) = self.registry.mark_requested(capability) {
                tracing::warn!(
                    session = guard.session,
                    capability = %capability,
                    error = %e,
                    "Failed to persist request history"
                );
            }
            match verdicts.get(capability) {
                Some(PromptVerdict::Granted) => granted.insert(capability.clone()),
                _ => denied.insert(capability.clone()),
            };
        }

        self.resolve(guard, NegotiationOutcome::resolved(granted, denied, CapabilitySet::new()))
    }

    fn surface_unavailable(
        &self,
        guard: &SurfaceGuard,
        requested: &CapabilitySet,
        granted: &CapabilitySet,
        reason: &str,
    ) -> NegotiationOutcome {
        tracing::warn!(session = guard.session, reason, "Host surface unavailable");
        let outcome = NegotiationOutcome::partial(
            granted.clone(),
            requested.difference(granted),
            NegotiationError::HostSurfaceUnavailable(reason.to_string()),
        );
        self.resolve(guard, outcome)
    }

    /// Resolving: audit the final partition and hand it back for reporting
    fn resolve(&self, guard: &SurfaceGuard, outcome: NegotiationOutcome) -> NegotiationOutcome {
        guard.enter(SessionPhase::Resolving);
        let session = guard.session;

        for capability in &outcome.granted {
            self.record(audit::capability_granted(session, capability));
        }
        for capability in &outcome.denied {
            let reason = if outcome.deferred.contains(capability) {
                "deferred"
            } else {
                "not granted"
            };
            self.record(audit::capability_denied(session, capability, reason));
        }
        self.record(audit::negotiation_resolved(
            session,
            outcome.granted.len(),
            outcome.denied.len(),
            outcome.deferred.len(),
            outcome.error.as_ref().map(ToString::to_string),
        ));

        tracing::info!(
            session,
            granted = %outcome.granted.joined(),
            denied = %outcome.denied.joined(),
            all_granted = outcome.all_granted,
            "Negotiation resolved"
        );
        outcome
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("gated", &self.registry.is_gated())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Session handle
// ============================================================================

/// Handle to a session spawned with [`Negotiator::start`]
#[derive(Debug)]
pub struct SessionHandle {
    session: u64,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.session
    }

    /// Abandon the session from whatever phase it is suspended in
    ///
    /// The surface returns to Idle and the reporter never fires.
    pub fn abort(&self) {
        tracing::info!(session = self.session, "Aborting negotiation");
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the session has reported or been torn down
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::history::MemoryHistoryStore;
    use crate::interstitial::ScriptedInterstitial;
    use crate::registry::MemoryHost;
    use crate::suspension::MemorySuspensionStore;
    use crate::DefaultDecisionPolicy;

    fn negotiator(host: MemoryHost) -> Negotiator {
        let config = NegotiatorConfig {
            history: Arc::new(MemoryHistoryStore::new()),
            policy: Arc::new(DefaultDecisionPolicy),
            interstitial: Arc::new(ScriptedInterstitial::accepting()),
            suspension: Arc::new(MemorySuspensionStore::new()),
            audit: Arc::new(MemoryAuditSink::new()),
        };
        Negotiator::new(Arc::new(host), config)
    }

    #[test]
    fn test_buckets_pick_most_severe_interruption() {
        let mut buckets = Buckets::default();
        assert_eq!(buckets.interruption(), Interruption::None);

        buckets.direct.insert("camera");
        assert_eq!(buckets.interruption(), Interruption::Direct);

        buckets.rationale.insert("location");
        assert_eq!(buckets.interruption(), Interruption::Rationale);

        buckets.blocked.insert("storage");
        assert_eq!(buckets.interruption(), Interruption::Settings);
    }

    #[test]
    fn test_classify_all_honors_skip_rationale() {
        let host = MemoryHost::new(["camera", "location"]);
        host.allow_rationale("camera");
        host.allow_rationale("location");
        let negotiator = negotiator(host);

        let requested: CapabilitySet = ["camera", "location"].into_iter().collect();
        let dialog = DialogConfig::new().skip_rationale_for("camera");
        let buckets = negotiator.classify_all(1, &requested, &dialog);

        assert!(buckets.direct.contains(&"camera".into()));
        assert!(buckets.rationale.contains(&"location".into()));
    }

    #[test]
    fn test_claim_is_exclusive_and_released_on_drop() {
        let negotiator = negotiator(MemoryHost::new(["camera"]));

        let guard = negotiator.claim().ok().unwrap();
        assert_eq!(negotiator.phase(), SessionPhase::Classifying);
        assert!(matches!(
            negotiator.claim(),
            Err((_, NegotiationError::ConcurrentSessionRejected))
        ));

        guard.finish();
        assert_eq!(negotiator.phase(), SessionPhase::Idle);
        assert!(negotiator.claim().is_ok());
    }

    #[test]
    fn test_session_ids_increase() {
        let negotiator = negotiator(MemoryHost::new(["camera"]));
        let first = negotiator.next_session();
        let second = negotiator.next_session();
        assert!(second > first);
    }
}
