//! Outcome reporting
//!
//! A session's terminal result is handed to an [`OutcomeReporter`]. The
//! reporter is consumed by [`OutcomeReporter::report`], so a session can
//! fire it at most once; the engine guarantees it fires exactly once for
//! every session that is not torn down or aborted.

use grantflow_api::CapabilitySet;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::NegotiationError;

/// Terminal result of a negotiation session
///
/// Every requested capability appears in exactly one of `granted` and
/// `denied`. Callers must check both the sets and `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NegotiationOutcome {
    pub granted: CapabilitySet,
    pub denied: CapabilitySet,
    /// Denied in this pass only because another interruption was shown
    /// first; a later session may still ask for them (subset of `denied`)
    pub deferred: CapabilitySet,
    /// `true` only if nothing was denied and no error occurred
    pub all_granted: bool,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<NegotiationError>,
}

impl NegotiationOutcome {
    /// Build an outcome from a finished partition
    pub fn resolved(granted: CapabilitySet, denied: CapabilitySet, deferred: CapabilitySet) -> Self {
        let all_granted = denied.is_empty();
        Self {
            granted,
            denied,
            deferred,
            all_granted,
            error: None,
        }
    }

    /// Build an error outcome; nothing is granted and every requested
    /// capability is reported denied
    pub fn failed(requested: &CapabilitySet, error: NegotiationError) -> Self {
        Self {
            granted: CapabilitySet::new(),
            denied: requested.clone(),
            deferred: CapabilitySet::new(),
            all_granted: false,
            error: Some(error),
        }
    }

    /// Build an error outcome that keeps what was granted before the failure
    pub fn partial(
        granted: CapabilitySet,
        denied: CapabilitySet,
        error: NegotiationError,
    ) -> Self {
        Self {
            granted,
            denied,
            deferred: CapabilitySet::new(),
            all_granted: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<NegotiationError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

type Deliver = Box<dyn FnOnce(NegotiationOutcome) + Send>;

/// Delivers a session's outcome to the caller, exactly once
pub struct OutcomeReporter {
    deliver: Deliver,
}

impl OutcomeReporter {
    /// Invoke `callback` directly on the task that resolves the session
    pub fn new(callback: impl FnOnce(NegotiationOutcome) + Send + 'static) -> Self {
        Self {
            deliver: Box::new(callback),
        }
    }

    /// Invoke `callback(granted, all_granted)`, ignoring the error detail
    pub fn from_grant_callback(
        callback: impl FnOnce(CapabilitySet, bool) + Send + 'static,
    ) -> Self {
        Self::new(move |outcome| callback(outcome.granted, outcome.all_granted))
    }

    /// Invoke `callback` on the caller's designated runtime
    pub fn on_runtime(
        handle: Handle,
        callback: impl FnOnce(NegotiationOutcome) + Send + 'static,
    ) -> Self {
        Self::new(move |outcome| {
            handle.spawn(async move { callback(outcome) });
        })
    }

    /// Deliver into a oneshot channel
    pub fn channel() -> (Self, oneshot::Receiver<NegotiationOutcome>) {
        let (tx, rx) = oneshot::channel();
        let reporter = Self::new(move |outcome| {
            if tx.send(outcome).is_err() {
                tracing::debug!("Outcome receiver dropped before delivery");
            }
        });
        (reporter, rx)
    }

    /// Deliver into an unbounded channel shared by several sessions
    pub fn to_sender(sender: mpsc::UnboundedSender<NegotiationOutcome>) -> Self {
        Self::new(move |outcome| {
            if sender.send(outcome).is_err() {
                tracing::debug!("Outcome channel closed before delivery");
            }
        })
    }

    /// Fire the reporter
    pub fn report(self, outcome: NegotiationOutcome) {
        tracing::debug!(
            granted = outcome.granted.len(),
            denied = outcome.denied.len(),
            all_granted = outcome.all_granted,
            error = outcome.error.as_ref().map(NegotiationError::kind),
            "Reporting negotiation outcome"
        );
        (self.deliver)(outcome);
    }
}

impl std::fmt::Debug for OutcomeReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutcomeReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(ids: &[&str]) -> CapabilitySet {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_resolved_all_granted() {
        let outcome =
            NegotiationOutcome::resolved(caps(&["camera"]), CapabilitySet::new(), CapabilitySet::new());
        assert!(outcome.all_granted);
        assert!(outcome.is_success());
    }

    #[test]
    fn test_failed_denies_everything() {
        let requested = caps(&["camera", "location"]);
        let outcome = NegotiationOutcome::failed(&requested, NegotiationError::EmptyRequest);

        assert!(outcome.granted.is_empty());
        assert_eq!(outcome.denied, requested);
        assert!(!outcome.all_granted);
    }

    #[tokio::test]
    async fn test_channel_reporter() {
        let (reporter, rx) = OutcomeReporter::channel();
        reporter.report(NegotiationOutcome::resolved(
            caps(&["camera"]),
            CapabilitySet::new(),
            CapabilitySet::new(),
        ));

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.granted, caps(&["camera"]));
    }

    #[tokio::test]
    async fn test_grant_callback_reporter() {
        let (tx, rx) = oneshot::channel();
        let reporter = OutcomeReporter::from_grant_callback(move |granted, all| {
            let _ = tx.send((granted, all));
        });

        reporter.report(NegotiationOutcome::resolved(
            CapabilitySet::new(),
            caps(&["location"]),
            CapabilitySet::new(),
        ));

        let (granted, all) = rx.await.unwrap();
        assert!(granted.is_empty());
        assert!(!all);
    }

    #[tokio::test]
    async fn test_runtime_reporter_runs_on_handle() {
        let (tx, rx) = oneshot::channel();
        let reporter = OutcomeReporter::on_runtime(Handle::current(), move |outcome| {
            let _ = tx.send(outcome.all_granted);
        });

        reporter.report(NegotiationOutcome::resolved(
            caps(&["camera"]),
            CapabilitySet::new(),
            CapabilitySet::new(),
        ));

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn test_sender_reporter_collects_several_sessions() {
        let (tx, mut rx) = mpsc::unbounded_channel();

        OutcomeReporter::to_sender(tx.clone()).report(NegotiationOutcome::resolved(
            caps(&["camera"]),
            CapabilitySet::new(),
            CapabilitySet::new(),
        ));
        OutcomeReporter::to_sender(tx).report(NegotiationOutcome::failed(
            &caps(&["location"]),
            NegotiationError::ConcurrentSessionRejected,
        ));

        assert!(rx.recv().await.unwrap().all_granted);
        assert_eq!(rx.recv().await.unwrap().denied, caps(&["location"]));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = NegotiationOutcome::failed(
            &caps(&["camera"]),
            NegotiationError::ConcurrentSessionRejected,
        );
        let json = serde_json::to_string(&outcome).unwrap();

        assert!(json.contains("\"denied\":[\"camera\"]"));
        assert!(json.contains("already active"));
    }
}
