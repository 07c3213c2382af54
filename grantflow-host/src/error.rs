//! Negotiation error taxonomy
//!
//! Every failure is delivered through the outcome reporter in the `error`
//! field of [`NegotiationOutcome`](crate::NegotiationOutcome), never by panic.

use grantflow_api::CapabilitySet;
use thiserror::Error;

/// Errors that end a negotiation session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    /// The host's declared-capability manifest could not be read
    #[error("Capability manifest unavailable: {0}")]
    ManifestUnavailable(String),

    /// The caller requested capabilities absent from the manifest
    #[error("Capabilities not declared in the manifest: {}", .0.joined())]
    CapabilityNotDeclared(CapabilitySet),

    /// The host surface cannot mount the interstitial needed to prompt
    #[error("Host surface unavailable: {0}")]
    HostSurfaceUnavailable(String),

    /// Another session is active on this host surface
    #[error("A negotiation session is already active")]
    ConcurrentSessionRejected,

    /// The request contained no capability
    #[error("The requested capability set cannot be empty")]
    EmptyRequest,
}

impl NegotiationError {
    /// Short machine-readable name, used in audit records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ManifestUnavailable(_) => "manifest_unavailable",
            Self::CapabilityNotDeclared(_) => "capability_not_declared",
            Self::HostSurfaceUnavailable(_) => "host_surface_unavailable",
            Self::ConcurrentSessionRejected => "concurrent_session_rejected",
            Self::EmptyRequest => "empty_request",
        }
    }
}

/// Errors raised by the host capability queries
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read capability manifest: {0}")]
    ManifestUnreadable(String),
}

impl From<RegistryError> for NegotiationError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::ManifestUnreadable(reason) => Self::ManifestUnavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_declared_message_lists_capabilities() {
        let missing: CapabilitySet = ["camera", "nfc"].into_iter().collect();
        let err = NegotiationError::CapabilityNotDeclared(missing);

        assert_eq!(
            err.to_string(),
            "Capabilities not declared in the manifest: camera, nfc"
        );
        assert_eq!(err.kind(), "capability_not_declared");
    }

    #[test]
    fn test_registry_error_maps_to_manifest_unavailable() {
        let err: NegotiationError = RegistryError::ManifestUnreadable("no package".into()).into();
        assert_eq!(
            err,
            NegotiationError::ManifestUnavailable("no package".into())
        );
    }
}
