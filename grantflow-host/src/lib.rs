//! grantflow-host: runtime capability negotiation
//!
//! Orchestrates asking a host platform for capabilities: figures out which
//! ones are already granted, justifies re-asking soft-denied ones, prompts
//! for new ones, and routes permanently-denied ones to the host settings
//! surface. Every session ends in exactly one [`NegotiationOutcome`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              Negotiator                                  │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐│
//! │  │  Registry   │ │   Policy    │ │Interstitial │ │  Suspension / Audit ││
//! │  │             │ │             │ │             │ │                     ││
//! │  │ - Host      │ │ - Default   │ │ - Terminal  │ │ - File (MessagePack)││
//! │  │ - History   │ │ - NoInfer-  │ │ - Headless  │ │ - Memory            ││
//! │  │   (File,    │ │   ence      │ │ - Scripted  │ │ - Audit: File JSONL,││
//! │  │    Memory)  │ │             │ │             │ │   Memory, Null, ... ││
//! │  └─────────────┘ └─────────────┘ └─────────────┘ └─────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use grantflow_host::{MemoryHost, NegotiationRequest, Negotiator, NegotiatorPresets, OutcomeReporter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let host = MemoryHost::new(["camera", "location"]);
//! host.grant("camera");
//!
//! let negotiator = Negotiator::new(Arc::new(host), NegotiatorPresets::testing());
//! let (reporter, outcome) = OutcomeReporter::channel();
//!
//! negotiator
//!     .negotiate(NegotiationRequest::from_iter(["camera", "location"]), reporter)
//!     .await;
//!
//! let outcome = outcome.await.unwrap();
//! assert!(outcome.all_granted);
//! # }
//! ```
//!
//! # Components
//!
//! ## Policy
//!
//! | Live status | Platform gated | Rationale showable | Asked before | Classification |
//! |-------------|----------------|--------------------|--------------|----------------|
//! | Granted | any | any | any | SilentGrant |
//! | any | no | any | any | SilentGrant |
//! | NotGranted | yes | yes | any | NeedsRationale |
//! | NotGranted | yes | no | no | NeedsDirectPrompt |
//! | NotGranted | yes | no | yes | PermanentlyBlocked |
//!
//! ## Interstitial
//!
//! - `TerminalInterstitial`: dialogs and prompts on stdin/stdout
//! - `HeadlessInterstitial`: never available; anything needing a dialog fails
//! - `ScriptedInterstitial`: scripted answers, records interactions (testing)

pub mod audit;
pub mod error;
pub mod history;
pub mod interstitial;
pub mod policy;
pub mod presets;
pub mod registry;
pub mod reporter;
pub mod session;
pub mod suspension;

// Re-exports for convenience
pub use audit::{AuditEvent, AuditEventType, AuditSink};
pub use audit::{CompositeAuditSink, FileAuditSink, MemoryAuditSink, NullAuditSink};
pub use error::{NegotiationError, RegistryError};
pub use history::{FileHistoryStore, HistoryStore, MemoryHistoryStore, StoreError};
pub use interstitial::{HeadlessInterstitial, ScriptedInterstitial, TerminalInterstitial};
pub use interstitial::{Interstitial, InterstitialError, InterstitialEvent};
pub use policy::{classify, Classification, ClassifyContext, DecisionPolicy};
pub use policy::{DefaultDecisionPolicy, NoInferencePolicy};
pub use presets::{app_config_dir, NegotiatorConfig, NegotiatorConfigBuilder, NegotiatorPresets, PresetError};
pub use registry::{CapabilityRegistry, HostCapabilities, MemoryHost};
pub use reporter::{NegotiationOutcome, OutcomeReporter};
pub use session::{NegotiationRequest, Negotiator, SessionHandle};
pub use suspension::{FileSuspensionStore, MemorySuspensionStore, SuspensionError, SuspensionStore};

pub use grantflow_api::{
    Capability, CapabilitySet, DialogConfig, DialogText, GrantStatus, LiveStatus, PromptVerdict,
    SessionPhase, SessionSnapshot, UserChoice,
};
