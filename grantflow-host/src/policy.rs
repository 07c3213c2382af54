//! Decision policy
//!
//! Maps what is known about one capability to the action the negotiation
//! session must take for it. The underlying OS API never says "permanently
//! denied" directly; it is inferred from "rationale not showable" plus
//! "already asked before". That inference is a heuristic, which is why the
//! policy is pluggable.

use grantflow_api::{Capability, LiveStatus};
use serde::Serialize;

/// Action required for one capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Already granted (or the platform does not gate capabilities)
    SilentGrant,
    /// Soft-denied: show a justification before prompting again
    NeedsRationale,
    /// Never asked before: prompt directly
    NeedsDirectPrompt,
    /// Inferred "don't ask again": only a settings visit can help
    PermanentlyBlocked,
}

/// Inputs of a classification
#[derive(Debug, Clone, Copy)]
pub struct ClassifyContext<'a> {
    pub capability: &'a Capability,
    /// Live status from the host
    pub live_status: LiveStatus,
    /// Whether the host would show a rationale
    pub rationale_showable: bool,
    /// Whether the capability was prompted for before
    pub previously_requested: bool,
    /// Whether the platform gates capabilities at all
    pub gated: bool,
}

/// Classify one capability with the standard inference rules
pub fn classify(ctx: &ClassifyContext<'_>) -> Classification {
    if !ctx.gated || ctx.live_status.is_granted() {
        Classification::SilentGrant
    } else if ctx.rationale_showable {
        Classification::NeedsRationale
    } else if !ctx.previously_requested {
        Classification::NeedsDirectPrompt
    } else {
        Classification::PermanentlyBlocked
    }
}

/// Strategy trait for capability classification
///
/// Implementations must be pure: classifying the same context twice yields the
/// same answer.
///
/// # Example
///
/// ```rust
/// use grantflow_host::policy::{Classification, ClassifyContext, DecisionPolicy};
///
/// /// Never send users to settings for this app's optional extras
/// struct NoSettingsForExtras;
///
/// impl DecisionPolicy for NoSettingsForExtras {
///     fn classify(&self, ctx: &ClassifyContext<'_>) -> Classification {
///         match grantflow_host::policy::classify(ctx) {
///             Classification::PermanentlyBlocked
///                 if ctx.capability.as_str().starts_with("extra.") =>
///             {
///                 Classification::NeedsDirectPrompt
///             }
///             other => other,
///         }
///     }
/// }
/// ```
pub trait DecisionPolicy: Send + Sync {
    fn classify(&self, ctx: &ClassifyContext<'_>) -> Classification;
}

// ============================================================================
// Default Implementations
// ============================================================================

/// Standard policy: infers permanent blocks from "no rationale + asked before"
#[derive(Debug, Default)]
pub struct DefaultDecisionPolicy;

impl DecisionPolicy for DefaultDecisionPolicy {
    fn classify(&self, ctx: &ClassifyContext<'_>) -> Classification {
        classify(ctx)
    }
}

/// Policy that never infers a permanent block
///
/// For platform versions where the inference is known to misfire: a
/// capability that would be `PermanentlyBlocked` is prompted for directly
/// instead. If the OS really has it blocked, the prompt returns denied at once.
#[derive(Debug, Default)]
pub struct NoInferencePolicy;

impl DecisionPolicy for NoInferencePolicy {
    fn classify(&self, ctx: &ClassifyContext<'_>) -> Classification {
        match classify(ctx) {
            Classification::PermanentlyBlocked => Classification::NeedsDirectPrompt,
            other => other,
        }
    }
}
