//! Sanction adjudication
//!
//! Both sanction pathways (unregulated and vote-regulated) go through one
//! decision function, [`adjudicate`], keyed by `(voting_enabled,
//! enforcement_mechanism)`. It is pure: the caller gathers a
//! [`SanctionContext`] under the round-state lock, gets a
//! [`SanctionDecision`] back, and applies it.
//!
//! ```text
//! voting | mechanism             | outcome
//! -------+-----------------------+----------------------------------------
//! off    | *                     | costly checks (tokens, stock, mechanism)
//! on     | EveryoneCanSanction   | costly checks
//! on     | Random/RotatingMonitor| monitor only, zero cost
//! on     | None                  | integrity error
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::groups::{EnforcementMechanism, SanctionMechanism};
use crate::registry::ParticipantId;

/// A real-time sanction, stamped with elapsed round time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionRequest {
    pub source: ParticipantId,
    pub target: ParticipantId,
    /// Milliseconds since round start
    pub elapsed_ms: u64,
}

/// Points assigned to one target during post-round sanctioning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionPoints {
    pub target: ParticipantId,
    pub points: u32,
}

/// A participant's complete post-round sanction sheet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRoundSanctions {
    pub points: Vec<SanctionPoints>,
}

impl PostRoundSanctions {
    pub fn total_points(&self) -> u32 {
        self.points.iter().map(|p| p.points).sum()
    }
}

/// Why a sanction request had no effect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    SourceHasNoTokens,
    TargetHasNoTokens,
    ResourcesDepleted,
    SanctioningDisabled,
    NotMonitor,
    SelfTarget,
}

impl RejectReason {
    /// Feedback shown to the requester.
    pub fn message(self) -> &'static str {
        match self {
            Self::SourceHasNoTokens => "You do not have any tokens to pay for a reduction.",
            Self::TargetHasNoTokens => {
                "The participant you selected has no tokens to reduce."
            }
            Self::ResourcesDepleted => {
                "There are no resources left on the screen; you cannot reduce anyone now."
            }
            Self::SanctioningDisabled => "Reductions are not allowed in this round.",
            Self::NotMonitor => "Only the current monitor may reduce other participants.",
            Self::SelfTarget => "You cannot reduce your own tokens.",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Everything the decision depends on, captured at request time
#[derive(Debug, Clone, Copy)]
pub struct SanctionContext {
    pub source: ParticipantId,
    pub target: ParticipantId,
    pub voting_enabled: bool,
    pub enforcement: EnforcementMechanism,
    pub sanction_mechanism: SanctionMechanism,
    pub same_group: bool,
    pub resources_empty: bool,
    pub source_is_monitor: bool,
    pub source_tokens: u32,
    pub target_tokens: u32,
    pub cost: u32,
    pub penalty: u32,
}

/// Outcome of adjudicating one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanctionDecision {
    /// Deduct `cost` from the source and `penalty` from the target.
    Apply { cost: u32, penalty: u32 },
    /// Policy check failed; feedback to the source only.
    Reject(RejectReason),
    /// Valid request with nothing to take; the source is told so.
    NoOp(RejectReason),
}

impl SanctionDecision {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Apply { .. })
    }
}

/// Decide a real-time sanction request.
///
/// Integrity violations (cross-group requests, or a regulated round whose
/// group has no enforcement mechanism) come back as `Err` so the dispatcher
/// can log and drop them.
pub fn adjudicate(ctx: &SanctionContext) -> CoordinatorResult<SanctionDecision> {
    if !ctx.same_group {
        return Err(CoordinatorError::CrossGroupSanction {
            source_id: ctx.source,
            target: ctx.target,
        });
    }
    if ctx.source == ctx.target {
        return Ok(SanctionDecision::Reject(RejectReason::SelfTarget));
    }

    if !ctx.voting_enabled {
        return Ok(costly(ctx));
    }

    match ctx.enforcement {
        EnforcementMechanism::None => {
            Err(CoordinatorError::SanctionWithoutEnforcement(ctx.source))
        }
        EnforcementMechanism::EveryoneCanSanction => Ok(costly(ctx)),
        EnforcementMechanism::RandomMonitor | EnforcementMechanism::RotatingMonitor => {
            Ok(monitored(ctx))
        }
    }
}

/// Peer sanctioning: the source pays to reduce the target.
fn costly(ctx: &SanctionContext) -> SanctionDecision {
    if ctx.source_tokens == 0 {
        return SanctionDecision::Reject(RejectReason::SourceHasNoTokens);
    }
    if ctx.target_tokens == 0 {
        return SanctionDecision::Reject(RejectReason::TargetHasNoTokens);
    }
    if ctx.resources_empty {
        return SanctionDecision::Reject(RejectReason::ResourcesDepleted);
    }
    if ctx.sanction_mechanism == SanctionMechanism::None {
        return SanctionDecision::Reject(RejectReason::SanctioningDisabled);
    }
    SanctionDecision::Apply {
        cost: ctx.cost.min(ctx.source_tokens),
        penalty: ctx.penalty.min(ctx.target_tokens),
    }
}

/// Monitor sanctioning: only the monitor acts, free of charge.
fn monitored(ctx: &SanctionContext) -> SanctionDecision {
    if !ctx.source_is_monitor {
        return SanctionDecision::Reject(RejectReason::NotMonitor);
    }
    if ctx.target_tokens == 0 {
        return SanctionDecision::NoOp(RejectReason::TargetHasNoTokens);
    }
    SanctionDecision::Apply {
        cost: 0,
        penalty: ctx.penalty.min(ctx.target_tokens),
    }
}
