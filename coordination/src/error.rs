//! Error types for the round coordinator.
//!
//! Nothing here is fatal: handlers return these to the dispatcher, which logs
//! them and drops the offending command.

use crate::registry::ParticipantId;
use crate::round::IllegalTransition;

/// Error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Unknown participant: {0}")]
    UnknownParticipant(ParticipantId),

    #[error("Command from {0} requires the facilitator")]
    NotFacilitator(ParticipantId),

    #[error("Sanction crosses group boundaries: {source_id} -> {target}")]
    CrossGroupSanction {
        source_id: ParticipantId,
        target: ParticipantId,
    },

    #[error("Sanction from {0} reached a group without an enforcement mechanism")]
    SanctionWithoutEnforcement(ParticipantId),

    #[error("Participant {0} is not assigned to a group")]
    Ungrouped(ParticipantId),

    #[error("Experiment already started, rejecting {0}")]
    ExperimentStarted(ParticipantId),

    #[error("{0} is disabled for the current round")]
    FeatureDisabled(&'static str),

    #[error("Post-round sanctioning is not open, rejecting sheet from {0}")]
    PostRoundSanctionClosed(ParticipantId),

    #[error("No round in progress")]
    RoundNotInProgress,

    #[error("A round is already in progress")]
    RoundInProgress,

    #[error(transparent)]
    Phase(#[from] IllegalTransition),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoordinatorError {
    /// Integrity errors indicate a bug upstream (client or dispatcher) rather
    /// than a request that merely failed a policy check.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Self::CrossGroupSanction { .. } | Self::SanctionWithoutEnforcement(_) | Self::Ungrouped(_)
        )
    }
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
