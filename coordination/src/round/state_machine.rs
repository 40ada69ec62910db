//! Round phase machine: explicit phases and legal transition guards.
//!
//! The scheduling loop calls [`PhaseMachine::advance`] on every phase change.
//! Each call validates the edge and records it, so the transition log can be
//! replayed when reconstructing what a session did.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Phases of the experiment.
///
/// `Waiting` is both the initial and the resting phase; the experiment
/// remains there after the last round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Between rounds: quizzes, chat, voting, post-round sanctioning.
    Waiting,
    /// The round timer is running and ticks are being processed.
    RoundInProgress,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Waiting => write!(f, "Waiting"),
            Self::RoundInProgress => write!(f, "RoundInProgress"),
        }
    }
}

/// Legal transitions between phases.
///
/// ```text
/// Waiting → RoundInProgress
/// RoundInProgress → Waiting
/// ```
fn is_legal_transition(from: RoundPhase, to: RoundPhase) -> bool {
    use RoundPhase::*;
    matches!((from, to), (Waiting, RoundInProgress) | (RoundInProgress, Waiting))
}

/// A single recorded phase transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RoundPhase,
    pub to: RoundPhase,
    /// Zero-based round index at the time of the transition.
    pub round_number: usize,
    /// Milliseconds since the machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: RoundPhase,
    pub to: RoundPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal phase transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// Tracks the current phase and the log of transitions.
#[derive(Debug)]
pub struct PhaseMachine {
    current: RoundPhase,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            current: RoundPhase::Waiting,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> RoundPhase {
        self.current
    }

    pub fn is_round_in_progress(&self) -> bool {
        self.current == RoundPhase::RoundInProgress
    }

    /// Attempt to move to `to`, recording the edge.
    pub fn advance(
        &mut self,
        to: RoundPhase,
        round_number: usize,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::info!(
            from = %self.current,
            to = %to,
            round_number,
            "Phase transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            round_number,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Number of rounds started so far.
    pub fn rounds_started(&self) -> usize {
        self.transitions
            .iter()
            .filter(|t| t.to == RoundPhase::RoundInProgress)
            .count()
    }
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}
