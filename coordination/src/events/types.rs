//! Outbound events
//!
//! Everything the coordinator sends to participants and the facilitator.
//! Each event is addressed to exactly one [`Recipient`]; broadcasts are
//! built by iterating recipients.

use serde::{Deserialize, Serialize};

use super::commands::Screen;
use super::snapshot::{FacilitatorSnapshot, GroupDelta, GroupSnapshot, ParticipantSummary};
use crate::config::RoundConfig;
use crate::decisions::{Rule, TrustGameResult};
use crate::groups::GroupId;
use crate::registry::{ParticipantId, Position, TrustGameDecision};
use crate::sanction::PostRoundSanctions;
use std::collections::BTreeMap;

/// Who an outbound event is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    Participant(ParticipantId),
    Facilitator,
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Participant(id) => write!(f, "{id}"),
            Self::Facilitator => write!(f, "facilitator"),
        }
    }
}

/// An event with its address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub recipient: Recipient,
    pub event: ServerEvent,
}

/// One line of a post-round sanction report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanctionSummaryEntry {
    pub id: ParticipantId,
    pub cost: u32,
    pub penalty: u32,
    pub current_tokens: u32,
}

/// All outbound events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Configuration for the upcoming round
    Configuration {
        round_number: usize,
        round: Box<RoundConfig>,
    },

    /// Free-text feedback
    Message { text: String },

    RoundStarted {
        round_number: usize,
        group: Option<GroupId>,
        assigned_number: u32,
        members: Vec<ParticipantId>,
        monitor: Option<ParticipantId>,
        duration_secs: u64,
    },

    ChatRoundStarted {
        group: GroupId,
        members: Vec<ParticipantId>,
    },

    Snapshot { snapshot: GroupSnapshot },

    Delta { delta: GroupDelta },

    SanctionApplied {
        source: ParticipantId,
        target: ParticipantId,
        cost: u32,
        penalty: u32,
    },

    EndRoundSummary {
        round_number: usize,
        current_tokens: u32,
        total_tokens: u32,
        group_tokens: Vec<(ParticipantId, u32)>,
    },

    PostRoundUpdate {
        cost: u32,
        penalty: u32,
        current_tokens: u32,
    },

    RuleSelected {
        selected: Vec<Rule>,
        tally: BTreeMap<Rule, u32>,
    },

    TrustGameResult { result: TrustGameResult },

    Chat {
        from: ParticipantId,
        target: Option<ParticipantId>,
        message: String,
    },

    LockResult { position: Position, locked: bool },

    Show { screen: Screen },

    /// Facilitator: free-text note
    FacilitatorMessage { text: String },

    /// Facilitator: a participant finished the quiz
    QuizCompleted {
        participant: ParticipantId,
        correct_answers: u32,
        completed: usize,
        expected: usize,
    },

    /// Facilitator: every group at once
    FacilitatorUpdate { snapshot: FacilitatorSnapshot },

    FacilitatorEndRound {
        round_number: usize,
        summaries: Vec<ParticipantSummary>,
    },

    /// Facilitator: post-round sanctioning results
    SanctionSummary { entries: Vec<SanctionSummaryEntry> },

    /// Facilitator: a post-round sanction sheet arrived
    PostRoundSanctionReceived {
        source: ParticipantId,
        sanctions: PostRoundSanctions,
    },

    /// Facilitator: chat waiting for approval
    CensoredChat {
        from: ParticipantId,
        target: Option<ParticipantId>,
        message: String,
    },

    /// Facilitator: a trust-game submission arrived
    TrustGameSubmitted {
        participant: ParticipantId,
        decision: TrustGameDecision,
    },
}

impl ServerEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::Configuration { .. } => "configuration",
            ServerEvent::Message { .. } => "message",
            ServerEvent::RoundStarted { .. } => "round_started",
            ServerEvent::ChatRoundStarted { .. } => "chat_round_started",
            ServerEvent::Snapshot { .. } => "snapshot",
            ServerEvent::Delta { .. } => "delta",
            ServerEvent::SanctionApplied { .. } => "sanction_applied",
            ServerEvent::EndRoundSummary { .. } => "end_round_summary",
            ServerEvent::PostRoundUpdate { .. } => "post_round_update",
            ServerEvent::RuleSelected { .. } => "rule_selected",
            ServerEvent::TrustGameResult { .. } => "trust_game_result",
            ServerEvent::Chat { .. } => "chat",
            ServerEvent::LockResult { .. } => "lock_result",
            ServerEvent::Show { .. } => "show",
            ServerEvent::FacilitatorMessage { .. } => "facilitator_message",
            ServerEvent::QuizCompleted { .. } => "quiz_completed",
            ServerEvent::FacilitatorUpdate { .. } => "facilitator_update",
            ServerEvent::FacilitatorEndRound { .. } => "facilitator_end_round",
            ServerEvent::SanctionSummary { .. } => "sanction_summary",
            ServerEvent::PostRoundSanctionReceived { .. } => "post_round_sanction_received",
            ServerEvent::CensoredChat { .. } => "censored_chat",
            ServerEvent::TrustGameSubmitted { .. } => "trust_game_submitted",
        }
    }

    /// Whether this is a full-state synchronization.
    pub fn is_full_sync(&self) -> bool {
        matches!(
            self,
            ServerEvent::Snapshot { .. } | ServerEvent::FacilitatorUpdate { .. }
        )
    }

    pub fn message(text: impl Into<String>) -> Self {
        ServerEvent::Message { text: text.into() }
    }

    pub fn facilitator_message(text: impl Into<String>) -> Self {
        ServerEvent::FacilitatorMessage { text: text.into() }
    }
}
