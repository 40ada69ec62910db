//! Inbound commands
//!
//! Every message a client or the facilitator can send. The transport decodes
//! wire messages into [`Inbound`] values; the round state dispatches on
//! [`CommandKind`].

use serde::{Deserialize, Serialize};

use crate::decisions::Rule;
use crate::registry::{AgentAppearance, Direction, ParticipantId, Pose, Position, TrustGameDecision};
use crate::sanction::PostRoundSanctions;

/// Screens the facilitator can push to every participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    Instructions,
    TrustGame,
    VoteScreen,
    Survey,
    Debriefing,
    ExitInstructions,
}

/// A command together with the connection it came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    pub from: ParticipantId,
    pub command: Command,
}

impl Inbound {
    pub fn new(from: ParticipantId, command: Command) -> Self {
        Self { from, command }
    }
}

/// All inbound commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// A participant connects
    Register,

    /// The facilitator connects
    RegisterFacilitator,

    Disconnect,

    QuizResponse {
        correct_answers: u32,
        #[serde(default)]
        incorrect_questions: Vec<String>,
    },

    /// Facilitator: start the next round once the quiz gate allows it
    BeginRound,

    /// Facilitator: expire the round timer now
    EndRound,

    /// Facilitator: form chat groups before the round
    BeginChatRound,

    /// Facilitator: show a screen to everyone
    Show { screen: Screen },

    Move { direction: Direction },

    UpdatePose { pose: Pose },

    Collect,

    ExplicitCollectionMode { enabled: bool },

    LockResource { position: Position },

    UnlockResource { position: Position },

    HarvestResource { position: Position },

    HarvestFruit { position: Position },

    Sanction { target: ParticipantId },

    PostRoundSanction { sanctions: PostRoundSanctions },

    VoteRule { rule: Rule },

    TrustGameSubmission { decision: TrustGameDecision },

    Chat {
        message: String,
        /// Private message to one participant; group-wide when absent
        #[serde(default)]
        target: Option<ParticipantId>,
    },

    /// Facilitator: release a censored chat message
    ApproveChat {
        source: ParticipantId,
        message: String,
        #[serde(default)]
        target: Option<ParticipantId>,
    },

    SurveyId { survey_id: String },

    AgentDesigned { appearance: AgentAppearance },
}

/// Dispatch key for [`Command`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Register,
    RegisterFacilitator,
    Disconnect,
    QuizResponse,
    BeginRound,
    EndRound,
    BeginChatRound,
    Show,
    Move,
    UpdatePose,
    Collect,
    ExplicitCollectionMode,
    LockResource,
    UnlockResource,
    HarvestResource,
    HarvestFruit,
    Sanction,
    PostRoundSanction,
    VoteRule,
    TrustGameSubmission,
    Chat,
    ApproveChat,
    SurveyId,
    AgentDesigned,
}

impl CommandKind {
    /// Commands only the facilitator may issue.
    pub fn is_facilitator_only(self) -> bool {
        matches!(
            self,
            Self::BeginRound | Self::EndRound | Self::BeginChatRound | Self::ApproveChat
        )
    }

    /// Commands that only make sense while a round is running.
    pub fn requires_round_in_progress(self) -> bool {
        matches!(
            self,
            Self::Move
                | Self::UpdatePose
                | Self::LockResource
                | Self::UnlockResource
                | Self::HarvestResource
                | Self::HarvestFruit
                | Self::Sanction
        )
    }

    /// Commands accepted from a connection not in the registry.
    pub fn allows_unregistered(self) -> bool {
        matches!(
            self,
            Self::Register | Self::RegisterFacilitator | Self::Disconnect
        )
    }
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Register => CommandKind::Register,
            Command::RegisterFacilitator => CommandKind::RegisterFacilitator,
            Command::Disconnect => CommandKind::Disconnect,
            Command::QuizResponse { .. } => CommandKind::QuizResponse,
            Command::BeginRound => CommandKind::BeginRound,
            Command::EndRound => CommandKind::EndRound,
            Command::BeginChatRound => CommandKind::BeginChatRound,
            Command::Show { .. } => CommandKind::Show,
            Command::Move { .. } => CommandKind::Move,
            Command::UpdatePose { .. } => CommandKind::UpdatePose,
            Command::Collect => CommandKind::Collect,
            Command::ExplicitCollectionMode { .. } => CommandKind::ExplicitCollectionMode,
            Command::LockResource { .. } => CommandKind::LockResource,
            Command::UnlockResource { .. } => CommandKind::UnlockResource,
            Command::HarvestResource { .. } => CommandKind::HarvestResource,
            Command::HarvestFruit { .. } => CommandKind::HarvestFruit,
            Command::Sanction { .. } => CommandKind::Sanction,
            Command::PostRoundSanction { .. } => CommandKind::PostRoundSanction,
            Command::VoteRule { .. } => CommandKind::VoteRule,
            Command::TrustGameSubmission { .. } => CommandKind::TrustGameSubmission,
            Command::Chat { .. } => CommandKind::Chat,
            Command::ApproveChat { .. } => CommandKind::ApproveChat,
            Command::SurveyId { .. } => CommandKind::SurveyId,
            Command::AgentDesigned { .. } => CommandKind::AgentDesigned,
        }
    }
}
