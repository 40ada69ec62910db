//! Client Registry: connected participants and their per-round state
//!
//! The registry is the only owner of [`Participant`] records. Structural
//! changes (add/remove) and field mutation both happen under the round-state
//! lock, so nothing in here synchronizes on its own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::groups::GroupId;
use crate::sanction::SanctionRequest;

/// Identity of a connected client (participant or facilitator)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub u32);

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A cell on the resource grid
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Position) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        (dx * dx + dy * dy).sqrt()
    }

    /// One step in `direction`, clamped to a `width` x `height` grid.
    pub fn step(&self, direction: Direction, width: i32, height: i32) -> Position {
        let (dx, dy) = match direction {
            Direction::Up => (0, -1),
            Direction::Down => (0, 1),
            Direction::Left => (-1, 0),
            Direction::Right => (1, 0),
        };
        Position {
            x: (self.x + dx).clamp(0, width - 1),
            y: (self.y + dy).clamp(0, height - 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// 3D avatar pose reported by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub heading: f32,
    pub animation_state: u8,
    pub animation_active: bool,
}

/// 3D avatar appearance chosen during agent design
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAppearance {
    pub male: bool,
    pub hair_color: u32,
    pub skin_color: u32,
    pub shirt_color: u32,
    pub trouser_color: u32,
    pub shoes_color: u32,
}

/// Trust-game decisions submitted by one participant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrustGameDecision {
    /// As player one: share of the endowment kept
    pub player_one_keep: f64,
    /// As player two: amount kept for each possible amount sent (0.25 steps)
    pub player_two_keeps: Vec<f64>,
}

/// Per-client state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    /// 1-based number within the group; also selects the full-sync slot
    pub assigned_number: u32,
    pub group: Option<GroupId>,
    /// Tokens earned this round
    pub current_tokens: u32,
    /// Tokens carried from finished rounds
    pub total_tokens: u32,
    pub position: Position,
    pub pose: Pose,
    pub appearance: Option<AgentAppearance>,
    pub explicit_collection_mode: bool,
    /// Set by a collect intent, consumed by the next tick
    pub collecting: bool,
    /// Sanctions issued or received this round
    pub latest_sanctions: Vec<SanctionRequest>,
    pub quiz_correct_answers: u32,
    pub voted_rule: Option<crate::decisions::Rule>,
    pub trust_game: Option<TrustGameDecision>,
    pub trust_game_earnings: f64,
    pub survey_id: Option<String>,
    /// Post-round sanctioning owed by this participant, applied at quorum
    pub post_round_cost: u32,
    pub post_round_penalty: u32,
}

impl Participant {
    pub fn new(id: ParticipantId) -> Self {
        Self {
            id,
            assigned_number: 0,
            group: None,
            current_tokens: 0,
            total_tokens: 0,
            position: Position::default(),
            pose: Pose::default(),
            appearance: None,
            explicit_collection_mode: false,
            collecting: false,
            latest_sanctions: Vec::new(),
            quiz_correct_answers: 0,
            voted_rule: None,
            trust_game: None,
            trust_game_earnings: 0.0,
            survey_id: None,
            post_round_cost: 0,
            post_round_penalty: 0,
        }
    }

    /// Pay a sanction cost. Returns the amount actually deducted.
    pub fn charge(&mut self, cost: u32) -> u32 {
        let deducted = cost.min(self.current_tokens);
        self.current_tokens -= deducted;
        deducted
    }

    /// Lose up to `penalty` tokens, never going below zero.
    pub fn penalize(&mut self, penalty: u32) -> u32 {
        self.charge(penalty)
    }

    /// Whether a tick should collect a token at the current position.
    pub fn wants_to_collect(&self) -> bool {
        !self.explicit_collection_mode || self.collecting
    }

    /// Apply post-round sanctioning accumulated during the debrief phase.
    pub fn apply_post_round_sanctioning(&mut self) {
        let owed = self.post_round_cost.saturating_add(self.post_round_penalty);
        self.charge(owed);
        self.post_round_cost = 0;
        self.post_round_penalty = 0;
    }

    /// Clear round-scoped state, folding this round's earnings into the total.
    /// Calling it twice leaves the same result as calling it once.
    pub fn reset(&mut self) {
        self.total_tokens = self.total_tokens.saturating_add(self.current_tokens);
        self.current_tokens = 0;
        self.collecting = false;
        self.latest_sanctions.clear();
        self.quiz_correct_answers = 0;
        self.voted_rule = None;
        self.trust_game = None;
        self.post_round_cost = 0;
        self.post_round_penalty = 0;
    }
}

/// Registry of connected participants, ordered by id
#[derive(Debug, Default)]
pub struct ClientRegistry {
    participants: BTreeMap<ParticipantId, Participant>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant. Re-registering an id keeps the existing record.
    pub fn add(&mut self, id: ParticipantId) -> &mut Participant {
        self.participants
            .entry(id)
            .or_insert_with(|| Participant::new(id))
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<Participant> {
        self.participants.remove(&id)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    pub fn get_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.get_mut(&id)
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.participants.contains_key(&id)
    }

    /// Live registry size; quorum gates evaluate against this.
    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Participant> {
        self.participants.values_mut()
    }

    /// Mutable access to two distinct participants at once.
    pub fn pair_mut(
        &mut self,
        a: ParticipantId,
        b: ParticipantId,
    ) -> Option<(&mut Participant, &mut Participant)> {
        if a == b {
            return None;
        }
        let mut first = None;
        let mut second = None;
        for (id, participant) in self.participants.iter_mut() {
            if *id == a {
                first = Some(participant);
            } else if *id == b {
                second = Some(participant);
            }
        }
        Some((first?, second?))
    }
}
