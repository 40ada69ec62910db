//! Views of round state sent to clients
//!
//! Snapshots are captured under the round-state lock and sent after it; they
//! own their data.

use serde::{Deserialize, Serialize};

use crate::decisions::Rule;
use crate::groups::{Group, GroupId};
use crate::registry::{ClientRegistry, ParticipantId, Pose, Position};

/// One participant as seen by the rest of its group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: ParticipantId,
    pub assigned_number: u32,
    pub position: Position,
    pub pose: Pose,
    pub current_tokens: u32,
    pub is_monitor: bool,
}

/// Complete state of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub group: GroupId,
    pub members: Vec<ParticipantView>,
    pub resources: Vec<Position>,
    pub monitor: Option<ParticipantId>,
    pub selected_rules: Vec<Rule>,
    pub time_left_ms: u64,
}

/// What changed in one group since the last tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupDelta {
    pub group: GroupId,
    pub added: Vec<Position>,
    pub removed: Vec<Position>,
    pub members: Vec<ParticipantView>,
    pub time_left_ms: u64,
}

/// Every group, for the facilitator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilitatorSnapshot {
    pub round_number: usize,
    pub time_left_ms: u64,
    pub groups: Vec<GroupSnapshot>,
}

/// A participant's end-of-round standing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSummary {
    pub id: ParticipantId,
    pub group: Option<GroupId>,
    pub current_tokens: u32,
    pub total_tokens: u32,
    pub sanctions: usize,
}

fn member_views(group: &Group, registry: &ClientRegistry) -> Vec<ParticipantView> {
    group
        .members
        .iter()
        .filter_map(|id| registry.get(*id))
        .map(|p| ParticipantView {
            id: p.id,
            assigned_number: p.assigned_number,
            position: p.position,
            pose: p.pose,
            current_tokens: p.current_tokens,
            is_monitor: group.is_monitor(p.id),
        })
        .collect()
}

impl GroupSnapshot {
    pub fn capture(group: &Group, registry: &ClientRegistry, time_left_ms: u64) -> Self {
        Self {
            group: group.id,
            members: member_views(group, registry),
            resources: group.resources.keys().copied().collect(),
            monitor: group.monitor,
            selected_rules: group.selected_rules.clone(),
            time_left_ms,
        }
    }
}

impl GroupDelta {
    pub fn capture(group: &Group, registry: &ClientRegistry, time_left_ms: u64) -> Self {
        Self {
            group: group.id,
            added: group.added.clone(),
            removed: group.removed.clone(),
            members: member_views(group, registry),
            time_left_ms,
        }
    }
}

impl ParticipantSummary {
    pub fn capture(registry: &ClientRegistry) -> Vec<Self> {
        registry
            .iter()
            .map(|p| Self {
                id: p.id,
                group: p.group,
                current_tokens: p.current_tokens,
                total_tokens: p.total_tokens,
                sanctions: p.latest_sanctions.len(),
            })
            .collect()
    }
}
