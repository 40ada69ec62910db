//! Group Model: partitions participants into fixed-size groups
//!
//! Each group shares a resource pool, an enforcement mechanism and (under the
//! monitor mechanisms) a monitor. Membership is indexed both ways: groups hold
//! ordered member lists and `membership` maps a participant back to its group.
//! [`GroupModel::rebuild`] tears both down and rebuilds them in one call.

use std::collections::{BTreeMap, HashMap};

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::RoundConfig;
use crate::decisions::Rule;
use crate::registry::{ClientRegistry, ParticipantId, Position};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{}", self.0)
    }
}

/// Who may sanction whom under the regulated pathway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementMechanism {
    #[default]
    None,
    EveryoneCanSanction,
    RandomMonitor,
    RotatingMonitor,
}

impl EnforcementMechanism {
    pub fn has_monitor(self) -> bool {
        matches!(self, Self::RandomMonitor | Self::RotatingMonitor)
    }
}

impl std::fmt::Display for EnforcementMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::EveryoneCanSanction => write!(f, "everyone_can_sanction"),
            Self::RandomMonitor => write!(f, "random_monitor"),
            Self::RotatingMonitor => write!(f, "rotating_monitor"),
        }
    }
}

/// Whether real-time sanctioning carries a cost
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionMechanism {
    #[default]
    None,
    Costly,
}

/// A harvestable cell in a group's resource pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCell {
    /// Age in simulated years (3D aging)
    pub age: u32,
    /// Fruit available for harvest (3D)
    pub fruits: u32,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    /// Members in join order; rotation walks this list
    pub members: Vec<ParticipantId>,
    pub enforcement: EnforcementMechanism,
    pub sanction_mechanism: SanctionMechanism,
    pub monitor: Option<ParticipantId>,
    pub resources: BTreeMap<Position, ResourceCell>,
    pub locks: BTreeMap<Position, ParticipantId>,
    /// Cells that gained a resource since the last tick
    pub added: Vec<Position>,
    /// Cells that lost a resource since the last tick
    pub removed: Vec<Position>,
    /// Ordered outcome of the last rule vote; first is the winner
    pub selected_rules: Vec<Rule>,
}

impl Group {
    fn new(id: GroupId) -> Self {
        Self {
            id,
            members: Vec::new(),
            enforcement: EnforcementMechanism::None,
            sanction_mechanism: SanctionMechanism::None,
            monitor: None,
            resources: BTreeMap::new(),
            locks: BTreeMap::new(),
            added: Vec::new(),
            removed: Vec::new(),
            selected_rules: Vec::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.members.contains(&id)
    }

    pub fn is_monitor(&self, id: ParticipantId) -> bool {
        self.monitor == Some(id)
    }

    pub fn is_resource_distribution_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn add_resource(&mut self, position: Position) {
        if self.resources.insert(position, ResourceCell::default()).is_none() {
            self.added.push(position);
        }
    }

    pub fn take_resource(&mut self, position: Position) -> Option<ResourceCell> {
        let cell = self.resources.remove(&position)?;
        self.locks.remove(&position);
        self.removed.push(position);
        Some(cell)
    }

    /// Claim a cell. Succeeds if unclaimed or already held by `id`.
    pub fn lock(&mut self, position: Position, id: ParticipantId) -> bool {
        if !self.resources.contains_key(&position) {
            return false;
        }
        match self.locks.get(&position) {
            Some(owner) => *owner == id,
            None => {
                self.locks.insert(position, id);
                true
            }
        }
    }

    pub fn unlock(&mut self, position: Position, id: ParticipantId) -> bool {
        if self.locks.get(&position) == Some(&id) {
            self.locks.remove(&position);
            true
        } else {
            false
        }
    }

    /// Whether `id` may harvest `position` (unclaimed or claimed by them).
    pub fn may_harvest(&self, position: Position, id: ParticipantId) -> bool {
        self.locks.get(&position).map_or(true, |owner| *owner == id)
    }

    /// Members within `radius` of `center`, for field-of-vision chat.
    pub fn members_within(
        &self,
        registry: &ClientRegistry,
        center: Position,
        radius: f64,
    ) -> Vec<ParticipantId> {
        self.members
            .iter()
            .copied()
            .filter(|id| {
                registry
                    .get(*id)
                    .is_some_and(|p| p.position.distance(&center) <= radius)
            })
            .collect()
    }

    /// Pick the first monitor for the round.
    pub fn assign_initial_monitor<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.monitor = match self.enforcement {
            EnforcementMechanism::RotatingMonitor => self.members.first().copied(),
            EnforcementMechanism::RandomMonitor => self.members.choose(rng).copied(),
            _ => None,
        };
    }

    /// Hand the monitor role to the next member. Returns whether it changed.
    pub fn rotate_monitor<R: Rng + ?Sized>(&mut self, rng: &mut R) -> bool {
        if !self.enforcement.has_monitor() || self.members.is_empty() {
            return false;
        }
        let next = match (self.enforcement, self.monitor) {
            (_, None) => self.members.first().copied(),
            (EnforcementMechanism::RotatingMonitor, Some(current)) => {
                let index = self
                    .members
                    .iter()
                    .position(|m| *m == current)
                    .map_or(0, |i| (i + 1) % self.members.len());
                Some(self.members[index])
            }
            (_, Some(current)) => {
                let candidates: Vec<ParticipantId> = self
                    .members
                    .iter()
                    .copied()
                    .filter(|m| *m != current)
                    .collect();
                candidates.choose(rng).copied().or(Some(current))
            }
        };
        let changed = next != self.monitor;
        if changed {
            debug!(group = %self.id, from = ?self.monitor, to = ?next, "Monitor rotated");
        }
        self.monitor = next;
        changed
    }

    /// Charge the flat monitor tax. Returns the monitor and the amount taken.
    pub fn apply_monitor_tax(
        &self,
        registry: &mut ClientRegistry,
        tax: u32,
    ) -> Option<(ParticipantId, u32)> {
        if !self.enforcement.has_monitor() {
            return None;
        }
        let monitor = self.monitor?;
        let taken = registry.get_mut(monitor)?.charge(tax);
        Some((monitor, taken))
    }

    pub fn clear_diffs(&mut self) {
        self.added.clear();
        self.removed.clear();
    }
}

/// All groups plus the participant → group index
#[derive(Debug, Default)]
pub struct GroupModel {
    groups: BTreeMap<GroupId, Group>,
    membership: HashMap<ParticipantId, GroupId>,
    next_id: u32,
}

impl GroupModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn groups_mut(&mut self) -> impl Iterator<Item = &mut Group> {
        self.groups.values_mut()
    }

    pub fn get(&self, id: GroupId) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn get_mut(&mut self, id: GroupId) -> Option<&mut Group> {
        self.groups.get_mut(&id)
    }

    pub fn group_of(&self, participant: ParticipantId) -> Option<&Group> {
        self.membership
            .get(&participant)
            .and_then(|id| self.groups.get(id))
    }

    pub fn group_of_mut(&mut self, participant: ParticipantId) -> Option<&mut Group> {
        let id = *self.membership.get(&participant)?;
        self.groups.get_mut(&id)
    }

    pub fn same_group(&self, a: ParticipantId, b: ParticipantId) -> bool {
        match (self.membership.get(&a), self.membership.get(&b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn is_grouped(&self, participant: ParticipantId) -> bool {
        self.membership.contains_key(&participant)
    }

    /// Drop every group and reassign `order` into fresh groups of
    /// `clients_per_group`, giving each member a starting position.
    pub fn rebuild(
        &mut self,
        registry: &mut ClientRegistry,
        order: &[ParticipantId],
        round: &RoundConfig,
    ) {
        self.groups.clear();
        self.membership.clear();
        self.next_id = 0;
        for id in order {
            self.add_participant(registry, *id, round);
        }
        info!(
            participants = order.len(),
            groups = self.groups.len(),
            per_group = round.clients_per_group,
            "Rebuilt groups"
        );
    }

    /// Shuffle the registry into new groups.
    pub fn shuffle<R: Rng + ?Sized>(
        &mut self,
        registry: &mut ClientRegistry,
        round: &RoundConfig,
        rng: &mut R,
    ) {
        let mut order = registry.ids();
        order.shuffle(rng);
        self.rebuild(registry, &order, round);
    }

    /// Place a participant in the first group with room, creating one if needed.
    pub fn add_participant(
        &mut self,
        registry: &mut ClientRegistry,
        id: ParticipantId,
        round: &RoundConfig,
    ) -> Option<GroupId> {
        let participant = registry.get_mut(id)?;
        let capacity = round.clients_per_group.max(1);

        let group_id = match self.groups.values().find(|g| g.size() < capacity) {
            Some(group) => group.id,
            None => {
                let id = GroupId(self.next_id);
                self.next_id += 1;
                self.groups.insert(id, Group::new(id));
                id
            }
        };
        let group = self.groups.get_mut(&group_id)?;
        group.members.push(id);

        participant.group = Some(group_id);
        participant.assigned_number = group.members.len() as u32;
        participant.position = starting_position(participant.assigned_number, round);
        self.membership.insert(id, group_id);
        Some(group_id)
    }

    /// Remove a departing participant, handing off the monitor role if needed.
    pub fn remove_participant<R: Rng + ?Sized>(&mut self, id: ParticipantId, rng: &mut R) {
        let Some(group_id) = self.membership.remove(&id) else {
            return;
        };
        if let Some(group) = self.groups.get_mut(&group_id) {
            group.members.retain(|m| *m != id);
            group.locks.retain(|_, owner| *owner != id);
            if group.monitor == Some(id) {
                group.monitor = None;
                group.assign_initial_monitor(rng);
            }
        }
    }

    /// Fresh starting positions for every grouped participant.
    pub fn initialize_positions(&self, registry: &mut ClientRegistry, round: &RoundConfig) {
        for participant in registry.iter_mut() {
            if self.membership.contains_key(&participant.id) {
                participant.position = starting_position(participant.assigned_number, round);
            }
        }
    }

    /// Apply the round's mechanisms to every group and pick monitors.
    pub fn configure_round<R: Rng + ?Sized>(&mut self, round: &RoundConfig, rng: &mut R) {
        let sanction_mechanism = if round.sanctioning_enabled {
            SanctionMechanism::Costly
        } else {
            SanctionMechanism::None
        };
        for group in self.groups.values_mut() {
            group.enforcement = round.enforcement_mechanism;
            group.sanction_mechanism = sanction_mechanism;
            group.assign_initial_monitor(rng);
        }
    }

    pub fn clear_diffs(&mut self) {
        for group in self.groups.values_mut() {
            group.clear_diffs();
        }
    }

    /// Drop round-scoped group state. Membership persists across rounds.
    pub fn cleanup_round(&mut self) {
        for group in self.groups.values_mut() {
            group.resources.clear();
            group.locks.clear();
            group.clear_diffs();
            group.monitor = None;
        }
    }
}

/// Members spread evenly along the middle row of the grid.
fn starting_position(assigned_number: u32, round: &RoundConfig) -> Position {
    let slots = round.clients_per_group.max(1) as i64 + 1;
    let x = (i64::from(round.resource_width) * i64::from(assigned_number)) / slots;
    Position::new(
        (x as i32).clamp(0, round.resource_width - 1),
        round.resource_height / 2,
    )
}
