//! Round processors: per-tick work while a round is in progress.
//!
//! The 2D grid processor collects tokens and sends each participant either a
//! full snapshot or a delta, staggering full syncs so they spread over
//! `synchronization_frequency` ticks. The 3D forest processor ages its
//! resources once per simulated year and sends full snapshots every tick.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use super::state::RoundState;
use crate::config::Environment;
use crate::events::{GroupDelta, GroupSnapshot, ServerEvent};
use crate::groups::GroupId;
use crate::registry::ParticipantId;

/// Ticks at the start of a round that always carry a full snapshot
const INITIAL_FULL_SYNC_TICKS: u64 = 3;

/// The tick on which a participant receives a full snapshot within each
/// synchronization period.
pub fn full_sync_slot(assigned_number: u32, stagger: u64, frequency: u64) -> u64 {
    (u64::from(assigned_number) * stagger) % frequency.max(1)
}

impl RoundState {
    /// Run one scheduling tick.
    pub fn process_tick(&mut self) {
        let tick = self.tick_count;
        self.tick_count += 1;
        let environment = self.config.current_round().environment;

        let rotated = if self.second_tick.is_due() {
            self.per_second_upkeep(environment)
        } else {
            BTreeSet::new()
        };

        match environment {
            Environment::Grid2d => {
                self.collect_tokens();
                self.synchronize_grid(tick, &rotated);
            }
            Environment::Forest3d => self.synchronize_forest(),
        }

        if tick < INITIAL_FULL_SYNC_TICKS || !rotated.is_empty() {
            self.send_facilitator(ServerEvent::FacilitatorUpdate {
                snapshot: self.facilitator_snapshot(),
            });
        }
        self.groups.clear_diffs();
    }

    /// Monitor rotation and resource growth. Returns the groups whose
    /// monitor changed.
    fn per_second_upkeep(&mut self, environment: Environment) -> BTreeSet<GroupId> {
        let round = self.config.current_round().clone();
        let elapsed = self.timer.map_or(0, |t| t.elapsed_secs());
        let interval = round.monitor_rotation_interval();
        let mut rotated = BTreeSet::new();

        for group in self.groups.groups_mut() {
            if group.enforcement.has_monitor()
                && elapsed > 0
                && elapsed % interval == 0
                && group.rotate_monitor(&mut self.rng)
            {
                rotated.insert(group.id);
            }

            match environment {
                Environment::Grid2d => self.dispenser.regenerate(group, &round, &mut self.rng),
                Environment::Forest3d => {
                    let seconds_per_year = round.resource_aging_seconds_per_year.max(1);
                    if elapsed > 0 && elapsed % seconds_per_year == 0 {
                        self.dispenser.age(group, &round, &mut self.rng);
                    }
                }
            }
        }

        if !rotated.is_empty() {
            debug!(elapsed, groups = rotated.len(), "Monitors rotated");
            for group in self.groups.groups().filter(|g| rotated.contains(&g.id)) {
                if let Some(monitor) = group.monitor {
                    self.send(monitor, ServerEvent::message("You are now the monitor."));
                }
            }
        }
        rotated
    }

    /// Each participant standing on a token picks it up, unless they are in
    /// explicit collection mode and have not asked to collect.
    fn collect_tokens(&mut self) {
        for group in self.groups.groups_mut() {
            for id in group.members.clone() {
                let Some(participant) = self.registry.get_mut(id) else {
                    continue;
                };
                if !participant.wants_to_collect() {
                    continue;
                }
                participant.collecting = false;
                let position = participant.position;
                if group.may_harvest(position, id) && group.take_resource(position).is_some() {
                    participant.current_tokens += 1;
                    trace!(participant = %id, ?position, "Token collected");
                }
            }
        }
    }

    fn synchronize_grid(&self, tick: u64, rotated: &BTreeSet<GroupId>) {
        let frequency = self.config.synchronization_frequency;
        let stagger = self.config.synchronization_stagger;
        let time_left_ms = self.timer.map_or(0, |t| t.time_left_ms());

        for group in self.groups.groups() {
            let mut snapshot: Option<ServerEvent> = None;
            let mut delta: Option<ServerEvent> = None;
            let force_full = tick < INITIAL_FULL_SYNC_TICKS || rotated.contains(&group.id);

            for id in &group.members {
                let Some(participant) = self.registry.get(*id) else {
                    continue;
                };
                let slot = full_sync_slot(participant.assigned_number, stagger, frequency);
                let event = if force_full || tick % frequency.max(1) == slot {
                    snapshot
                        .get_or_insert_with(|| ServerEvent::Snapshot {
                            snapshot: GroupSnapshot::capture(group, &self.registry, time_left_ms),
                        })
                        .clone()
                } else {
                    delta
                        .get_or_insert_with(|| ServerEvent::Delta {
                            delta: GroupDelta::capture(group, &self.registry, time_left_ms),
                        })
                        .clone()
                };
                self.send(*id, event);
            }
        }
    }

    fn synchronize_forest(&self) {
        let time_left_ms = self.timer.map_or(0, |t| t.time_left_ms());
        for group in self.groups.groups() {
            let event = ServerEvent::Snapshot {
                snapshot: GroupSnapshot::capture(group, &self.registry, time_left_ms),
            };
            let members: Vec<ParticipantId> = group.members.clone();
            crate::transport::broadcast(self.transport.as_ref(), &members, &event);
        }
    }
}
