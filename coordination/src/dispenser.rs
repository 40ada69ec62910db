//! Resource generation hooks
//!
//! The coordinator calls a [`ResourceDispenser`] at round start, once per
//! simulated second and (3D only) once per simulated year. What grows where
//! is up to the implementation.

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::RoundConfig;
use crate::groups::Group;
use crate::registry::Position;

pub trait ResourceDispenser: Send {
    /// Seed a group's resource pool at round start.
    fn initialize(&mut self, group: &mut Group, round: &RoundConfig, rng: &mut StdRng);

    /// Per-second regrowth.
    fn regenerate(&mut self, group: &mut Group, round: &RoundConfig, rng: &mut StdRng);

    /// Per-year aging in the 3D forest.
    fn age(&mut self, group: &mut Group, round: &RoundConfig, rng: &mut StdRng);
}

/// Fruit a mature 3D resource bears each year
const FRUITS_PER_YEAR: u32 = 1;

/// Age at which a 3D resource starts bearing fruit
const FRUITING_AGE: u32 = 2;

/// Seeds at a fixed density and regrows empty cells with a fixed probability
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformDispenser;

impl UniformDispenser {
    fn cells(round: &RoundConfig) -> impl Iterator<Item = Position> {
        let (width, height) = (round.resource_width, round.resource_height);
        (0..height).flat_map(move |y| (0..width).map(move |x| Position::new(x, y)))
    }
}

impl ResourceDispenser for UniformDispenser {
    fn initialize(&mut self, group: &mut Group, round: &RoundConfig, rng: &mut StdRng) {
        let density = round.initial_distribution.clamp(0.0, 1.0);
        for cell in Self::cells(round) {
            if rng.gen_bool(density) {
                group.add_resource(cell);
            }
        }
    }

    fn regenerate(&mut self, group: &mut Group, round: &RoundConfig, rng: &mut StdRng) {
        let rate = round.regrowth_rate.clamp(0.0, 1.0);
        if rate == 0.0 {
            return;
        }
        for cell in Self::cells(round) {
            if !group.resources.contains_key(&cell) && rng.gen_bool(rate) {
                group.add_resource(cell);
            }
        }
    }

    fn age(&mut self, group: &mut Group, _round: &RoundConfig, _rng: &mut StdRng) {
        for resource in group.resources.values_mut() {
            resource.age += 1;
            if resource.age >= FRUITING_AGE {
                resource.fruits += FRUITS_PER_YEAR;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoundConfig;
    use crate::groups::GroupModel;
    use crate::registry::{ClientRegistry, ParticipantId};
    use rand::SeedableRng;

    fn group_for(round: &RoundConfig) -> Group {
        let mut registry = ClientRegistry::new();
        registry.add(ParticipantId(1));
        let mut model = GroupModel::new();
        model.rebuild(&mut registry, &[ParticipantId(1)], round);
        let group = model.groups().next().unwrap().clone();
        group
    }

    #[test]
    fn test_full_density_fills_grid() {
        let round = RoundConfig {
            resource_width: 4,
            resource_height: 3,
            initial_distribution: 1.0,
            ..Default::default()
        };
        let mut group = group_for(&round);
        let mut rng = StdRng::seed_from_u64(1);
        UniformDispenser.initialize(&mut group, &round, &mut rng);
        assert_eq!(group.resources.len(), 12);
        assert_eq!(group.added.len(), 12);
    }

    #[test]
    fn test_zero_density_leaves_grid_empty() {
        let round = RoundConfig {
            initial_distribution: 0.0,
            regrowth_rate: 0.0,
            ..Default::default()
        };
        let mut group = group_for(&round);
        let mut rng = StdRng::seed_from_u64(1);
        UniformDispenser.initialize(&mut group, &round, &mut rng);
        UniformDispenser.regenerate(&mut group, &round, &mut rng);
        assert!(group.is_resource_distribution_empty());
    }

    #[test]
    fn test_aging_bears_fruit() {
        let round = RoundConfig {
            resource_width: 1,
            resource_height: 1,
            initial_distribution: 1.0,
            ..Default::default()
        };
        let mut group = group_for(&round);
        let mut rng = StdRng::seed_from_u64(1);
        let mut dispenser = UniformDispenser;
        dispenser.initialize(&mut group, &round, &mut rng);
        dispenser.age(&mut group, &round, &mut rng);
        dispenser.age(&mut group, &round, &mut rng);

        let cell = group.resources[&Position::new(0, 0)];
        assert_eq!(cell.age, 2);
        assert_eq!(cell.fruits, 1);
    }
}
