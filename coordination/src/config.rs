//! Experiment and round configuration.
//!
//! An experiment is an ordered list of [`RoundConfig`]s plus server-wide
//! timing parameters. Configurations deserialize from TOML; every field has a
//! default so a config file only needs to name what differs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::groups::EnforcementMechanism;

/// Number of ticks over which full synchronizations are staggered.
pub const SYNCHRONIZATION_FREQUENCY: u64 = 60;

/// Spacing between participants' full-sync slots within one period.
pub const SYNCHRONIZATION_STAGGER: u64 = 10;

/// Default scheduling tick in milliseconds.
pub const DEFAULT_TICK_MS: u64 = 100;

/// Default pause after a round so clients can read the summary.
pub const DEFAULT_POST_ROUND_PAUSE_MS: u64 = 2_000;

/// Which round processor drives the round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Grid world with tokens; staggered synchronization.
    #[default]
    Grid2d,
    /// Legacy 3D forest with aging resources; full sync every tick.
    Forest3d,
}

/// Parameters for a single round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundConfig {
    /// Round length in seconds
    pub duration_secs: u64,
    pub clients_per_group: usize,
    /// Force a reshuffle of group membership before this round
    pub randomize_groups: bool,
    pub quiz_enabled: bool,
    pub chat_enabled: bool,
    /// Chat goes to the facilitator for approval before relay
    pub censored_chat: bool,
    pub field_of_vision_enabled: bool,
    pub view_subjects_radius: f64,
    /// Selects the enforcement-gated sanction pathway
    pub voting_and_regulation_enabled: bool,
    pub enforcement_mechanism: EnforcementMechanism,
    pub sanctioning_enabled: bool,
    pub sanction_cost: u32,
    pub sanction_penalty: u32,
    /// Flat tax charged to each monitor at round end
    pub monitor_tax: u32,
    pub post_round_sanctioning_enabled: bool,
    pub trust_game_enabled: bool,
    pub environment: Environment,
    /// 3D only: wait for every participant's avatar before the round
    pub agent_design_enabled: bool,
    pub resource_aging_seconds_per_year: u64,
    pub resource_width: i32,
    pub resource_height: i32,
    /// Fraction of cells holding a token at round start
    pub initial_distribution: f64,
    /// Per-second probability that an empty cell regrows
    pub regrowth_rate: f64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            duration_secs: 240,
            clients_per_group: 5,
            randomize_groups: false,
            quiz_enabled: false,
            chat_enabled: false,
            censored_chat: false,
            field_of_vision_enabled: false,
            view_subjects_radius: 6.0,
            voting_and_regulation_enabled: false,
            enforcement_mechanism: EnforcementMechanism::None,
            sanctioning_enabled: false,
            sanction_cost: 1,
            sanction_penalty: 2,
            monitor_tax: 25,
            post_round_sanctioning_enabled: false,
            trust_game_enabled: false,
            environment: Environment::Grid2d,
            agent_design_enabled: false,
            resource_aging_seconds_per_year: 10,
            resource_width: 26,
            resource_height: 26,
            initial_distribution: 0.25,
            regrowth_rate: 0.01,
        }
    }
}

impl RoundConfig {
    pub fn round_duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    /// Seconds between monitor rotations: `max(1, duration / group size)`.
    pub fn monitor_rotation_interval(&self) -> u64 {
        let per_group = self.clients_per_group.max(1) as u64;
        (self.duration_secs / per_group).max(1)
    }
}

/// Server-wide configuration and the round schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub rounds: Vec<RoundConfig>,
    /// Scheduling tick in milliseconds
    pub tick_ms: u64,
    pub post_round_pause_ms: u64,
    pub synchronization_frequency: u64,
    pub synchronization_stagger: u64,
    /// Seed for group shuffles, monitor picks and tie-breaks
    pub seed: Option<u64>,
    /// Append-only JSON-lines event log
    pub event_log_path: Option<std::path::PathBuf>,
    #[serde(skip)]
    current_round: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            rounds: vec![RoundConfig::default()],
            tick_ms: std::env::var("FORAGING_TICK_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TICK_MS),
            post_round_pause_ms: DEFAULT_POST_ROUND_PAUSE_MS,
            synchronization_frequency: SYNCHRONIZATION_FREQUENCY,
            synchronization_stagger: SYNCHRONIZATION_STAGGER,
            seed: std::env::var("FORAGING_SEED")
                .ok()
                .and_then(|v| v.parse().ok()),
            event_log_path: None,
            current_round: 0,
        }
    }
}

impl ExperimentConfig {
    /// Build an experiment from an explicit round list.
    pub fn with_rounds(rounds: Vec<RoundConfig>) -> Self {
        Self {
            rounds,
            ..Default::default()
        }
    }

    /// Parse a TOML document.
    pub fn from_toml_str(text: &str) -> CoordinatorResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoordinatorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> CoordinatorResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> CoordinatorResult<()> {
        if self.rounds.is_empty() {
            return Err(CoordinatorError::Config("at least one round is required".into()));
        }
        if self.tick_ms == 0 {
            return Err(CoordinatorError::Config("tick_ms must be positive".into()));
        }
        if self.synchronization_frequency == 0 {
            return Err(CoordinatorError::Config(
                "synchronization_frequency must be positive".into(),
            ));
        }
        for (index, round) in self.rounds.iter().enumerate() {
            if round.clients_per_group == 0 {
                return Err(CoordinatorError::Config(format!(
                    "round {index}: clients_per_group must be positive"
                )));
            }
            if round.resource_width <= 0 || round.resource_height <= 0 {
                return Err(CoordinatorError::Config(format!(
                    "round {index}: resource grid must be non-empty"
                )));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn post_round_pause(&self) -> Duration {
        Duration::from_millis(self.post_round_pause_ms)
    }

    /// Zero-based index of the current round.
    pub fn current_round_number(&self) -> usize {
        self.current_round
    }

    pub fn current_round(&self) -> &RoundConfig {
        &self.rounds[self.current_round.min(self.rounds.len() - 1)]
    }

    /// The round before the current one; the first round is its own predecessor.
    pub fn previous_round(&self) -> &RoundConfig {
        &self.rounds[self.current_round.saturating_sub(1)]
    }

    pub fn is_last_round(&self) -> bool {
        self.current_round + 1 >= self.rounds.len()
    }

    /// Move to the next round. Returns `None` when already on the last round.
    pub fn advance(&mut self) -> Option<&RoundConfig> {
        if self.is_last_round() {
            return None;
        }
        self.current_round += 1;
        Some(self.current_round())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_interval() {
        let mut round = RoundConfig {
            duration_secs: 240,
            clients_per_group: 5,
            ..Default::default()
        };
        assert_eq!(round.monitor_rotation_interval(), 48);

        round.duration_secs = 3;
        assert_eq!(round.monitor_rotation_interval(), 1);

        round.duration_secs = 0;
        assert_eq!(round.monitor_rotation_interval(), 1);
    }

    #[test]
    fn test_advance_through_rounds() {
        let mut config = ExperimentConfig::with_rounds(vec![
            RoundConfig::default(),
            RoundConfig {
                clients_per_group: 4,
                ..Default::default()
            },
        ]);
        assert_eq!(config.current_round_number(), 0);
        assert!(!config.is_last_round());
        assert_eq!(config.previous_round().clients_per_group, 5);

        let next = config.advance().unwrap();
        assert_eq!(next.clients_per_group, 4);
        assert!(config.is_last_round());
        assert_eq!(config.previous_round().clients_per_group, 5);
        assert!(config.advance().is_none());
        assert_eq!(config.current_round_number(), 1);
    }

    #[test]
    fn test_from_toml() {
        let text = r#"
            tick_ms = 50
            seed = 7

            [[rounds]]
            duration_secs = 60
            quiz_enabled = true

            [[rounds]]
            duration_secs = 120
            voting_and_regulation_enabled = true
            enforcement_mechanism = "rotating_monitor"
            post_round_sanctioning_enabled = true
        "#;
        let config = ExperimentConfig::from_toml_str(text).unwrap();
        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.rounds.len(), 2);
        assert!(config.rounds[0].quiz_enabled);
        assert_eq!(config.rounds[0].clients_per_group, 5);
        assert_eq!(
            config.rounds[1].enforcement_mechanism,
            EnforcementMechanism::RotatingMonitor
        );
    }

    #[test]
    fn test_validation_rejects_empty_schedule() {
        let err = ExperimentConfig::from_toml_str("rounds = []").unwrap_err();
        assert!(matches!(err, CoordinatorError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.toml");
        std::fs::write(&path, "[[rounds]]\nduration_secs = 30\n").unwrap();

        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.current_round().duration_secs, 30);
    }
}
