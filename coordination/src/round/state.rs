//! Round State: everything the ingestion path and the scheduling loop share.
//!
//! One [`RoundState`] lives behind a single `tokio::sync::Mutex`. Inbound
//! commands take the lock for one handler; the scheduling loop takes it for
//! one lifecycle step or one tick. Quorum gates live outside the lock so the
//! loop can wait on them while handlers keep running.
//!
//! Commands are dispatched in two stages: a precondition table keyed by
//! [`CommandKind`] (facilitator-only, round-in-progress, registered sender),
//! then one handler method per command.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use super::state_machine::{PhaseMachine, RoundPhase};
use super::timer::{RoundTimer, SecondTick};
use crate::config::{Environment, ExperimentConfig, RoundConfig};
use crate::decisions::{pair_trust_game, tally_votes, trust_game_payoff, Rule, TrustGameResult};
use crate::dispenser::{ResourceDispenser, UniformDispenser};
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{
    Command, CommandKind, FacilitatorSnapshot, GroupSnapshot, Inbound, ParticipantSummary,
    Recipient, SanctionSummaryEntry, Screen, ServerEvent,
};
use crate::groups::GroupModel;
use crate::persistence::{PersistedRecord, Persister, RoundSummary};
use crate::quorum::{Expectation, PhaseGates};
use crate::registry::{
    AgentAppearance, ClientRegistry, Direction, ParticipantId, Pose, Position, TrustGameDecision,
};
use crate::sanction::{
    adjudicate, PostRoundSanctions, SanctionContext, SanctionDecision, SanctionRequest,
};
use crate::transport::{self, SharedTransport};

/// Who has reported in during the current Waiting phase
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundCounters {
    pub quiz_submitted: BTreeSet<ParticipantId>,
    pub post_round_submitted: BTreeSet<ParticipantId>,
    pub agent_designed: BTreeSet<ParticipantId>,
}

/// Which gates the scheduling loop must wait on before the next round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPlan {
    pub agent_design: bool,
    pub quiz: bool,
}

/// Shared round state
pub struct RoundState {
    pub(super) config: ExperimentConfig,
    pub(super) registry: ClientRegistry,
    pub(super) groups: GroupModel,
    pub(super) phase: PhaseMachine,
    pub(super) gates: Arc<PhaseGates>,
    pub(super) transport: SharedTransport,
    pub(super) persister: Box<dyn Persister>,
    pub(super) dispenser: Box<dyn ResourceDispenser>,
    pub(super) rng: StdRng,
    pub(super) facilitator: Option<ParticipantId>,
    pub(super) experiment_started: bool,
    /// Groups were formed by a chat round during this Waiting phase
    pub(super) groups_initialized: bool,
    pub(super) counters: RoundCounters,
    pub(super) timer: Option<RoundTimer>,
    pub(super) second_tick: SecondTick,
    pub(super) tick_count: u64,
}

impl RoundState {
    pub fn new(
        config: ExperimentConfig,
        transport: SharedTransport,
        persister: Box<dyn Persister>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let gates = PhaseGates::new().shared();
        gates.open_pre_round();

        Self {
            config,
            registry: ClientRegistry::new(),
            groups: GroupModel::new(),
            phase: PhaseMachine::new(),
            gates,
            transport,
            persister,
            dispenser: Box::new(UniformDispenser),
            rng,
            facilitator: None,
            experiment_started: false,
            groups_initialized: false,
            counters: RoundCounters::default(),
            timer: None,
            second_tick: SecondTick::start(),
            tick_count: 0,
        }
    }

    /// Replace the default resource dispenser.
    pub fn with_dispenser(mut self, dispenser: Box<dyn ResourceDispenser>) -> Self {
        self.dispenser = dispenser;
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn current_round(&self) -> &RoundConfig {
        self.config.current_round()
    }

    pub fn round_number(&self) -> usize {
        self.config.current_round_number()
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ClientRegistry {
        &mut self.registry
    }

    pub fn groups(&self) -> &GroupModel {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut GroupModel {
        &mut self.groups
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase.current()
    }

    pub fn phase_machine(&self) -> &PhaseMachine {
        &self.phase
    }

    pub fn gates(&self) -> Arc<PhaseGates> {
        self.gates.clone()
    }

    pub fn counters(&self) -> &RoundCounters {
        &self.counters
    }

    pub fn facilitator(&self) -> Option<ParticipantId> {
        self.facilitator
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn is_round_in_progress(&self) -> bool {
        self.phase.is_round_in_progress()
    }

    /// Distinct participants with a recorded rule vote.
    pub fn votes_received(&self) -> usize {
        self.registry
            .iter()
            .filter(|p| p.voted_rule.is_some())
            .count()
    }

    /// Distinct participants with a recorded trust-game decision.
    pub fn trust_submissions(&self) -> usize {
        self.registry
            .iter()
            .filter(|p| p.trust_game.is_some())
            .count()
    }

    // ------------------------------------------------------------------
    // Outbound helpers
    // ------------------------------------------------------------------

    pub(super) fn send(&self, id: ParticipantId, event: ServerEvent) {
        self.transport.transmit(Recipient::Participant(id), event);
    }

    pub(super) fn send_facilitator(&self, event: ServerEvent) {
        if self.facilitator.is_some() {
            self.transport.transmit(Recipient::Facilitator, event);
        } else {
            debug!(
                event_type = event.event_type(),
                "No facilitator connected, dropping event"
            );
        }
    }

    fn broadcast(&self, event: &ServerEvent) {
        transport::broadcast(self.transport.as_ref(), &self.registry.ids(), event);
    }

    fn store(&mut self, record: PersistedRecord) {
        let record_type = record.record_type();
        if let Err(e) = self.persister.store(record) {
            warn!(record_type, error = %e, "Failed to store record");
        }
    }

    fn configuration_event(&self) -> ServerEvent {
        ServerEvent::Configuration {
            round_number: self.config.current_round_number(),
            round: Box::new(self.config.current_round().clone()),
        }
    }

    pub fn facilitator_snapshot(&self) -> FacilitatorSnapshot {
        let time_left_ms = self.timer.map_or(0, |t| t.time_left_ms());
        FacilitatorSnapshot {
            round_number: self.config.current_round_number(),
            time_left_ms,
            groups: self
                .groups
                .groups()
                .map(|g| GroupSnapshot::capture(g, &self.registry, time_left_ms))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Handle one inbound command, logging and dropping any error.
    pub fn dispatch(&mut self, inbound: Inbound) {
        let from = inbound.from;
        let kind = inbound.command.kind();
        if let Err(e) = self.handle(inbound) {
            if e.is_integrity_error() {
                error!(participant = %from, ?kind, error = %e, "Integrity error, command dropped");
            } else {
                warn!(participant = %from, ?kind, error = %e, "Command rejected");
            }
        }
    }

    /// Handle one inbound command.
    pub fn handle(&mut self, inbound: Inbound) -> CoordinatorResult<()> {
        let Inbound { from, command } = inbound;
        let kind = command.kind();
        self.check_preconditions(from, kind)?;
        debug!(participant = %from, ?kind, "Handling command");

        match command {
            Command::Register => self.on_register(from),
            Command::RegisterFacilitator => self.on_register_facilitator(from),
            Command::Disconnect => self.on_disconnect(from),
            Command::QuizResponse {
                correct_answers,
                incorrect_questions,
            } => self.on_quiz_response(from, correct_answers, incorrect_questions),
            Command::BeginRound => self.on_begin_round(),
            Command::EndRound => self.on_end_round(),
            Command::BeginChatRound => self.on_begin_chat_round(),
            Command::Show { screen } => self.on_show(from, screen),
            Command::Move { direction } => self.on_move(from, direction),
            Command::UpdatePose { pose } => self.on_update_pose(from, pose),
            Command::Collect => self.on_collect(from),
            Command::ExplicitCollectionMode { enabled } => {
                self.on_explicit_collection_mode(from, enabled)
            }
            Command::LockResource { position } => self.on_lock(from, position, true),
            Command::UnlockResource { position } => self.on_lock(from, position, false),
            Command::HarvestResource { position } => self.on_harvest_resource(from, position),
            Command::HarvestFruit { position } => self.on_harvest_fruit(from, position),
            Command::Sanction { target } => self.on_sanction(from, target),
            Command::PostRoundSanction { sanctions } => self.on_post_round_sanction(from, sanctions),
            Command::VoteRule { rule } => self.on_vote_rule(from, rule),
            Command::TrustGameSubmission { decision } => self.on_trust_game(from, decision),
            Command::Chat { message, target } => self.on_chat(from, message, target),
            Command::ApproveChat {
                source,
                message,
                target,
            } => self.relay_chat(source, target, message),
            Command::SurveyId { survey_id } => self.on_survey_id(from, survey_id),
            Command::AgentDesigned { appearance } => self.on_agent_designed(from, appearance),
        }
    }

    fn check_preconditions(&self, from: ParticipantId, kind: CommandKind) -> CoordinatorResult<()> {
        let is_facilitator = self.facilitator == Some(from);
        if kind.is_facilitator_only() && !is_facilitator {
            return Err(CoordinatorError::NotFacilitator(from));
        }
        if !kind.allows_unregistered() && !is_facilitator && !self.registry.contains(from) {
            return Err(CoordinatorError::UnknownParticipant(from));
        }
        if kind.requires_round_in_progress() && !self.phase.is_round_in_progress() {
            return Err(CoordinatorError::RoundNotInProgress);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connection handlers
    // ------------------------------------------------------------------

    fn on_register(&mut self, from: ParticipantId) -> CoordinatorResult<()> {
        if self.experiment_started {
            return Err(CoordinatorError::ExperimentStarted(from));
        }
        self.registry.add(from);
        let registered = self.registry.len();
        self.gates.admit_all(registered);
        info!(participant = %from, registered, "Participant registered");

        self.send(from, self.configuration_event());
        self.send_facilitator(ServerEvent::facilitator_message(format!(
            "{from} connected ({registered} participants)"
        )));
        Ok(())
    }

    fn on_register_facilitator(&mut self, from: ParticipantId) -> CoordinatorResult<()> {
        if self.registry.remove(from).is_some() {
            self.groups.remove_participant(from, &mut self.rng);
            self.gates.settle_all(self.registry.len());
        }
        self.facilitator = Some(from);
        info!(facilitator = %from, "Facilitator registered");
        self.send_facilitator(self.configuration_event());
        Ok(())
    }

    fn on_disconnect(&mut self, from: ParticipantId) -> CoordinatorResult<()> {
        if self.facilitator == Some(from) {
            self.facilitator = None;
            warn!(facilitator = %from, "Facilitator disconnected");
            return Ok(());
        }
        if self.registry.remove(from).is_none() {
            return Err(CoordinatorError::UnknownParticipant(from));
        }
        self.groups.remove_participant(from, &mut self.rng);

        if self.counters.quiz_submitted.remove(&from) {
            self.gates.quiz.withdraw();
        }
        if self.counters.post_round_submitted.remove(&from) {
            self.gates.post_round_sanction.withdraw();
        }
        if self.counters.agent_designed.remove(&from) {
            self.gates.agent_design.withdraw();
        }

        let remaining = self.registry.len();
        info!(participant = %from, remaining, "Participant disconnected");
        self.gates.settle_all(remaining);
        self.maybe_tally_votes();
        self.maybe_run_trust_game();

        self.send_facilitator(ServerEvent::facilitator_message(format!(
            "{from} disconnected ({remaining} participants)"
        )));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Facilitator handlers
    // ------------------------------------------------------------------

    fn on_begin_round(&mut self) -> CoordinatorResult<()> {
        if self.phase.is_round_in_progress() {
            return Err(CoordinatorError::RoundInProgress);
        }
        let live = self.registry.len();
        let round = self.config.current_round();
        if round.environment == Environment::Forest3d && round.agent_design_enabled {
            self.gates.agent_design.settle(live);
            if !self.gates.agent_design.is_satisfied() {
                let completed = self.counters.agent_designed.len();
                info!(completed, expected = live, "Begin round deferred until agents are designed");
                self.send_facilitator(ServerEvent::facilitator_message(format!(
                    "Cannot begin round yet: {completed} of {live} agents designed"
                )));
                return Ok(());
            }
        }
        if self.config.current_round().quiz_enabled {
            self.gates.quiz.settle(live);
            if !self.gates.quiz.is_satisfied() {
                let completed = self.counters.quiz_submitted.len();
                info!(completed, expected = live, "Begin round deferred until quizzes finish");
                self.send_facilitator(ServerEvent::facilitator_message(format!(
                    "Cannot begin round yet: {completed} of {live} quizzes completed"
                )));
                return Ok(());
            }
        }
        self.gates.begin_round.arrive(live);
        info!(round_number = self.round_number(), participants = live, "Begin round signalled");
        Ok(())
    }

    fn on_end_round(&mut self) -> CoordinatorResult<()> {
        let timer = self
            .timer
            .as_mut()
            .ok_or(CoordinatorError::RoundNotInProgress)?;
        timer.force_expire();
        info!(round_number = self.config.current_round_number(), "Round ended by facilitator");
        Ok(())
    }

    fn on_begin_chat_round(&mut self) -> CoordinatorResult<()> {
        if !self.config.current_round().chat_enabled {
            return Err(CoordinatorError::FeatureDisabled("chat"));
        }
        if self.phase.is_round_in_progress() {
            return Err(CoordinatorError::RoundInProgress);
        }
        self.initialize_groups();
        self.groups_initialized = true;

        for group in self.groups.groups() {
            let event = ServerEvent::ChatRoundStarted {
                group: group.id,
                members: group.members.clone(),
            };
            transport::broadcast(self.transport.as_ref(), &group.members, &event);
        }
        info!(groups = self.groups.len(), "Chat round started");
        Ok(())
    }

    fn on_show(&mut self, from: ParticipantId, screen: Screen) -> CoordinatorResult<()> {
        if self.facilitator != Some(from) {
            warn!(participant = %from, ?screen, "Show request from non-facilitator ignored");
            self.send_facilitator(ServerEvent::facilitator_message(format!(
                "Ignored show request for {screen:?} from {from}"
            )));
            return Ok(());
        }
        self.broadcast(&ServerEvent::Show { screen });
        Ok(())
    }

    /// Rebuild or reuse groups for the upcoming round.
    ///
    /// Membership is reshuffled when the round asks for it, when the group
    /// size changed since the previous round, or when someone has no group
    /// yet. Otherwise members only get fresh starting positions.
    pub(super) fn initialize_groups(&mut self) {
        let round = self.config.current_round();
        let previous = self.config.previous_round();
        let ungrouped = self
            .registry
            .iter()
            .any(|p| !self.groups.is_grouped(p.id));

        if round.randomize_groups || round.clients_per_group != previous.clients_per_group || ungrouped
        {
            debug!(
                randomize = round.randomize_groups,
                ungrouped, "Shuffling participants into groups"
            );
            self.groups.shuffle(&mut self.registry, round, &mut self.rng);
        } else {
            self.groups.initialize_positions(&mut self.registry, round);
        }
    }

    // ------------------------------------------------------------------
    // Participant handlers
    // ------------------------------------------------------------------

    fn on_quiz_response(
        &mut self,
        from: ParticipantId,
        correct_answers: u32,
        incorrect_questions: Vec<String>,
    ) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.quiz_correct_answers = correct_answers;
        self.store(PersistedRecord::QuizResponse {
            participant: from,
            correct_answers,
            incorrect_questions,
        });

        if !self.counters.quiz_submitted.insert(from) {
            warn!(participant = %from, "Duplicate quiz submission not counted");
            return Ok(());
        }
        let live = self.registry.len();
        self.gates.quiz.arrive(live);
        self.send_facilitator(ServerEvent::QuizCompleted {
            participant: from,
            correct_answers,
            completed: self.counters.quiz_submitted.len(),
            expected: live,
        });
        Ok(())
    }

    fn on_move(&mut self, from: ParticipantId, direction: Direction) -> CoordinatorResult<()> {
        let round = self.config.current_round();
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.position =
            participant
                .position
                .step(direction, round.resource_width, round.resource_height);
        Ok(())
    }

    fn on_update_pose(&mut self, from: ParticipantId, pose: Pose) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.pose = pose;
        Ok(())
    }

    fn on_collect(&mut self, from: ParticipantId) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.collecting = true;
        Ok(())
    }

    fn on_explicit_collection_mode(
        &mut self,
        from: ParticipantId,
        enabled: bool,
    ) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.explicit_collection_mode = enabled;
        Ok(())
    }

    fn on_lock(&mut self, from: ParticipantId, position: Position, lock: bool) -> CoordinatorResult<()> {
        let group = self
            .groups
            .group_of_mut(from)
            .ok_or(CoordinatorError::Ungrouped(from))?;
        // `locked` reports whether the requester holds the cell afterwards.
        let locked = if lock {
            group.lock(position, from)
        } else {
            group.unlock(position, from);
            false
        };
        self.send(from, ServerEvent::LockResult { position, locked });
        Ok(())
    }

    fn on_harvest_resource(&mut self, from: ParticipantId, position: Position) -> CoordinatorResult<()> {
        let group = self
            .groups
            .group_of_mut(from)
            .ok_or(CoordinatorError::Ungrouped(from))?;
        if !group.may_harvest(position, from) || group.take_resource(position).is_none() {
            debug!(participant = %from, ?position, "Nothing to harvest");
            return Ok(());
        }
        if let Some(participant) = self.registry.get_mut(from) {
            participant.current_tokens += 1;
        }
        Ok(())
    }

    fn on_harvest_fruit(&mut self, from: ParticipantId, position: Position) -> CoordinatorResult<()> {
        let group = self
            .groups
            .group_of_mut(from)
            .ok_or(CoordinatorError::Ungrouped(from))?;
        let allowed = group.may_harvest(position, from);
        let harvested = match group.resources.get_mut(&position) {
            Some(cell) if allowed && cell.fruits > 0 => {
                cell.fruits -= 1;
                true
            }
            _ => false,
        };
        if harvested {
            if let Some(participant) = self.registry.get_mut(from) {
                participant.current_tokens += 1;
            }
        }
        Ok(())
    }

    fn on_survey_id(&mut self, from: ParticipantId, survey_id: String) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.survey_id = Some(survey_id);
        Ok(())
    }

    fn on_agent_designed(
        &mut self,
        from: ParticipantId,
        appearance: AgentAppearance,
    ) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.appearance = Some(appearance);
        if self.counters.agent_designed.insert(from) {
            self.gates.agent_design.arrive(self.registry.len());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sanctions
    // ------------------------------------------------------------------

    fn on_sanction(&mut self, from: ParticipantId, target: ParticipantId) -> CoordinatorResult<()> {
        let round = self.config.current_round();
        let group = self
            .groups
            .group_of(from)
            .ok_or(CoordinatorError::Ungrouped(from))?;
        let source = self
            .registry
            .get(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        let target_participant = self
            .registry
            .get(target)
            .ok_or(CoordinatorError::UnknownParticipant(target))?;

        let ctx = SanctionContext {
            source: from,
            target,
            voting_enabled: round.voting_and_regulation_enabled,
            enforcement: group.enforcement,
            sanction_mechanism: group.sanction_mechanism,
            same_group: self.groups.same_group(from, target),
            resources_empty: group.is_resource_distribution_empty(),
            source_is_monitor: group.is_monitor(from),
            source_tokens: source.current_tokens,
            target_tokens: target_participant.current_tokens,
            cost: round.sanction_cost,
            penalty: round.sanction_penalty,
        };
        let decision = adjudicate(&ctx)?;
        self.apply_sanction(from, target, decision)
    }

    fn apply_sanction(
        &mut self,
        source: ParticipantId,
        target: ParticipantId,
        decision: SanctionDecision,
    ) -> CoordinatorResult<()> {
        let (cost, penalty) = match decision {
            SanctionDecision::Apply { cost, penalty } => (cost, penalty),
            SanctionDecision::Reject(reason) | SanctionDecision::NoOp(reason) => {
                debug!(%source, %target, ?reason, "Sanction had no effect");
                self.send(source, ServerEvent::message(reason.message()));
                return Ok(());
            }
        };

        let request = SanctionRequest {
            source,
            target,
            elapsed_ms: self.timer.map_or(0, |t| t.elapsed_ms()),
        };
        let (sanctioner, sanctioned) = self
            .registry
            .pair_mut(source, target)
            .ok_or(CoordinatorError::UnknownParticipant(target))?;
        sanctioner.charge(cost);
        sanctioned.penalize(penalty);
        sanctioner.latest_sanctions.push(request.clone());
        sanctioned.latest_sanctions.push(request.clone());
        let source_tokens = sanctioner.current_tokens;
        let target_tokens = sanctioned.current_tokens;

        self.store(PersistedRecord::SanctionApplied {
            request,
            cost,
            penalty,
        });
        info!(%source, %target, cost, penalty, "Sanction applied");

        let event = ServerEvent::SanctionApplied {
            source,
            target,
            cost,
            penalty,
        };
        self.send(source, event.clone());
        self.send(target, event);
        self.send(
            source,
            ServerEvent::message(format!(
                "You reduced {target} by {penalty} tokens at a cost of {cost}. You now have {source_tokens} tokens."
            )),
        );
        self.send(
            target,
            ServerEvent::message(format!(
                "Your tokens were reduced by {penalty}. You now have {target_tokens} tokens."
            )),
        );
        Ok(())
    }

    fn on_post_round_sanction(
        &mut self,
        from: ParticipantId,
        sanctions: PostRoundSanctions,
    ) -> CoordinatorResult<()> {
        if !self.gates.post_round_sanction.is_collecting() {
            return Err(CoordinatorError::PostRoundSanctionClosed(from));
        }
        if self.counters.post_round_submitted.contains(&from) {
            warn!(participant = %from, "Duplicate post-round sanction sheet ignored");
            return Ok(());
        }
        let round = self.config.current_round();
        let (cost, penalty) = (round.sanction_cost, round.sanction_penalty);

        let source = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        source.post_round_cost = source
            .post_round_cost
            .saturating_add(sanctions.total_points().saturating_mul(cost));
        for entry in &sanctions.points {
            match self.registry.get_mut(entry.target) {
                Some(target) => {
                    target.post_round_penalty = target
                        .post_round_penalty
                        .saturating_add(entry.points.saturating_mul(penalty));
                }
                None => warn!(source = %from, target = %entry.target, "Post-round sanction for unknown target"),
            }
        }

        self.store(PersistedRecord::PostRoundSanction {
            source: from,
            sanctions: sanctions.clone(),
        });
        self.send_facilitator(ServerEvent::PostRoundSanctionReceived {
            source: from,
            sanctions,
        });

        self.counters.post_round_submitted.insert(from);
        self.gates.post_round_sanction.arrive(self.registry.len());
        Ok(())
    }

    /// Apply everyone's pending post-round sanctioning and report it.
    pub fn apply_post_round_sanctions(&mut self) {
        let mut entries = Vec::with_capacity(self.registry.len());
        for participant in self.registry.iter_mut() {
            let (cost, penalty) = (participant.post_round_cost, participant.post_round_penalty);
            participant.apply_post_round_sanctioning();
            entries.push(SanctionSummaryEntry {
                id: participant.id,
                cost,
                penalty,
                current_tokens: participant.current_tokens,
            });
        }
        for entry in &entries {
            self.send(
                entry.id,
                ServerEvent::PostRoundUpdate {
                    cost: entry.cost,
                    penalty: entry.penalty,
                    current_tokens: entry.current_tokens,
                },
            );
        }
        info!(participants = entries.len(), "Post-round sanctions applied");
        self.send_facilitator(ServerEvent::SanctionSummary { entries });
    }

    // ------------------------------------------------------------------
    // Collective decisions
    // ------------------------------------------------------------------

    fn on_vote_rule(&mut self, from: ParticipantId, rule: Rule) -> CoordinatorResult<()> {
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        if participant.voted_rule.replace(rule.clone()).is_some() {
            debug!(participant = %from, "Vote replaced");
        }
        self.store(PersistedRecord::RuleVote {
            participant: from,
            rule,
        });
        self.maybe_tally_votes();
        Ok(())
    }

    /// Tally every group once each live participant has voted.
    fn maybe_tally_votes(&mut self) {
        let votes = self.votes_received();
        if votes == 0 || votes < self.registry.len() {
            return;
        }

        let mut results = Vec::new();
        for group in self.groups.groups_mut() {
            let ballots: Vec<Rule> = group
                .members
                .iter()
                .filter_map(|id| self.registry.get(*id)?.voted_rule.clone())
                .collect();
            if ballots.is_empty() {
                continue;
            }
            let selection = tally_votes(ballots.iter(), &mut self.rng);
            group.selected_rules = selection.selected.clone();
            results.push((group.id, group.members.clone(), selection));
        }

        for (group, members, selection) in results {
            info!(%group, winner = ?selection.winner(), votes = selection.tally.values().sum::<u32>(), "Rules selected");
            let event = ServerEvent::RuleSelected {
                selected: selection.selected,
                tally: selection.tally,
            };
            transport::broadcast(self.transport.as_ref(), &members, &event);
            self.send_facilitator(event);
        }

        for participant in self.registry.iter_mut() {
            participant.voted_rule = None;
        }
    }

    fn on_trust_game(
        &mut self,
        from: ParticipantId,
        decision: TrustGameDecision,
    ) -> CoordinatorResult<()> {
        if !self.config.current_round().trust_game_enabled {
            return Err(CoordinatorError::FeatureDisabled("trust game"));
        }
        let participant = self
            .registry
            .get_mut(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        participant.trust_game = Some(decision.clone());

        self.store(PersistedRecord::TrustGameSubmission {
            participant: from,
            decision: decision.clone(),
        });
        self.send_facilitator(ServerEvent::TrustGameSubmitted {
            participant: from,
            decision,
        });
        self.maybe_run_trust_game();
        Ok(())
    }

    /// Pair and pay out every group once each live participant has submitted.
    fn maybe_run_trust_game(&mut self) {
        let submissions = self.trust_submissions();
        if submissions == 0 || submissions < self.registry.len() {
            return;
        }

        let mut results: Vec<TrustGameResult> = Vec::new();
        for group in self.groups.groups() {
            for (one, two) in pair_trust_game(&group.members, &mut self.rng) {
                let decisions = self
                    .registry
                    .get(one)
                    .and_then(|p| p.trust_game.as_ref())
                    .zip(self.registry.get(two).and_then(|p| p.trust_game.as_ref()));
                match decisions {
                    Some((a, b)) => results.push(trust_game_payoff(one, a, two, b)),
                    None => warn!(%one, %two, "Trust-game pair missing a decision"),
                }
            }
        }

        for result in &results {
            if let Some(p) = self.registry.get_mut(result.player_one) {
                p.trust_game_earnings += result.player_one_earnings;
            }
            if let Some(p) = self.registry.get_mut(result.player_two) {
                p.trust_game_earnings += result.player_two_earnings;
            }
        }
        for result in results {
            let (one, two) = (result.player_one, result.player_two);
            let event = ServerEvent::TrustGameResult { result };
            self.send(one, event.clone());
            self.send(two, event.clone());
            self.send_facilitator(event);
        }
        info!(submissions, "Trust game processed");

        for participant in self.registry.iter_mut() {
            participant.trust_game = None;
        }
    }

    // ------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------

    fn on_chat(
        &mut self,
        from: ParticipantId,
        message: String,
        target: Option<ParticipantId>,
    ) -> CoordinatorResult<()> {
        let (chat_enabled, censored) = {
            let round = self.config.current_round();
            (round.chat_enabled, round.censored_chat)
        };
        if !chat_enabled {
            self.send_facilitator(ServerEvent::facilitator_message(format!(
                "Chat from {from} refused: chat is disabled for this round"
            )));
            return Err(CoordinatorError::FeatureDisabled("chat"));
        }

        self.store(PersistedRecord::Chat {
            from,
            target,
            message: message.clone(),
        });
        if censored {
            self.send_facilitator(ServerEvent::CensoredChat {
                from,
                target,
                message,
            });
            return Ok(());
        }
        self.relay_chat(from, target, message)
    }

    /// Deliver chat to one target or to the sender's group.
    fn relay_chat(
        &mut self,
        from: ParticipantId,
        target: Option<ParticipantId>,
        message: String,
    ) -> CoordinatorResult<()> {
        let sender = self
            .registry
            .get(from)
            .ok_or(CoordinatorError::UnknownParticipant(from))?;
        let recipients = match target {
            Some(target) => {
                if !self.registry.contains(target) {
                    return Err(CoordinatorError::UnknownParticipant(target));
                }
                vec![target]
            }
            None => {
                let group = self
                    .groups
                    .group_of(from)
                    .ok_or(CoordinatorError::Ungrouped(from))?;
                let round = self.config.current_round();
                let members = if round.field_of_vision_enabled && self.phase.is_round_in_progress() {
                    group.members_within(&self.registry, sender.position, round.view_subjects_radius)
                } else {
                    group.members.clone()
                };
                members.into_iter().filter(|id| *id != from).collect()
            }
        };

        let event = ServerEvent::Chat {
            from,
            target,
            message,
        };
        transport::broadcast(self.transport.as_ref(), &recipients, &event);
        self.send_facilitator(event);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle steps driven by the scheduling loop
    // ------------------------------------------------------------------

    /// Enter a Waiting phase and report which gates to wait on.
    pub fn prepare_waiting(&mut self) -> WaitPlan {
        let round_number = self.config.current_round_number();
        if let Err(e) = self.persister.initialize(round_number) {
            warn!(round_number, error = %e, "Failed to initialize persister");
        }
        let round = self.config.current_round();
        let plan = WaitPlan {
            agent_design: round.environment == Environment::Forest3d && round.agent_design_enabled,
            quiz: round.quiz_enabled,
        };
        info!(
            round_number,
            participants = self.registry.len(),
            quiz = plan.quiz,
            agent_design = plan.agent_design,
            "Waiting for round"
        );
        plan
    }

    /// `Waiting → RoundInProgress`.
    pub fn start_round(&mut self) -> CoordinatorResult<()> {
        let round_number = self.config.current_round_number();
        self.phase
            .advance(RoundPhase::RoundInProgress, round_number, Some("begin round"))?;
        self.experiment_started = true;

        if !self.groups_initialized {
            self.initialize_groups();
        }
        self.groups_initialized = false;

        let round = self.config.current_round().clone();
        self.groups.configure_round(&round, &mut self.rng);
        for group in self.groups.groups_mut() {
            self.dispenser.initialize(group, &round, &mut self.rng);
            group.clear_diffs();
        }

        self.timer = Some(RoundTimer::start(round.round_duration()));
        self.second_tick = SecondTick::start();
        self.tick_count = 0;

        for group in self.groups.groups() {
            for id in &group.members {
                let assigned_number = self.registry.get(*id).map_or(0, |p| p.assigned_number);
                self.send(
                    *id,
                    ServerEvent::RoundStarted {
                        round_number,
                        group: Some(group.id),
                        assigned_number,
                        members: group.members.clone(),
                        monitor: group.monitor,
                        duration_secs: round.duration_secs,
                    },
                );
            }
        }

        let participants = self.registry.len();
        let groups = self.groups.len();
        self.store(PersistedRecord::RoundStarted {
            participants,
            groups,
        });
        self.send_facilitator(ServerEvent::FacilitatorUpdate {
            snapshot: self.facilitator_snapshot(),
        });
        info!(
            round_number,
            participants,
            groups,
            duration_secs = round.duration_secs,
            "Round started"
        );
        Ok(())
    }

    /// Whether the round timer ran out (or was forced).
    pub fn round_expired(&self) -> bool {
        self.timer.map_or(true, |t| t.is_expired())
    }

    /// `RoundInProgress → Waiting`. Returns whether post-round sanctioning
    /// must complete before the round is finalized.
    pub fn end_round(&mut self) -> CoordinatorResult<bool> {
        let round_number = self.config.current_round_number();
        self.phase
            .advance(RoundPhase::Waiting, round_number, Some("round timer expired"))?;
        let round = self.config.current_round().clone();

        for group in self.groups.groups() {
            if let Some((monitor, taken)) = group.apply_monitor_tax(&mut self.registry, round.monitor_tax) {
                info!(group = %group.id, %monitor, taken, "Monitor tax applied");
                self.send(
                    monitor,
                    ServerEvent::message(format!("{taken} tokens were deducted as the monitor tax.")),
                );
            }
        }

        for group in self.groups.groups() {
            let group_tokens: Vec<(ParticipantId, u32)> = group
                .members
                .iter()
                .filter_map(|id| self.registry.get(*id).map(|p| (p.id, p.current_tokens)))
                .collect();
            for id in &group.members {
                let Some(participant) = self.registry.get(*id) else {
                    continue;
                };
                self.send(
                    *id,
                    ServerEvent::EndRoundSummary {
                        round_number,
                        current_tokens: participant.current_tokens,
                        total_tokens: participant
                            .total_tokens
                            .saturating_add(participant.current_tokens),
                        group_tokens: group_tokens.clone(),
                    },
                );
            }
        }
        self.send_facilitator(ServerEvent::FacilitatorEndRound {
            round_number,
            summaries: ParticipantSummary::capture(&self.registry),
        });

        let post_round = round.post_round_sanctioning_enabled;
        if post_round {
            self.counters.post_round_submitted.clear();
            self.gates.post_round_sanction.open(Expectation::Live);
            self.gates.post_round_sanction.settle(self.registry.len());
        }
        info!(round_number, post_round, "Round ended");
        Ok(post_round)
    }

    /// Persist the round aggregate and clean up.
    pub fn finalize_round(&mut self) {
        let summary = RoundSummary {
            round_number: self.config.current_round_number(),
            groups: self.groups.len(),
            participants: ParticipantSummary::capture(&self.registry),
        };
        if let Err(e) = self.persister.persist_round(summary) {
            warn!(error = %e, "Failed to persist round");
        }
        self.cleanup();
    }

    /// Reset per-round state. Safe to call more than once.
    pub fn cleanup(&mut self) {
        for participant in self.registry.iter_mut() {
            participant.reset();
        }
        self.counters = RoundCounters::default();
        self.groups.cleanup_round();
        self.groups_initialized = false;
        self.timer = None;
        self.tick_count = 0;
        self.gates.open_pre_round();
        debug!("Round state cleaned up");
    }

    /// Move to the next round configuration. Returns false after the last round.
    pub fn advance_round(&mut self) -> bool {
        if self.config.advance().is_none() {
            info!(
                rounds = self.config.rounds.len(),
                "Last round complete, remaining in Waiting"
            );
            return false;
        }
        let event = self.configuration_event();
        self.broadcast(&event);
        self.send_facilitator(event);
        info!(round_number = self.config.current_round_number(), "Advanced to next round");
        true
    }
}
