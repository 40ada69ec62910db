//! Integration tests for participant commands
//!
//! Exercises the round state's dispatch table directly: sanctions in both
//! pathways, rule voting, trust-game pairing, chat relay and the
//! precondition checks that guard every handler.

use std::sync::Arc;

use foraging_coordination::decisions::Rule;
use foraging_coordination::registry::TrustGameDecision;
use foraging_coordination::sanction::SanctionPoints;
use foraging_coordination::{
    Command, CoordinatorError, EnforcementMechanism, EventLog, ExperimentConfig, Inbound,
    MemoryTransport, ParticipantId, PostRoundSanctions, Recipient, RejectReason, RoundConfig,
    RoundState, ServerEvent,
};

const FACILITATOR: ParticipantId = ParticipantId(100);

struct Fixture {
    state: RoundState,
    transport: Arc<MemoryTransport>,
    log: EventLog,
}

impl Fixture {
    fn new(round: RoundConfig, participants: u32) -> Self {
        let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
        let mut config = ExperimentConfig::with_rounds(vec![round]);
        config.seed = Some(5);
        let transport = MemoryTransport::shared();
        let log = EventLog::in_memory();
        let mut state = RoundState::new(config, transport.clone(), Box::new(log.clone()));

        state.dispatch(Inbound::new(FACILITATOR, Command::RegisterFacilitator));
        for n in 1..=participants {
            state.dispatch(Inbound::new(ParticipantId(n), Command::Register));
        }
        Self {
            state,
            transport,
            log,
        }
    }

    fn send(&mut self, from: u32, command: Command) -> Result<(), CoordinatorError> {
        self.state.handle(Inbound::new(ParticipantId(from), command))
    }

    fn set_tokens(&mut self, id: u32, tokens: u32) {
        self.state
            .registry_mut()
            .get_mut(ParticipantId(id))
            .unwrap()
            .current_tokens = tokens;
    }

    fn tokens(&self, id: u32) -> u32 {
        self.state
            .registry()
            .get(ParticipantId(id))
            .unwrap()
            .current_tokens
    }

    fn received(&self, id: u32, event_type: &str) -> Vec<ServerEvent> {
        self.transport
            .sent_to(Recipient::Participant(ParticipantId(id)))
            .into_iter()
            .filter(|e| e.event_type() == event_type)
            .collect()
    }

    /// Play one round to completion so groups exist for between-round work.
    fn play_round(&mut self) {
        self.state.start_round().unwrap();
        self.state.end_round().unwrap();
        self.state.finalize_round();
        self.transport.clear();
    }
}

fn costly_round() -> RoundConfig {
    RoundConfig {
        clients_per_group: 3,
        sanctioning_enabled: true,
        sanction_cost: 1,
        sanction_penalty: 2,
        initial_distribution: 1.0,
        regrowth_rate: 0.0,
        ..Default::default()
    }
}

fn monitored_round() -> RoundConfig {
    RoundConfig {
        voting_and_regulation_enabled: true,
        enforcement_mechanism: EnforcementMechanism::RotatingMonitor,
        ..costly_round()
    }
}

/// Test: a penalty larger than the target's balance stops at zero
#[tokio::test]
async fn test_sanction_penalty_floors_at_zero() {
    let mut f = Fixture::new(costly_round(), 3);
    f.state.start_round().unwrap();
    f.set_tokens(1, 5);
    f.set_tokens(2, 1);

    f.send(1, Command::Sanction { target: ParticipantId(2) })
        .unwrap();

    assert_eq!(f.tokens(1), 4);
    assert_eq!(f.tokens(2), 0);
    let applied = f.received(2, "sanction_applied");
    assert_eq!(
        applied,
        vec![ServerEvent::SanctionApplied {
            source: ParticipantId(1),
            target: ParticipantId(2),
            cost: 1,
            penalty: 1,
        }]
    );
    assert_eq!(f.log.records_of("sanction_applied").len(), 1);

    let history = &f.state.registry().get(ParticipantId(2)).unwrap().latest_sanctions;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].source, ParticipantId(1));
}

/// Test: a sanction with nothing to take is rejected and changes nothing
#[tokio::test]
async fn test_sanction_against_empty_target_rejected() {
    let mut f = Fixture::new(costly_round(), 2);
    f.state.start_round().unwrap();
    f.set_tokens(1, 5);

    f.send(1, Command::Sanction { target: ParticipantId(2) })
        .unwrap();

    assert_eq!(f.tokens(1), 5);
    let messages = f.received(1, "message");
    assert_eq!(
        messages,
        vec![ServerEvent::message(RejectReason::TargetHasNoTokens.message())]
    );
    assert!(f.log.records_of("sanction_applied").is_empty());
}

/// Test: only the monitor may sanction in a monitored round
#[tokio::test]
async fn test_non_monitor_sanction_has_no_effect() {
    let mut f = Fixture::new(monitored_round(), 3);
    f.state.start_round().unwrap();
    for id in 1..=3 {
        f.set_tokens(id, 10);
    }
    let group = f.state.groups().groups().next().unwrap().clone();
    let monitor = group.monitor.unwrap();
    assert_eq!(Some(monitor), group.members.first().copied());
    let others: Vec<ParticipantId> = group
        .members
        .iter()
        .copied()
        .filter(|m| *m != monitor)
        .collect();

    f.send(others[0].0, Command::Sanction { target: others[1] })
        .unwrap();
    for id in 1..=3 {
        assert_eq!(f.tokens(id), 10);
    }
    assert_eq!(
        f.received(others[0].0, "message"),
        vec![ServerEvent::message(RejectReason::NotMonitor.message())]
    );

    f.send(monitor.0, Command::Sanction { target: others[1] })
        .unwrap();
    assert_eq!(f.tokens(monitor.0), 10);
    assert_eq!(f.tokens(others[1].0), 8);
}

/// Test: sanctions never cross group boundaries
#[tokio::test]
async fn test_cross_group_sanction_is_an_error() {
    let round = RoundConfig {
        clients_per_group: 1,
        ..costly_round()
    };
    let mut f = Fixture::new(round, 2);
    f.state.start_round().unwrap();
    f.set_tokens(1, 5);
    f.set_tokens(2, 5);

    let err = f
        .send(1, Command::Sanction { target: ParticipantId(2) })
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::CrossGroupSanction { .. }));
    assert!(err.is_integrity_error());
    assert_eq!(f.tokens(1), 5);
    assert_eq!(f.tokens(2), 5);
}

/// Test: a monitored round without a mechanism is a configuration error
#[tokio::test]
async fn test_voting_round_without_enforcement_is_an_error() {
    let round = RoundConfig {
        voting_and_regulation_enabled: true,
        enforcement_mechanism: EnforcementMechanism::None,
        ..costly_round()
    };
    let mut f = Fixture::new(round, 2);
    f.state.start_round().unwrap();
    f.set_tokens(1, 5);
    f.set_tokens(2, 5);

    let err = f
        .send(1, Command::Sanction { target: ParticipantId(2) })
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::SanctionWithoutEnforcement(_)));
}

/// Test: the most-voted rule wins and every member hears the result
#[tokio::test]
async fn test_rule_vote_tally() {
    let round = RoundConfig {
        clients_per_group: 5,
        initial_distribution: 0.0,
        ..Default::default()
    };
    let mut f = Fixture::new(round, 5);
    f.play_round();

    let ballots = ["A", "B", "A", "B", "A"];
    for (n, rule) in ballots.iter().enumerate() {
        assert!(f.received(1, "rule_selected").is_empty());
        f.send(n as u32 + 1, Command::VoteRule { rule: Rule::new(*rule) })
            .unwrap();
    }

    for id in 1..=5 {
        let events = f.received(id, "rule_selected");
        assert_eq!(events.len(), 1);
        let ServerEvent::RuleSelected { selected, tally } = &events[0] else {
            panic!("expected a rule selection");
        };
        assert_eq!(selected, &vec![Rule::new("A"), Rule::new("B")]);
        assert_eq!(tally[&Rule::new("A")], 3);
        assert_eq!(tally[&Rule::new("B")], 2);
    }
    let group = f.state.groups().groups().next().unwrap();
    assert_eq!(group.selected_rules.first(), Some(&Rule::new("A")));
    assert_eq!(f.state.votes_received(), 0);
    assert_eq!(f.log.records_of("rule_vote").len(), 5);
}

/// Test: a voter leaving lets the remaining votes be tallied
#[tokio::test]
async fn test_disconnect_completes_vote() {
    let round = RoundConfig {
        clients_per_group: 3,
        initial_distribution: 0.0,
        ..Default::default()
    };
    let mut f = Fixture::new(round, 3);
    f.play_round();

    f.send(1, Command::VoteRule { rule: Rule::new("A") }).unwrap();
    f.send(2, Command::VoteRule { rule: Rule::new("A") }).unwrap();
    assert!(f.received(1, "rule_selected").is_empty());

    f.send(3, Command::Disconnect).unwrap();
    assert_eq!(f.received(1, "rule_selected").len(), 1);
}

/// Test: an odd group wraps its last member around to the first
#[tokio::test]
async fn test_trust_game_odd_group_pairing() {
    let round = RoundConfig {
        clients_per_group: 3,
        trust_game_enabled: true,
        initial_distribution: 0.0,
        ..Default::default()
    };
    let mut f = Fixture::new(round, 3);
    f.play_round();

    let decision = TrustGameDecision {
        player_one_keep: 0.5,
        player_two_keeps: vec![0.0, 0.25, 0.5, 0.75, 1.0],
    };
    for id in 1..=3 {
        f.send(id, Command::TrustGameSubmission { decision: decision.clone() })
            .unwrap();
    }

    let results = f.transport.sent_to(Recipient::Facilitator);
    let results: Vec<_> = results
        .into_iter()
        .filter(|e| e.event_type() == "trust_game_result")
        .collect();
    assert_eq!(results.len(), 2);
    for id in 1..=3 {
        assert!(!f.received(id, "trust_game_result").is_empty());
        let p = f.state.registry().get(ParticipantId(id)).unwrap();
        assert!(p.trust_game.is_none());
    }
    assert_eq!(f.state.trust_submissions(), 0);
}

/// Test: trust-game submissions are refused when the game is off
#[tokio::test]
async fn test_trust_game_disabled() {
    let mut f = Fixture::new(RoundConfig::default(), 1);
    let err = f
        .send(
            1,
            Command::TrustGameSubmission {
                decision: TrustGameDecision::default(),
            },
        )
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::FeatureDisabled(_)));
}

/// Test: group chat reaches everyone in the group except the sender
#[tokio::test]
async fn test_chat_relayed_to_group() {
    let round = RoundConfig {
        clients_per_group: 3,
        chat_enabled: true,
        ..Default::default()
    };
    let mut f = Fixture::new(round, 3);
    f.send(FACILITATOR.0, Command::BeginChatRound).unwrap();
    assert_eq!(f.received(1, "chat_round_started").len(), 1);

    f.send(
        1,
        Command::Chat {
            message: "hello".into(),
            target: None,
        },
    )
    .unwrap();

    assert!(f.received(1, "chat").is_empty());
    assert_eq!(f.received(2, "chat").len(), 1);
    assert_eq!(f.received(3, "chat").len(), 1);
    assert_eq!(f.transport.of_type("chat").len(), 3);
    assert_eq!(f.log.records_of("chat").len(), 1);
}

/// Test: censored chat waits for facilitator approval
#[tokio::test]
async fn test_censored_chat_requires_approval() {
    let round = RoundConfig {
        clients_per_group: 2,
        chat_enabled: true,
        censored_chat: true,
        ..Default::default()
    };
    let mut f = Fixture::new(round, 2);
    f.send(FACILITATOR.0, Command::BeginChatRound).unwrap();
    f.send(
        1,
        Command::Chat {
            message: "psst".into(),
            target: None,
        },
    )
    .unwrap();
    assert!(f.received(2, "chat").is_empty());
    assert_eq!(f.transport.of_type("censored_chat").len(), 1);

    f.send(
        FACILITATOR.0,
        Command::ApproveChat {
            source: ParticipantId(1),
            message: "psst".into(),
            target: None,
        },
    )
    .unwrap();
    assert_eq!(f.received(2, "chat").len(), 1);
}

/// Test: chat in a chat-less round is refused and reported
#[tokio::test]
async fn test_chat_disabled() {
    let mut f = Fixture::new(RoundConfig::default(), 2);
    let err = f
        .send(
            1,
            Command::Chat {
                message: "hi".into(),
                target: None,
            },
        )
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::FeatureDisabled("chat")));
    assert!(!f.transport.of_type("facilitator_message").is_empty());
}

/// Test: the precondition table guards facilitator and in-round commands
#[tokio::test]
async fn test_command_preconditions() {
    let mut f = Fixture::new(RoundConfig::default(), 2);

    assert!(matches!(
        f.send(1, Command::BeginRound),
        Err(CoordinatorError::NotFacilitator(_))
    ));
    assert!(matches!(
        f.send(
            1,
            Command::Move {
                direction: foraging_coordination::registry::Direction::Up
            }
        ),
        Err(CoordinatorError::RoundNotInProgress)
    ));
    assert!(matches!(
        f.send(42, Command::Collect),
        Err(CoordinatorError::UnknownParticipant(ParticipantId(42)))
    ));

    f.state.start_round().unwrap();
    assert!(matches!(
        f.send(FACILITATOR.0, Command::BeginRound),
        Err(CoordinatorError::RoundInProgress)
    ));
}

/// Test: cleanup can run twice without changing the outcome
#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let mut f = Fixture::new(costly_round(), 2);
    f.state.start_round().unwrap();
    f.set_tokens(1, 7);
    f.state.end_round().unwrap();

    f.state.cleanup();
    let totals: Vec<(u32, u32)> = f
        .state
        .registry()
        .iter()
        .map(|p| (p.current_tokens, p.total_tokens))
        .collect();
    f.state.cleanup();
    let again: Vec<(u32, u32)> = f
        .state
        .registry()
        .iter()
        .map(|p| (p.current_tokens, p.total_tokens))
        .collect();

    assert_eq!(totals, again);
    assert_eq!(totals[0], (0, 7));
    assert!(f.state.counters().quiz_submitted.is_empty());
    assert!(f
        .state
        .groups()
        .groups()
        .all(|g| g.resources.is_empty() && g.monitor.is_none()));
}

/// Test: sheets only count while post-round sanctioning is open, and once
#[tokio::test]
async fn test_post_round_sheet_charged_once() {
    let round = RoundConfig {
        post_round_sanctioning_enabled: true,
        ..costly_round()
    };
    let mut f = Fixture::new(round, 3);
    let sheet = || Command::PostRoundSanction {
        sanctions: PostRoundSanctions {
            points: vec![SanctionPoints {
                target: ParticipantId(2),
                points: 2,
            }],
        },
    };

    f.state.start_round().unwrap();
    assert!(matches!(
        f.send(1, sheet()),
        Err(CoordinatorError::PostRoundSanctionClosed(ParticipantId(1)))
    ));

    assert!(f.state.end_round().unwrap());
    f.send(1, sheet()).unwrap();
    f.send(1, sheet()).unwrap();

    let source = f.state.registry().get(ParticipantId(1)).unwrap();
    assert_eq!(source.post_round_cost, 2);
    let target = f.state.registry().get(ParticipantId(2)).unwrap();
    assert_eq!(target.post_round_penalty, 4);
    assert_eq!(f.state.counters().post_round_submitted.len(), 1);
    assert_eq!(f.log.records_of("post_round_sanction").len(), 1);
}
