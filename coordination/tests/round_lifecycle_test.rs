//! Integration tests for the round lifecycle
//!
//! Drives the scheduling loop end to end on a paused Tokio clock: quorum
//! gating before a round, timer expiry, post-round sanctioning and
//! advancement through the schedule.

use std::sync::Arc;
use std::time::Duration;

use foraging_coordination::events::ServerEvent;
use foraging_coordination::sanction::SanctionPoints;
use foraging_coordination::{
    Command, Coordinator, CoordinatorHandle, EventLog, ExperimentConfig, MemoryTransport,
    ParticipantId, PersistedRecord, PostRoundSanctions, Recipient, RoundConfig, RoundPhase,
    RoundState,
};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const FACILITATOR: ParticipantId = ParticipantId(100);

struct Harness {
    handle: CoordinatorHandle,
    transport: Arc<MemoryTransport>,
    log: EventLog,
    run: JoinHandle<foraging_coordination::CoordinatorResult<()>>,
}

/// Build a coordinator over `rounds`, register a facilitator and
/// `participants` clients, and spawn the scheduling loop.
async fn start(rounds: Vec<RoundConfig>, participants: u32) -> Harness {
    let _ = tracing_subscriber::fmt().with_env_filter("info").try_init();
    let mut config = ExperimentConfig::with_rounds(rounds);
    config.seed = Some(42);
    config.tick_ms = 100;
    config.post_round_pause_ms = 500;

    let transport = MemoryTransport::shared();
    let log = EventLog::in_memory();
    let state = RoundState::new(config, transport.clone(), Box::new(log.clone()));
    let coordinator = Coordinator::new(state);
    let handle = coordinator.handle();

    handle.dispatch(FACILITATOR, Command::RegisterFacilitator).await;
    for n in 1..=participants {
        handle.dispatch(ParticipantId(n), Command::Register).await;
    }

    let run = tokio::spawn(async move { coordinator.run().await });
    settle().await;
    Harness {
        handle,
        transport,
        log,
        run,
    }
}

/// Let the scheduling task catch up without moving past any round timer.
async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

async fn phase(handle: &CoordinatorHandle) -> RoundPhase {
    handle.state().lock().await.phase()
}

fn quiet_round(duration_secs: u64) -> RoundConfig {
    RoundConfig {
        duration_secs,
        clients_per_group: 2,
        initial_distribution: 0.0,
        regrowth_rate: 0.0,
        ..Default::default()
    }
}

/// Test: begin is refused until every live participant has taken the quiz
#[tokio::test(start_paused = true)]
async fn test_round_waits_for_quiz_quorum() {
    let round = RoundConfig {
        quiz_enabled: true,
        ..quiet_round(5)
    };
    let h = start(vec![round], 2).await;

    h.handle.dispatch(FACILITATOR, Command::BeginRound).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::Waiting);
    let notes = h.transport.sent_to(Recipient::Facilitator);
    assert!(notes.iter().any(|e| matches!(
        e,
        ServerEvent::FacilitatorMessage { text } if text.contains("0 of 2 quizzes")
    )));

    for n in 1..=2 {
        h.handle
            .dispatch(
                ParticipantId(n),
                Command::QuizResponse {
                    correct_answers: 3,
                    incorrect_questions: vec![],
                },
            )
            .await;
    }
    let completed = h.transport.of_type("quiz_completed");
    assert_eq!(completed.len(), 2);

    h.handle.dispatch(FACILITATOR, Command::BeginRound).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::RoundInProgress);

    let started = h.transport.sent_to(Recipient::Participant(ParticipantId(1)));
    assert!(started.iter().any(|e| e.event_type() == "round_started"));
}

/// Test: a participant who registers after the quiz quorum must also take it
#[tokio::test(start_paused = true)]
async fn test_late_registration_reopens_quiz_gate() {
    let round = RoundConfig {
        quiz_enabled: true,
        ..quiet_round(5)
    };
    let h = start(vec![round], 1).await;
    let quiz = || Command::QuizResponse {
        correct_answers: 2,
        incorrect_questions: vec![],
    };

    h.handle.dispatch(ParticipantId(1), quiz()).await;
    h.handle.dispatch(ParticipantId(2), Command::Register).await;
    h.handle.dispatch(FACILITATOR, Command::BeginRound).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::Waiting);
    assert_eq!(h.handle.participants().await.len(), 2);
    let notes = h.transport.sent_to(Recipient::Facilitator);
    assert!(notes.iter().any(|e| matches!(
        e,
        ServerEvent::FacilitatorMessage { text } if text.contains("1 of 2 quizzes")
    )));

    h.handle.dispatch(ParticipantId(2), quiz()).await;
    h.handle.dispatch(FACILITATOR, Command::BeginRound).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::RoundInProgress);
}

/// Test: a disconnect that shrinks the registry completes a waiting quorum
#[tokio::test(start_paused = true)]
async fn test_disconnect_completes_quiz_quorum() {
    let round = RoundConfig {
        quiz_enabled: true,
        ..quiet_round(5)
    };
    let h = start(vec![round], 3).await;
    h.handle.start_round();

    h.handle
        .dispatch(
            ParticipantId(1),
            Command::QuizResponse {
                correct_answers: 1,
                incorrect_questions: vec!["q2".into()],
            },
        )
        .await;
    h.handle.dispatch(ParticipantId(2), Command::Disconnect).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::Waiting);

    h.handle.dispatch(ParticipantId(3), Command::Disconnect).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::RoundInProgress);
}

/// Test: everyone leaving releases the gate instead of deadlocking
#[tokio::test(start_paused = true)]
async fn test_everyone_disconnecting_releases_gate() {
    let round = RoundConfig {
        quiz_enabled: true,
        ..quiet_round(1)
    };
    let h = start(vec![round], 2).await;
    h.handle.start_round();

    h.handle.dispatch(ParticipantId(1), Command::Disconnect).await;
    h.handle.dispatch(ParticipantId(2), Command::Disconnect).await;
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::RoundInProgress);

    sleep(Duration::from_secs(3)).await;
    let result = tokio::time::timeout(Duration::from_secs(1), h.run)
        .await
        .expect("experiment should finish")
        .unwrap();
    assert!(result.is_ok());
}

/// Test: the round is finalized only after every post-round sheet arrives
#[tokio::test(start_paused = true)]
async fn test_post_round_sanctions_finalize_after_quorum() {
    let round = RoundConfig {
        post_round_sanctioning_enabled: true,
        sanction_cost: 1,
        sanction_penalty: 2,
        clients_per_group: 3,
        ..quiet_round(2)
    };
    let h = start(vec![round], 3).await;
    h.handle.start_round();
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::RoundInProgress);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(phase(&h.handle).await, RoundPhase::Waiting);
    assert!(h.log.records_of("round_summary").is_empty());

    {
        let state = h.handle.state();
        let mut state = state.lock().await;
        for n in 1..=3 {
            state
                .registry_mut()
                .get_mut(ParticipantId(n))
                .unwrap()
                .current_tokens = 10;
        }
    }

    let sheet = |target: u32, points: u32| PostRoundSanctions {
        points: vec![SanctionPoints {
            target: ParticipantId(target),
            points,
        }],
    };
    h.handle
        .dispatch(ParticipantId(1), Command::PostRoundSanction { sanctions: sheet(2, 2) })
        .await;
    h.handle
        .dispatch(ParticipantId(2), Command::PostRoundSanction { sanctions: sheet(3, 0) })
        .await;
    settle().await;
    assert!(h.log.records_of("round_summary").is_empty());

    h.handle
        .dispatch(ParticipantId(3), Command::PostRoundSanction { sanctions: sheet(1, 0) })
        .await;
    settle().await;

    let summaries = h.log.records_of("round_summary");
    assert_eq!(summaries.len(), 1);
    let PersistedRecord::RoundSummary(summary) = &summaries[0] else {
        panic!("expected a round summary");
    };
    let tokens = |id: u32| {
        summary
            .participants
            .iter()
            .find(|p| p.id == ParticipantId(id))
            .unwrap()
            .current_tokens
    };
    assert_eq!(tokens(1), 8);
    assert_eq!(tokens(2), 6);
    assert_eq!(tokens(3), 10);

    let updates = h.transport.of_type("post_round_update");
    assert_eq!(updates.len(), 3);
    assert_eq!(h.transport.of_type("sanction_summary").len(), 1);

    // Cleanup folded the round into the running totals.
    let state = h.handle.state();
    let state = state.lock().await;
    let p2 = state.registry().get(ParticipantId(2)).unwrap();
    assert_eq!(p2.current_tokens, 0);
    assert_eq!(p2.total_tokens, 6);
}

/// Test: a skipped post-round phase finalizes without any sheets
#[tokio::test(start_paused = true)]
async fn test_skip_post_round_sanction() {
    let round = RoundConfig {
        post_round_sanctioning_enabled: true,
        ..quiet_round(1)
    };
    let h = start(vec![round], 2).await;
    h.handle.start_round();
    sleep(Duration::from_secs(2)).await;
    assert!(h.log.records_of("round_summary").is_empty());

    h.handle.skip_post_round_sanction();
    settle().await;
    assert_eq!(h.log.records_of("round_summary").len(), 1);
}

/// Test: the loop walks the whole schedule and stops in Waiting
#[tokio::test(start_paused = true)]
async fn test_runs_every_round_then_stops() {
    let rounds = vec![quiet_round(1), quiet_round(1), quiet_round(1)];
    let h = start(rounds, 2).await;

    for round_number in 0..3usize {
        h.handle.dispatch(FACILITATOR, Command::BeginRound).await;
        settle().await;
        {
            let state = h.handle.state();
            let state = state.lock().await;
            assert_eq!(state.phase(), RoundPhase::RoundInProgress);
            assert_eq!(state.round_number(), round_number);
        }
        // Round length plus the post-round pause.
        sleep(Duration::from_millis(1_600)).await;
    }

    let result = tokio::time::timeout(Duration::from_secs(1), h.run)
        .await
        .expect("experiment should finish")
        .unwrap();
    assert!(result.is_ok());

    let state = h.handle.state();
    let state = state.lock().await;
    assert_eq!(state.phase(), RoundPhase::Waiting);
    assert_eq!(state.phase_machine().rounds_started(), 3);
    assert_eq!(state.phase_machine().transitions().len(), 6);
    assert_eq!(h.log.records_of("round_summary").len(), 3);

    // Configuration for rounds 1 and 2 went to every participant.
    let configurations = h
        .transport
        .sent_to(Recipient::Participant(ParticipantId(1)))
        .into_iter()
        .filter(|e| e.event_type() == "configuration")
        .count();
    assert_eq!(configurations, 3);
}

/// Test: the facilitator can end a round early
#[tokio::test(start_paused = true)]
async fn test_facilitator_ends_round_early() {
    let h = start(vec![quiet_round(600)], 2).await;
    h.handle.start_round();
    settle().await;
    assert_eq!(phase(&h.handle).await, RoundPhase::RoundInProgress);

    h.handle.dispatch(FACILITATOR, Command::EndRound).await;
    sleep(Duration::from_millis(200)).await;
    assert_eq!(phase(&h.handle).await, RoundPhase::Waiting);
    assert_eq!(h.transport.of_type("end_round_summary").len(), 2);
    assert_eq!(h.transport.of_type("facilitator_end_round").len(), 1);
}

/// Test: registration closes once the first round has started
#[tokio::test(start_paused = true)]
async fn test_registration_closes_after_first_round() {
    let h = start(vec![quiet_round(5)], 1).await;
    h.handle.start_round();
    settle().await;

    let late = h
        .handle
        .submit(foraging_coordination::Inbound::new(ParticipantId(9), Command::Register))
        .await;
    assert!(matches!(
        late,
        Err(foraging_coordination::CoordinatorError::ExperimentStarted(_))
    ));
    assert_eq!(h.handle.participants().await, vec![ParticipantId(1)]);
}
