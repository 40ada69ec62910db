//! Coordinator: the scheduling loop that drives rounds.
//!
//! One long-running task walks the round lifecycle:
//!
//! ```text
//! Waiting ─▶ [agent design] ─▶ [quiz] ─▶ begin ─▶ RoundInProgress
//!    ▲                                                 │ timer expires
//!    │                                                 ▼
//!    └── pause ◀── finalize ◀── [post-round sanction] ◀┘
//! ```
//!
//! Gates are awaited without holding the state lock, so inbound commands
//! keep flowing while the loop is suspended. Ingestion goes through a
//! [`CoordinatorHandle`], which takes the lock for exactly one handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::CoordinatorResult;
use crate::events::{Command, Inbound};
use crate::quorum::PhaseGates;
use crate::registry::ParticipantId;
use crate::round::RoundState;

/// Round state shared between the loop and the ingestion path
pub type SharedRoundState = Arc<Mutex<RoundState>>;

/// Drives the experiment from the first round to the last
pub struct Coordinator {
    state: SharedRoundState,
    gates: Arc<PhaseGates>,
    tick: Duration,
    pause: Duration,
}

impl Coordinator {
    pub fn new(state: RoundState) -> Self {
        let gates = state.gates();
        let tick = state.config().tick_interval();
        let pause = state.config().post_round_pause();
        Self {
            state: Arc::new(Mutex::new(state)),
            gates,
            tick,
            pause,
        }
    }

    /// A cloneable handle for the ingestion path and facilitator tooling.
    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            state: self.state.clone(),
            gates: self.gates.clone(),
        }
    }

    /// Run every configured round, then return. The state stays in Waiting.
    pub async fn run(&self) -> CoordinatorResult<()> {
        loop {
            let plan = self.state.lock().await.prepare_waiting();

            if plan.agent_design {
                debug!("Waiting for agent designs");
                self.gates.agent_design.wait_until_satisfied().await;
            }
            if plan.quiz {
                debug!("Waiting for quizzes");
                self.gates.quiz.wait_until_satisfied().await;
            }
            debug!("Waiting for begin round");
            self.gates.begin_round.wait_until_satisfied().await;

            self.state.lock().await.start_round()?;
            self.run_round().await;

            let post_round = self.state.lock().await.end_round()?;
            if post_round {
                debug!("Waiting for post-round sanctions");
                self.gates.post_round_sanction.wait_until_satisfied().await;
                self.state.lock().await.apply_post_round_sanctions();
            }
            self.state.lock().await.finalize_round();

            sleep(self.pause).await;
            if !self.state.lock().await.advance_round() {
                info!("Experiment complete");
                return Ok(());
            }
        }
    }

    async fn run_round(&self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let mut state = self.state.lock().await;
            if state.round_expired() {
                return;
            }
            state.process_tick();
        }
    }
}

/// Ingestion and facilitator entry points
#[derive(Clone)]
pub struct CoordinatorHandle {
    state: SharedRoundState,
    gates: Arc<PhaseGates>,
}

impl CoordinatorHandle {
    /// Handle one inbound command, logging any rejection.
    pub async fn dispatch(&self, from: ParticipantId, command: Command) {
        self.state.lock().await.dispatch(Inbound::new(from, command));
    }

    /// Handle one inbound command and return the outcome.
    pub async fn submit(&self, inbound: Inbound) -> CoordinatorResult<()> {
        self.state.lock().await.handle(inbound)
    }

    /// Release the quiz gate without waiting for stragglers.
    pub fn skip_quiz(&self) {
        info!("Skipping quiz");
        self.gates.quiz.force();
    }

    /// Start the round without a facilitator begin.
    pub fn start_round(&self) {
        info!("Starting round");
        self.gates.begin_round.force();
    }

    pub fn skip_post_round_sanction(&self) {
        info!("Skipping post-round sanctioning");
        self.gates.post_round_sanction.force();
    }

    /// Release every gate except the begin signal.
    pub fn skip(&self) {
        self.gates.agent_design.force();
        self.skip_quiz();
        self.skip_post_round_sanction();
    }

    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.state.lock().await.registry().ids()
    }

    pub fn state(&self) -> SharedRoundState {
        self.state.clone()
    }
}
