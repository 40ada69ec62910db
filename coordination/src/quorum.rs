//! Quorum Gates: barriers that hold a round transition until enough
//! participants have reported in.
//!
//! A gate is opened once per phase, counts arrivals from the ingestion path,
//! and wakes the scheduling task when the count reaches its expectation.
//! The scheduling task waits without holding the round-state lock.
//!
//! # Liveness
//!
//! A `Live` expectation is re-read from the registry on every evaluation, so
//! a disconnect that shrinks the registry can satisfy a gate that was already
//! waiting. [`QuorumGate::settle`] performs that re-evaluation, and
//! [`QuorumGate::withdraw`] takes back the arrival of someone who left.
//! Growth works the other way: [`QuorumGate::admit`] clears a latch that the
//! larger registry no longer meets, unless the gate was forced.
//!
//! ```text
//!  open(Live) ──▶ arrive(live) ... received >= live ──▶ satisfied ──▶ notify
//!                      ▲
//!  disconnect ─▶ withdraw? ─▶ settle(live) (live may now be <= received)
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

/// How many arrivals a gate needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// A fixed count, e.g. one facilitator signal
    Fixed(usize),
    /// The live registry size at evaluation time
    Live,
}

impl Expectation {
    fn resolve(self, live: usize) -> usize {
        match self {
            Self::Fixed(n) => n,
            Self::Live => live,
        }
    }
}

#[derive(Debug)]
struct GateState {
    expectation: Expectation,
    received: usize,
    satisfied: bool,
    forced: bool,
    open: bool,
}

/// Reusable quorum barrier
#[derive(Debug)]
pub struct QuorumGate {
    name: &'static str,
    state: Mutex<GateState>,
    notify: Notify,
}

impl QuorumGate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState {
                expectation: Expectation::Live,
                received: 0,
                satisfied: false,
                forced: false,
                open: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // Gate state is plain counters; a poisoned lock still holds valid data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a new phase: reset the count and clear the latch.
    pub fn open(&self, expectation: Expectation) {
        let mut state = self.lock();
        state.expectation = expectation;
        state.received = 0;
        state.satisfied = false;
        state.forced = false;
        state.open = true;
        debug!(gate = self.name, ?expectation, "Gate opened");
    }

    /// Count one arrival. Returns true if this arrival satisfied the gate.
    /// Arrivals at a gate that was never opened are ignored.
    pub fn arrive(&self, live: usize) -> bool {
        let mut state = self.lock();
        if !state.open || state.satisfied {
            return false;
        }
        state.received += 1;
        self.evaluate(&mut state, live)
    }

    /// Take back one arrival from a participant who disconnected.
    pub fn withdraw(&self) {
        let mut state = self.lock();
        if state.open && !state.satisfied && state.received > 0 {
            state.received -= 1;
        }
    }

    /// Re-evaluate against the current live count without counting an arrival.
    pub fn settle(&self, live: usize) -> bool {
        let mut state = self.lock();
        if !state.open || state.satisfied {
            return false;
        }
        self.evaluate(&mut state, live)
    }

    /// Re-evaluate after the registry grew. Returns true if the latch was
    /// cleared because the new participant has not arrived yet.
    pub fn admit(&self, live: usize) -> bool {
        let mut state = self.lock();
        if !state.open || !state.satisfied || state.forced {
            return false;
        }
        let expected = state.expectation.resolve(live);
        if state.received >= expected {
            return false;
        }
        state.satisfied = false;
        debug!(
            gate = self.name,
            received = state.received,
            expected,
            "Gate reopened"
        );
        true
    }

    /// Latch the gate regardless of arrivals.
    pub fn force(&self) {
        let mut state = self.lock();
        state.forced = true;
        if !state.satisfied {
            state.satisfied = true;
            debug!(gate = self.name, received = state.received, "Gate forced");
            self.notify.notify_one();
        }
    }

    fn evaluate(&self, state: &mut GateState, live: usize) -> bool {
        let expected = state.expectation.resolve(live);
        if state.received >= expected {
            state.satisfied = true;
            debug!(
                gate = self.name,
                received = state.received,
                expected,
                "Gate satisfied"
            );
            self.notify.notify_one();
            true
        } else {
            false
        }
    }

    pub fn is_satisfied(&self) -> bool {
        self.lock().satisfied
    }

    /// Open and still counting arrivals.
    pub fn is_collecting(&self) -> bool {
        let state = self.lock();
        state.open && !state.satisfied
    }

    pub fn received(&self) -> usize {
        self.lock().received
    }

    /// Suspend until the gate is satisfied. Returns at once if it already is.
    pub async fn wait_until_satisfied(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_satisfied() {
                return;
            }
            notified.await;
        }
    }
}

/// The four gates a round can suspend on
#[derive(Debug)]
pub struct PhaseGates {
    pub quiz: QuorumGate,
    pub begin_round: QuorumGate,
    pub post_round_sanction: QuorumGate,
    pub agent_design: QuorumGate,
}

impl PhaseGates {
    pub fn new() -> Self {
        Self {
            quiz: QuorumGate::new("quiz"),
            begin_round: QuorumGate::new("begin_round"),
            post_round_sanction: QuorumGate::new("post_round_sanction"),
            agent_design: QuorumGate::new("agent_design"),
        }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn all(&self) -> [&QuorumGate; 4] {
        [
            &self.quiz,
            &self.begin_round,
            &self.post_round_sanction,
            &self.agent_design,
        ]
    }

    /// Open the gates that precede a round.
    pub fn open_pre_round(&self) {
        self.quiz.open(Expectation::Live);
        self.begin_round.open(Expectation::Fixed(1));
        self.agent_design.open(Expectation::Live);
    }

    /// Re-evaluate every open gate after the registry grew.
    pub fn admit_all(&self, live: usize) {
        for gate in self.all() {
            gate.admit(live);
        }
    }

    /// Re-evaluate every open gate after the registry shrank.
    pub fn settle_all(&self, live: usize) {
        for gate in self.all() {
            gate.settle(live);
        }
    }
}

impl Default for PhaseGates {
    fn default() -> Self {
        Self::new()
    }
}
