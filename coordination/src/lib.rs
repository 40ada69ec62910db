//! Foraging Coordination Library
//!
//! Server-side coordinator for round-based group foraging experiments:
//! - Round lifecycle: Waiting ⇄ RoundInProgress, driven by one scheduling task
//! - Quorum gates that hold transitions until participants report in
//! - Sanction adjudication for the costly and monitor-enforced pathways
//! - Participant registry and group model with monitor rotation
//! - Rule voting and trust-game pairing between rounds
//!
//! # Architecture
//!
//! ```text
//! inbound ─▶ CoordinatorHandle ─▶ Mutex<RoundState> ◀─ Coordinator::run
//!                                      │                    │
//!                                      ▼                    ▼ awaits
//!                                  Transport            PhaseGates
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use foraging_coordination::{
//!     Coordinator, EventBus, EventLog, ExperimentConfig, RoundState,
//! };
//!
//! # async fn demo() -> foraging_coordination::CoordinatorResult<()> {
//! let config = ExperimentConfig::load("experiment.toml")?;
//! let bus = EventBus::new().shared();
//! let state = RoundState::new(config, bus, Box::new(EventLog::in_memory()));
//! let coordinator = Coordinator::new(state);
//! let handle = coordinator.handle();
//! tokio::spawn(async move { coordinator.run().await });
//! # drop(handle);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod coordinator;
pub mod decisions;
pub mod dispenser;
pub mod error;
pub mod events;
pub mod groups;
pub mod persistence;
pub mod quorum;
pub mod registry;
pub mod round;
pub mod sanction;
pub mod transport;

// Re-export configuration types
pub use config::{Environment, ExperimentConfig, RoundConfig};

// Re-export error types
pub use error::{CoordinatorError, CoordinatorResult};

// Re-export coordinator types
pub use coordinator::{Coordinator, CoordinatorHandle, SharedRoundState};

// Re-export round lifecycle types
pub use round::{
    IllegalTransition, PhaseMachine, RoundCounters, RoundPhase, RoundState, RoundTimer,
    TransitionRecord, WaitPlan,
};

// Re-export quorum types
pub use quorum::{Expectation, PhaseGates, QuorumGate};

// Re-export registry and group types
pub use groups::{EnforcementMechanism, Group, GroupId, GroupModel, SanctionMechanism};
pub use registry::{ClientRegistry, Participant, ParticipantId, Position};

// Re-export sanction types
pub use sanction::{
    adjudicate, PostRoundSanctions, RejectReason, SanctionContext, SanctionDecision,
    SanctionRequest,
};

// Re-export collective decision types
pub use decisions::{Rule, RuleSelection, TrustGameResult};

// Re-export event and transport types
pub use events::{
    Command, Envelope, EventBus, Inbound, Recipient, ServerEvent, SharedEventBus,
};
pub use transport::{MemoryTransport, SharedTransport, Transport};

// Re-export persistence types
pub use persistence::{EventLog, PersistedRecord, Persister, RoundSummary};
