//! Round lifecycle
//!
//! - [`state_machine`]: phases and legal transitions
//! - [`timer`]: round countdown and per-second ticks
//! - [`state`]: shared round state and command handlers
//! - [`processor`]: per-tick work for the 2D and 3D environments

pub mod processor;
pub mod state;
pub mod state_machine;
pub mod timer;

pub use processor::full_sync_slot;
pub use state::{RoundCounters, RoundState, WaitPlan};
pub use state_machine::{IllegalTransition, PhaseMachine, RoundPhase, TransitionRecord};
pub use timer::{RoundTimer, SecondTick};
