//! Inbound commands, outbound events and the event bus
//!
//! # Architecture
//!
//! 1. **Commands** (`commands.rs`): typed inbound messages, one
//!    [`CommandKind`] per handler in the round state's dispatch table.
//!
//! 2. **Event Types** (`types.rs`): outbound [`ServerEvent`]s addressed to a
//!    [`Recipient`].
//!
//! 3. **Snapshots** (`snapshot.rs`): owned views of group state for full and
//!    delta synchronization.
//!
//! 4. **Event Bus** (`bus.rs`): Tokio broadcast of addressed envelopes; the
//!    default [`Transport`](crate::transport::Transport).
//!
//! # Event Flow
//!
//! ```text
//! ┌──────────────┐  Inbound   ┌──────────────┐  transmit  ┌──────────────┐
//! │  Connection  │──────────▶│  RoundState  │──────────▶│  Event Bus   │
//! │   (decode)   │            │  (dispatch)  │            │ (broadcast)  │
//! └──────────────┘            └──────────────┘            └──────┬───────┘
//!                                                                │ filter
//!                                                                ▼
//!                                                         ┌──────────────┐
//!                                                         │  Connection  │
//!                                                         │   (encode)   │
//!                                                         └──────────────┘
//! ```

pub mod bus;
pub mod commands;
pub mod snapshot;
pub mod types;

pub use bus::{EventBus, FilteredReceiver, RecipientFilter, SharedEventBus};
pub use commands::{Command, CommandKind, Inbound, Screen};
pub use snapshot::{
    FacilitatorSnapshot, GroupDelta, GroupSnapshot, ParticipantSummary, ParticipantView,
};
pub use types::{Envelope, Recipient, SanctionSummaryEntry, ServerEvent};
