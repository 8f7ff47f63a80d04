//! Per-track turn engine: a pure reducer over LLM stream events, tool
//! completion messages, and operator approvals.
//!
//! The reducer owns no channels and performs no I/O. The track owner
//! feeds it inputs, persists the returned entries, and hands the returned
//! [`Action`]s to an executor (which uses the [`scheduler`](crate::scheduler)
//! for tool dispatch). That split is what lets the whole state machine be
//! tested as plain data.

mod action;
mod reducer;
mod state;

pub use action::{Action, LlmParams};
pub use reducer::{StartTurn, TurnEngine, TurnError, TurnOutput};
pub use state::{
    EntryKind, InvocationStatus, LlmEvent, StopReason, TimelineEntry, ToolInvocation, TurnState,
    TurnStatus,
};
