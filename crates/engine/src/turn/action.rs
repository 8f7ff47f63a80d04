//! Effect descriptors returned by the reducer.
//!
//! The reducer performs no I/O; an outer action executor carries these
//! out. Keeping effects as data is what makes the turn state machine
//! property-testable in isolation.

use redlab_domain::{CommandId, EntryId, ToolCall};

use super::state::{InvocationStatus, TurnStatus};

/// Parameters for an LLM request, deliberately lazy: the executor
/// assembles the request body only after the new timeline entries have
/// been persisted, so the first prompt is never missing from the
/// rendered history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LlmParams {
    pub model: Option<String>,
    /// Render the timeline through this position into the request.
    pub through_position: i64,
    /// Provider cache handle from the previous stream, if any.
    pub cache_context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Action {
    UpdateTurnStatus(TurnStatus),

    /// Open a new LLM stream (initial request or continuation after
    /// tools). Never emitted by a cancelled turn.
    StartLlm(LlmParams),

    /// Submit a console command for this invocation.
    SendMsfCommand { entry_id: EntryId, text: String },

    /// Submit a one-shot shell command for this invocation.
    SendBashCommand { entry_id: EntryId, text: String },

    /// Run a non-command tool (query, memory update) for this invocation.
    ExecuteTool { entry_id: EntryId, call: ToolCall },

    /// Persist and broadcast an invocation status change.
    UpdateToolStatus {
        entry_id: EntryId,
        status: InvocationStatus,
        message: Option<String>,
        command_id: Option<CommandId>,
    },

    /// Append streamed text to an existing assistant entry.
    AppendEntryText { entry_id: EntryId, text: String },

    /// Push the new chat state to subscribers.
    BroadcastChatState,
}

impl Action {
    /// True for the actions a cancelled turn must never emit.
    pub fn drives_execution(&self) -> bool {
        matches!(
            self,
            Action::StartLlm(_)
                | Action::SendMsfCommand { .. }
                | Action::SendBashCommand { .. }
                | Action::ExecuteTool { .. }
        )
    }
}
