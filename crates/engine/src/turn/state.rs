//! Turn state: the data the reducer folds over.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redlab_domain::{CommandId, EntryId, ToolCall};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Statuses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Idle,
    /// Turn created, first LLM response not yet streaming.
    Pending,
    Streaming,
    PendingApproval,
    ExecutingTools,
    Finished,
    Error,
    Cancelled,
}

impl TurnStatus {
    /// Active turns can be cancelled; inactive ones reject further input.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TurnStatus::Pending
                | TurnStatus::Streaming
                | TurnStatus::PendingApproval
                | TurnStatus::ExecutingTools
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    Approved,
    Denied,
    Executing,
    Success,
    Error,
    Cancelled,
    Timeout,
}

impl InvocationStatus {
    /// Terminal statuses are never changed again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationStatus::Success
                | InvocationStatus::Error
                | InvocationStatus::Denied
                | InvocationStatus::Cancelled
                | InvocationStatus::Timeout
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<CommandId>,
    /// Result text or error message shown to the agent on continuation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// A new chat timeline entry produced by a reducer call. The caller
/// persists these; persistence is the one effect not modeled as an
/// [`Action`](super::action::Action).
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub id: EntryId,
    pub position: i64,
    pub kind: EntryKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    UserMessage { text: String },
    AssistantText { text: String },
    ToolCall { call_id: String, name: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Typed events from the LLM provider adapter (a collaborator; the
/// reducer never parses provider wire formats).
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// The stream opened; `llm_ref` is the opaque handle a cancel severs.
    Started { llm_ref: String },
    BlockStart { index: u32 },
    Delta { index: u32, text: String },
    BlockStop { index: u32 },
    ToolCall(ToolCall),
    Complete {
        stop_reason: StopReason,
        cache_context: Option<String>,
    },
    Error { message: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-track turn record, perpetually reused: only the fields cycle.
#[derive(Debug, Clone, Default)]
pub struct TurnState {
    pub status: TurnStatus,
    pub turn_id: Option<String>,
    pub model: Option<String>,
    pub llm_ref: Option<String>,
    /// Monotonic position of the latest timeline entry.
    pub position: i64,
    pub invocations: BTreeMap<EntryId, ToolInvocation>,
    /// Inverse lookup for out-of-band command completions.
    pub command_to_entry: HashMap<CommandId, EntryId>,
    pub last_cache_context: Option<String>,
    pub stop_reason: Option<StopReason>,
    /// Streaming blocks currently open, by provider block index.
    pub open_blocks: HashMap<u32, EntryId>,
}

impl Default for TurnStatus {
    fn default() -> Self {
        TurnStatus::Idle
    }
}

impl TurnState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_position(&mut self) -> i64 {
        self.position += 1;
        self.position
    }

    pub fn invocation(&self, entry_id: EntryId) -> Option<&ToolInvocation> {
        self.invocations.get(&entry_id)
    }

    /// All invocations are terminal (vacuously true when there are none).
    pub fn all_invocations_terminal(&self) -> bool {
        self.invocations.values().all(|i| i.status.is_terminal())
    }
}
