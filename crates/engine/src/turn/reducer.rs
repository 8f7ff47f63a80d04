//! The turn reducer.
//!
//! Every public method takes the current state by reference and returns
//! `{new_state, new_entries, actions}` without performing any I/O. The
//! reconcile pass runs after each applied input and is the single place
//! that decides what executes next:
//!
//! - approved invocations dispatch even while siblings await approval;
//!   the turn parks in `pending_approval` only when approvals are the
//!   sole blocker;
//! - within a sequential mutex group at most one invocation executes at
//!   a time, in entry order;
//! - un-mutexed approved invocations all start concurrently;
//! - once every invocation is terminal the turn either continues with a
//!   new LLM request or finishes, depending on the stream's stop reason;
//! - a cancelled turn never produces another execution-driving action,
//!   even when stragglers report in later.

use std::collections::HashSet;

use chrono::Utc;
use uuid::Uuid;

use redlab_domain::{EntryId, ToolCall, ToolError, ToolRegistry};

use crate::scheduler::{ToolStatus, ToolStatusUpdate};

use super::action::{Action, LlmParams};
use super::state::{
    EntryKind, InvocationStatus, LlmEvent, StopReason, TimelineEntry, ToolInvocation, TurnState,
    TurnStatus,
};

const CANCEL_MESSAGE: &str = "User cancelled the execution";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("a turn is already active")]
    TurnActive,
    #[error("no active turn")]
    NoActiveTurn,
}

/// Input to [`TurnEngine::start_turn`].
#[derive(Debug, Clone)]
pub struct StartTurn {
    pub user_text: String,
    pub model: Option<String>,
}

/// Result of one reducer call.
#[derive(Debug)]
pub struct TurnOutput {
    pub state: TurnState,
    pub new_entries: Vec<TimelineEntry>,
    pub actions: Vec<Action>,
}

/// Per-track reducer. Holds only configuration; all mutable state lives
/// in the [`TurnState`] the caller owns.
pub struct TurnEngine {
    registry: ToolRegistry,
    /// Autonomous tracks skip the approval gate for every tool.
    autonomous: bool,
}

impl TurnEngine {
    pub fn new(registry: ToolRegistry, autonomous: bool) -> Self {
        Self {
            registry,
            autonomous,
        }
    }

    // ── start a turn ───────────────────────────────────────────────

    pub fn start_turn(&self, state: &TurnState, req: StartTurn) -> Result<TurnOutput, TurnError> {
        if state.status.is_active() {
            return Err(TurnError::TurnActive);
        }

        let mut state = state.clone();
        state.turn_id = Some(Uuid::new_v4().to_string());
        state.model = req.model.clone();
        state.llm_ref = None;
        state.stop_reason = None;
        state.invocations.clear();
        state.command_to_entry.clear();
        state.open_blocks.clear();

        let position = state.next_position();
        let entry = TimelineEntry {
            id: EntryId(position),
            position,
            kind: EntryKind::UserMessage {
                text: req.user_text,
            },
        };

        let mut actions = Vec::new();
        set_status(&mut state, &mut actions, TurnStatus::Pending);
        actions.push(Action::StartLlm(LlmParams {
            model: req.model,
            through_position: position,
            cache_context: state.last_cache_context.clone(),
        }));
        actions.push(Action::BroadcastChatState);

        Ok(TurnOutput {
            state,
            new_entries: vec![entry],
            actions,
        })
    }

    // ── LLM stream events ──────────────────────────────────────────

    pub fn on_llm_event(&self, state: &TurnState, event: LlmEvent) -> TurnOutput {
        let mut state = state.clone();
        let mut entries = Vec::new();
        let mut actions = Vec::new();

        // A cancelled or errored turn ignores the rest of its stream.
        if !state.status.is_active() {
            return TurnOutput {
                state,
                new_entries: entries,
                actions,
            };
        }

        match event {
            LlmEvent::Started { llm_ref } => {
                state.llm_ref = Some(llm_ref);
                set_status(&mut state, &mut actions, TurnStatus::Streaming);
                actions.push(Action::BroadcastChatState);
            }
            LlmEvent::BlockStart { index } => {
                let position = state.next_position();
                let entry_id = EntryId(position);
                state.open_blocks.insert(index, entry_id);
                entries.push(TimelineEntry {
                    id: entry_id,
                    position,
                    kind: EntryKind::AssistantText {
                        text: String::new(),
                    },
                });
                actions.push(Action::BroadcastChatState);
            }
            LlmEvent::Delta { index, text } => {
                if let Some(entry_id) = state.open_blocks.get(&index) {
                    actions.push(Action::AppendEntryText {
                        entry_id: *entry_id,
                        text,
                    });
                }
            }
            LlmEvent::BlockStop { index } => {
                state.open_blocks.remove(&index);
                actions.push(Action::BroadcastChatState);
            }
            LlmEvent::ToolCall(call) => {
                self.add_invocation(&mut state, &mut entries, &mut actions, call);
                self.reconcile(&mut state, &mut actions);
                actions.push(Action::BroadcastChatState);
            }
            LlmEvent::Complete {
                stop_reason,
                cache_context,
            } => {
                state.llm_ref = None;
                state.stop_reason = Some(stop_reason);
                if cache_context.is_some() {
                    state.last_cache_context = cache_context;
                }
                state.open_blocks.clear();
                self.reconcile(&mut state, &mut actions);
                actions.push(Action::BroadcastChatState);
            }
            LlmEvent::Error { message } => {
                tracing::warn!(error = %message, "llm stream errored");
                state.llm_ref = None;
                set_status(&mut state, &mut actions, TurnStatus::Error);
                actions.push(Action::BroadcastChatState);
            }
        }

        TurnOutput {
            state,
            new_entries: entries,
            actions,
        }
    }

    fn add_invocation(
        &self,
        state: &mut TurnState,
        entries: &mut Vec<TimelineEntry>,
        actions: &mut Vec<Action>,
        call: ToolCall,
    ) {
        let position = state.next_position();
        let entry_id = EntryId(position);

        let (status, result) = match self.registry.get(&call.tool_name) {
            None => (
                InvocationStatus::Error,
                Some(ToolError::UnknownTool(call.tool_name.clone()).to_string()),
            ),
            Some(descriptor) if !descriptor.approval_required || self.autonomous => {
                (InvocationStatus::Approved, None)
            }
            Some(_) => (InvocationStatus::Pending, None),
        };

        entries.push(TimelineEntry {
            id: entry_id,
            position,
            kind: EntryKind::ToolCall {
                call_id: call.call_id.clone(),
                name: call.tool_name.clone(),
            },
        });
        actions.push(Action::UpdateToolStatus {
            entry_id,
            status,
            message: result.clone(),
            command_id: None,
        });
        state.invocations.insert(
            entry_id,
            ToolInvocation {
                call_id: call.call_id,
                name: call.tool_name,
                arguments: call.arguments,
                status,
                command_id: None,
                result,
                started_at: Utc::now(),
            },
        );
    }

    // ── tool status messages ───────────────────────────────────────

    pub fn on_tool_update(&self, state: &TurnState, update: ToolStatusUpdate) -> TurnOutput {
        let mut state = state.clone();
        let mut actions = Vec::new();
        let entry_id = update.entry_id;

        match update.status {
            ToolStatus::Executing => {
                let mut marked = false;
                if let Some(invocation) = state.invocations.get_mut(&entry_id) {
                    if !invocation.status.is_terminal()
                        && invocation.status != InvocationStatus::Executing
                    {
                        invocation.status = InvocationStatus::Executing;
                        actions.push(Action::UpdateToolStatus {
                            entry_id,
                            status: InvocationStatus::Executing,
                            message: None,
                            command_id: invocation.command_id.clone(),
                        });
                        marked = true;
                    }
                }
                if marked && state.status.is_active() {
                    set_status(&mut state, &mut actions, TurnStatus::ExecutingTools);
                }
            }
            ToolStatus::Async(command_id) => {
                let cancelled = state.status == TurnStatus::Cancelled;
                if let Some(invocation) = state.invocations.get_mut(&entry_id) {
                    invocation.command_id = Some(command_id.clone());
                    if !cancelled {
                        state.command_to_entry.insert(command_id.clone(), entry_id);
                    }
                    actions.push(Action::UpdateToolStatus {
                        entry_id,
                        status: InvocationStatus::Executing,
                        message: None,
                        command_id: Some(command_id),
                    });
                }
            }
            ToolStatus::Success(value) => {
                self.complete_invocation(
                    &mut state,
                    &mut actions,
                    entry_id,
                    InvocationStatus::Success,
                    render_result(&value),
                );
            }
            ToolStatus::Error(error) => {
                self.complete_invocation(
                    &mut state,
                    &mut actions,
                    entry_id,
                    InvocationStatus::Error,
                    error.to_string(),
                );
            }
            ToolStatus::TimedOut => {
                self.complete_invocation(
                    &mut state,
                    &mut actions,
                    entry_id,
                    InvocationStatus::Timeout,
                    ToolError::Timeout.to_string(),
                );
            }
        }

        if !actions.is_empty() {
            actions.push(Action::BroadcastChatState);
        }
        TurnOutput {
            state,
            new_entries: Vec::new(),
            actions,
        }
    }

    /// Apply a terminal result. Terminal invocations never change again:
    /// a straggler result for a denied or timed-out invocation is
    /// recognized and dropped.
    fn complete_invocation(
        &self,
        state: &mut TurnState,
        actions: &mut Vec<Action>,
        entry_id: EntryId,
        new_status: InvocationStatus,
        message: String,
    ) {
        let Some(invocation) = state.invocations.get_mut(&entry_id) else {
            return;
        };
        if invocation.status.is_terminal() {
            tracing::debug!(
                entry_id = %entry_id,
                status = ?invocation.status,
                "late result for terminal invocation ignored"
            );
            return;
        }

        invocation.status = new_status;
        invocation.result = Some(message.clone());
        let command_id = invocation.command_id.clone();
        if let Some(command_id) = &command_id {
            state.command_to_entry.remove(command_id);
        }

        actions.push(Action::UpdateToolStatus {
            entry_id,
            status: new_status,
            message: Some(message),
            command_id,
        });
        self.reconcile(state, actions);
    }

    // ── approval ───────────────────────────────────────────────────

    pub fn approve(&self, state: &TurnState, entry_id: EntryId) -> Result<TurnOutput, ToolError> {
        self.resolve_approval(state, entry_id, InvocationStatus::Approved, None)
    }

    pub fn deny(
        &self,
        state: &TurnState,
        entry_id: EntryId,
        reason: &str,
    ) -> Result<TurnOutput, ToolError> {
        self.resolve_approval(
            state,
            entry_id,
            InvocationStatus::Denied,
            Some(reason.to_owned()),
        )
    }

    fn resolve_approval(
        &self,
        state: &TurnState,
        entry_id: EntryId,
        new_status: InvocationStatus,
        message: Option<String>,
    ) -> Result<TurnOutput, ToolError> {
        let mut state = state.clone();
        let invocation = state
            .invocations
            .get_mut(&entry_id)
            .ok_or(ToolError::NotFound)?;
        if invocation.status != InvocationStatus::Pending {
            return Err(ToolError::InvalidStatus);
        }

        invocation.status = new_status;
        invocation.result = message.clone();

        let mut actions = vec![Action::UpdateToolStatus {
            entry_id,
            status: new_status,
            message,
            command_id: None,
        }];
        self.reconcile(&mut state, &mut actions);
        actions.push(Action::BroadcastChatState);

        Ok(TurnOutput {
            state,
            new_entries: Vec::new(),
            actions,
        })
    }

    // ── cancellation ───────────────────────────────────────────────

    /// Cancel the active turn. Pending and approved invocations flip to
    /// `cancelled`; executing ones are left in place because their
    /// in-flight I/O is not aborted; the eventual completion is
    /// recorded without driving anything further.
    pub fn cancel_turn(&self, state: &TurnState) -> Result<TurnOutput, TurnError> {
        if !state.status.is_active() {
            return Err(TurnError::NoActiveTurn);
        }

        let mut state = state.clone();
        let mut actions = Vec::new();

        state.llm_ref = None;
        state.command_to_entry.clear();
        state.open_blocks.clear();

        let entry_ids: Vec<EntryId> = state.invocations.keys().copied().collect();
        for entry_id in entry_ids {
            let Some(invocation) = state.invocations.get_mut(&entry_id) else {
                continue;
            };
            if matches!(
                invocation.status,
                InvocationStatus::Pending | InvocationStatus::Approved
            ) {
                invocation.status = InvocationStatus::Cancelled;
                invocation.result = Some(CANCEL_MESSAGE.to_owned());
                actions.push(Action::UpdateToolStatus {
                    entry_id,
                    status: InvocationStatus::Cancelled,
                    message: Some(CANCEL_MESSAGE.to_owned()),
                    command_id: None,
                });
            }
        }

        set_status(&mut state, &mut actions, TurnStatus::Cancelled);
        actions.push(Action::BroadcastChatState);

        Ok(TurnOutput {
            state,
            new_entries: Vec::new(),
            actions,
        })
    }

    // ── reconcile ──────────────────────────────────────────────────

    fn reconcile(&self, state: &mut TurnState, actions: &mut Vec<Action>) {
        // A cancelled (or otherwise inactive) turn emits nothing more.
        if !state.status.is_active() {
            return;
        }
        // While the stream is open, invocations only accumulate.
        if state.llm_ref.is_some() {
            return;
        }
        if state.stop_reason.is_none() && state.invocations.is_empty() {
            return;
        }

        // Dispatch approved invocations honoring mutex exclusion. Pending
        // siblings do not hold approved ones back: a turn may be executing
        // tools while others still wait for a human.
        let mut busy_mutexes: HashSet<String> = state
            .invocations
            .values()
            .filter(|i| i.status == InvocationStatus::Executing)
            .filter_map(|i| self.mutex_of(&i.name))
            .collect();

        let entry_ids: Vec<EntryId> = state.invocations.keys().copied().collect();
        for entry_id in entry_ids {
            let Some((name, status)) = state
                .invocations
                .get(&entry_id)
                .map(|i| (i.name.clone(), i.status))
            else {
                continue;
            };
            if status != InvocationStatus::Approved {
                continue;
            }
            if let Some(key) = self.mutex_of(&name) {
                if busy_mutexes.contains(&key) {
                    continue;
                }
                busy_mutexes.insert(key);
            }

            let dispatched = self.dispatch_action(state, entry_id);
            let Some(invocation) = state.invocations.get_mut(&entry_id) else {
                continue;
            };
            match dispatched {
                Ok(action) => {
                    invocation.status = InvocationStatus::Executing;
                    actions.push(Action::UpdateToolStatus {
                        entry_id,
                        status: InvocationStatus::Executing,
                        message: None,
                        command_id: None,
                    });
                    actions.push(action);
                }
                Err(error) => {
                    let message = error.to_string();
                    invocation.status = InvocationStatus::Error;
                    invocation.result = Some(message.clone());
                    actions.push(Action::UpdateToolStatus {
                        entry_id,
                        status: InvocationStatus::Error,
                        message: Some(message),
                        command_id: None,
                    });
                }
            }
        }

        if state
            .invocations
            .values()
            .any(|i| i.status == InvocationStatus::Executing)
        {
            set_status(state, actions, TurnStatus::ExecutingTools);
            return;
        }

        if state
            .invocations
            .values()
            .any(|i| i.status == InvocationStatus::Pending)
        {
            set_status(state, actions, TurnStatus::PendingApproval);
            return;
        }

        if state.all_invocations_terminal() {
            match state.stop_reason {
                Some(StopReason::EndTurn) | Some(StopReason::MaxTokens) => {
                    set_status(state, actions, TurnStatus::Finished);
                }
                Some(StopReason::ToolUse) => {
                    actions.push(Action::StartLlm(LlmParams {
                        model: state.model.clone(),
                        through_position: state.position,
                        cache_context: state.last_cache_context.clone(),
                    }));
                    state.stop_reason = None;
                    set_status(state, actions, TurnStatus::Pending);
                }
                None => {}
            }
        }
    }

    fn mutex_of(&self, tool_name: &str) -> Option<String> {
        self.registry.get(tool_name).and_then(|d| d.mutex.clone())
    }

    fn dispatch_action(&self, state: &TurnState, entry_id: EntryId) -> Result<Action, ToolError> {
        let invocation = state
            .invocations
            .get(&entry_id)
            .ok_or(ToolError::NotFound)?;
        if self.registry.get(&invocation.name).is_none() {
            return Err(ToolError::UnknownTool(invocation.name.clone()));
        }

        match invocation.name.as_str() {
            "msf_console" => {
                let text = command_argument(&invocation.arguments)?;
                Ok(Action::SendMsfCommand { entry_id, text })
            }
            "bash" => {
                let text = command_argument(&invocation.arguments)?;
                Ok(Action::SendBashCommand { entry_id, text })
            }
            _ => Ok(Action::ExecuteTool {
                entry_id,
                call: ToolCall {
                    call_id: invocation.call_id.clone(),
                    tool_name: invocation.name.clone(),
                    arguments: invocation.arguments.clone(),
                },
            }),
        }
    }
}

fn command_argument(arguments: &serde_json::Value) -> Result<String, ToolError> {
    arguments
        .get("command")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| ToolError::MissingParameter("command".into()))
}

fn set_status(state: &mut TurnState, actions: &mut Vec<Action>, status: TurnStatus) {
    if state.status != status {
        state.status = status;
        actions.push(Action::UpdateTurnStatus(status));
    }
}

fn render_result(value: &serde_json::Value) -> String {
    value
        .get("output")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .unwrap_or_else(|| value.to_string())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ToolStatus;
    use redlab_domain::CommandId;

    fn engine() -> TurnEngine {
        TurnEngine::new(ToolRegistry::builtin(), false)
    }

    fn autonomous_engine() -> TurnEngine {
        TurnEngine::new(ToolRegistry::builtin(), true)
    }

    fn tool_call(call_id: &str, name: &str, command: &str) -> ToolCall {
        ToolCall {
            call_id: call_id.into(),
            tool_name: name.into(),
            arguments: serde_json::json!({ "command": command }),
        }
    }

    /// Drive a state to `streaming` with an open stream.
    fn streaming_state(engine: &TurnEngine) -> TurnState {
        let state = TurnState::new();
        let out = engine
            .start_turn(
                &state,
                StartTurn {
                    user_text: "scan the target".into(),
                    model: Some("claude".into()),
                },
            )
            .unwrap();
        engine
            .on_llm_event(
                &out.state,
                LlmEvent::Started {
                    llm_ref: "stream-1".into(),
                },
            )
            .state
    }

    /// Feed N tool calls then complete the stream with `tool_use`.
    fn with_tools(engine: &TurnEngine, calls: Vec<ToolCall>) -> (TurnState, Vec<Action>) {
        let mut state = streaming_state(engine);
        for call in calls {
            state = engine.on_llm_event(&state, LlmEvent::ToolCall(call)).state;
        }
        let out = engine.on_llm_event(
            &state,
            LlmEvent::Complete {
                stop_reason: StopReason::ToolUse,
                cache_context: Some("ctx-1".into()),
            },
        );
        (out.state, out.actions)
    }

    fn entry_ids(state: &TurnState) -> Vec<EntryId> {
        state.invocations.keys().copied().collect()
    }

    fn has_start_llm(actions: &[Action]) -> bool {
        actions.iter().any(|a| matches!(a, Action::StartLlm(_)))
    }

    // ── start / stream basics ──────────────────────────────────────

    #[test]
    fn start_turn_emits_lazy_llm_request() {
        let engine = engine();
        let out = engine
            .start_turn(
                &TurnState::new(),
                StartTurn {
                    user_text: "hello".into(),
                    model: None,
                },
            )
            .unwrap();

        assert_eq!(out.state.status, TurnStatus::Pending);
        assert_eq!(out.new_entries.len(), 1);
        assert!(has_start_llm(&out.actions));
        // The request must cover the just-created user entry.
        let llm = out
            .actions
            .iter()
            .find_map(|a| match a {
                Action::StartLlm(params) => Some(params.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(llm.through_position, out.new_entries[0].position);
    }

    #[test]
    fn start_turn_rejected_while_active() {
        let engine = engine();
        let state = streaming_state(&engine);
        let err = engine
            .start_turn(
                &state,
                StartTurn {
                    user_text: "again".into(),
                    model: None,
                },
            )
            .unwrap_err();
        assert_eq!(err, TurnError::TurnActive);
    }

    #[test]
    fn plain_completion_finishes_the_turn() {
        let engine = engine();
        let state = streaming_state(&engine);
        let out = engine.on_llm_event(
            &state,
            LlmEvent::Complete {
                stop_reason: StopReason::EndTurn,
                cache_context: None,
            },
        );
        assert_eq!(out.state.status, TurnStatus::Finished);
        assert!(!has_start_llm(&out.actions));
    }

    // ── approval gate ──────────────────────────────────────────────

    #[test]
    fn approval_required_tool_parks_the_turn() {
        let engine = engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "msf_console", "db_status")]);
        assert_eq!(state.status, TurnStatus::PendingApproval);
        let id = entry_ids(&state)[0];
        assert_eq!(state.invocations[&id].status, InvocationStatus::Pending);
    }

    #[test]
    fn autonomous_mode_skips_approval() {
        let engine = autonomous_engine();
        let (state, actions) =
            with_tools(&engine, vec![tool_call("c1", "msf_console", "db_status")]);
        assert_eq!(state.status, TurnStatus::ExecutingTools);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SendMsfCommand { .. })));
    }

    #[test]
    fn approve_then_deny_is_invalid_status() {
        let engine = engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "msf_console", "db_status")]);
        let id = entry_ids(&state)[0];

        let approved = engine.approve(&state, id).unwrap();
        let err = engine.deny(&approved.state, id, "nope").unwrap_err();
        assert_eq!(err, ToolError::InvalidStatus);
    }

    #[test]
    fn approve_unknown_entry_is_not_found() {
        let engine = engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "msf_console", "db_status")]);
        assert_eq!(
            engine.approve(&state, EntryId(999)).unwrap_err(),
            ToolError::NotFound
        );
    }

    #[test]
    fn deny_is_terminal_and_turn_continues() {
        let engine = engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "msf_console", "db_status")]);
        let id = entry_ids(&state)[0];

        let out = engine.deny(&state, id, "too dangerous").unwrap();
        assert_eq!(out.state.invocations[&id].status, InvocationStatus::Denied);
        // All invocations terminal and stream stopped on tool_use: the
        // agent gets to see the denial.
        assert!(has_start_llm(&out.actions));
    }

    // ── mutex exclusion (I3) ───────────────────────────────────────

    #[test]
    fn sequential_mutex_runs_one_at_a_time() {
        let engine = autonomous_engine();
        let (state, actions) = with_tools(
            &engine,
            vec![
                tool_call("c1", "msf_console", "help"),
                tool_call("c2", "msf_console", "version"),
                tool_call("c3", "bash", "ls"),
                tool_call("c4", "bash", "pwd"),
            ],
        );

        let ids = entry_ids(&state);
        // Console tool 1 executing, console tool 2 still approved.
        assert_eq!(state.invocations[&ids[0]].status, InvocationStatus::Executing);
        assert_eq!(state.invocations[&ids[1]].status, InvocationStatus::Approved);
        // Both shell tools executing concurrently.
        assert_eq!(state.invocations[&ids[2]].status, InvocationStatus::Executing);
        assert_eq!(state.invocations[&ids[3]].status, InvocationStatus::Executing);

        let msf_sends = actions
            .iter()
            .filter(|a| matches!(a, Action::SendMsfCommand { .. }))
            .count();
        let bash_sends = actions
            .iter()
            .filter(|a| matches!(a, Action::SendBashCommand { .. }))
            .count();
        assert_eq!(msf_sends, 1);
        assert_eq!(bash_sends, 2);
    }

    #[test]
    fn next_in_group_starts_when_previous_completes() {
        let engine = autonomous_engine();
        let (state, _) = with_tools(
            &engine,
            vec![
                tool_call("c1", "msf_console", "help"),
                tool_call("c2", "msf_console", "version"),
            ],
        );
        let ids = entry_ids(&state);

        let out = engine.on_tool_update(
            &state,
            ToolStatusUpdate {
                entry_id: ids[0],
                status: ToolStatus::Success(serde_json::json!({ "output": "done" })),
            },
        );
        assert_eq!(
            out.state.invocations[&ids[0]].status,
            InvocationStatus::Success
        );
        assert_eq!(
            out.state.invocations[&ids[1]].status,
            InvocationStatus::Executing
        );
        assert!(out
            .actions
            .iter()
            .any(|a| matches!(a, Action::SendMsfCommand { entry_id, .. } if *entry_id == ids[1])));
    }

    // ── terminality (I4) ───────────────────────────────────────────

    #[test]
    fn terminal_invocation_never_changes() {
        let engine = autonomous_engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "bash", "ls")]);
        let id = entry_ids(&state)[0];

        let timed_out = engine.on_tool_update(
            &state,
            ToolStatusUpdate {
                entry_id: id,
                status: ToolStatus::TimedOut,
            },
        );
        assert_eq!(
            timed_out.state.invocations[&id].status,
            InvocationStatus::Timeout
        );

        // A late success must not overwrite the timeout.
        let late = engine.on_tool_update(
            &timed_out.state,
            ToolStatusUpdate {
                entry_id: id,
                status: ToolStatus::Success(serde_json::json!({ "output": "late" })),
            },
        );
        assert_eq!(
            late.state.invocations[&id].status,
            InvocationStatus::Timeout
        );
        assert!(late.actions.is_empty());
    }

    // ── cancellation (I5, L3) ──────────────────────────────────────

    #[test]
    fn cancel_mid_flight_leaves_executing_in_place() {
        let engine = engine();
        let (state, _) = with_tools(
            &engine,
            vec![
                tool_call("c1", "bash", "sleep 60"),
                tool_call("c2", "msf_console", "help"),
            ],
        );
        let ids = entry_ids(&state);

        // Approve the shell command only; it starts executing while the
        // console tool stays pending.
        let state = engine.approve(&state, ids[0]).unwrap().state;
        assert_eq!(state.invocations[&ids[0]].status, InvocationStatus::Executing);
        assert_eq!(state.invocations[&ids[1]].status, InvocationStatus::Pending);

        let cancelled = engine.cancel_turn(&state).unwrap();
        assert_eq!(cancelled.state.status, TurnStatus::Cancelled);
        assert_eq!(
            cancelled.state.invocations[&ids[1]].status,
            InvocationStatus::Cancelled
        );
        assert_eq!(
            cancelled.state.invocations[&ids[1]].result.as_deref(),
            Some(CANCEL_MESSAGE)
        );
        // The in-flight shell command is not aborted.
        assert_eq!(
            cancelled.state.invocations[&ids[0]].status,
            InvocationStatus::Executing
        );
        assert!(cancelled.state.command_to_entry.is_empty());

        // The straggler result is recorded but drives nothing (I5).
        let late = engine.on_tool_update(
            &cancelled.state,
            ToolStatusUpdate {
                entry_id: ids[0],
                status: ToolStatus::Success(serde_json::json!({ "output": "done" })),
            },
        );
        assert_eq!(
            late.state.invocations[&ids[0]].status,
            InvocationStatus::Success
        );
        assert_eq!(late.state.status, TurnStatus::Cancelled);
        assert!(!late.actions.iter().any(|a| a.drives_execution()));
    }

    #[test]
    fn cancel_inactive_turn_is_rejected() {
        let engine = engine();
        let state = TurnState::new();
        assert_eq!(
            engine.cancel_turn(&state).unwrap_err(),
            TurnError::NoActiveTurn
        );

        let (active, _) = with_tools(&engine, vec![tool_call("c1", "msf_console", "x")]);
        let cancelled = engine.cancel_turn(&active).unwrap();
        assert_eq!(
            engine.cancel_turn(&cancelled.state).unwrap_err(),
            TurnError::NoActiveTurn
        );
    }

    // ── continuation ───────────────────────────────────────────────

    #[test]
    fn all_terminal_with_tool_use_continues_with_cache_context() {
        let engine = autonomous_engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "bash", "ls")]);
        let id = entry_ids(&state)[0];

        let out = engine.on_tool_update(
            &state,
            ToolStatusUpdate {
                entry_id: id,
                status: ToolStatus::Success(serde_json::json!({ "output": "bin etc" })),
            },
        );
        let llm = out
            .actions
            .iter()
            .find_map(|a| match a {
                Action::StartLlm(params) => Some(params.clone()),
                _ => None,
            })
            .expect("continuation request");
        assert_eq!(llm.cache_context.as_deref(), Some("ctx-1"));
        assert_eq!(out.state.status, TurnStatus::Pending);
    }

    #[test]
    fn unknown_tool_errors_without_crashing_the_turn() {
        let engine = engine();
        let mut state = streaming_state(&engine);
        state = engine
            .on_llm_event(
                &state,
                LlmEvent::ToolCall(ToolCall {
                    call_id: "c1".into(),
                    tool_name: "rm_rf_everything".into(),
                    arguments: serde_json::json!({}),
                }),
            )
            .state;
        let out = engine.on_llm_event(
            &state,
            LlmEvent::Complete {
                stop_reason: StopReason::ToolUse,
                cache_context: None,
            },
        );

        let id = entry_ids(&out.state)[0];
        assert_eq!(out.state.invocations[&id].status, InvocationStatus::Error);
        assert!(out.state.invocations[&id]
            .result
            .as_deref()
            .unwrap()
            .contains("Unknown tool"));
        // Error is terminal, so the agent hears about it immediately.
        assert!(has_start_llm(&out.actions));
    }

    #[test]
    fn async_link_is_severed_by_cancel() {
        let engine = autonomous_engine();
        let (state, _) = with_tools(&engine, vec![tool_call("c1", "bash", "ls")]);
        let id = entry_ids(&state)[0];

        let command_id = CommandId::generate();
        let linked = engine.on_tool_update(
            &state,
            ToolStatusUpdate {
                entry_id: id,
                status: ToolStatus::Async(command_id.clone()),
            },
        );
        assert_eq!(
            linked.state.command_to_entry.get(&command_id),
            Some(&id)
        );

        let cancelled = engine.cancel_turn(&linked.state).unwrap();
        assert!(cancelled.state.command_to_entry.is_empty());
        // The invocation itself still remembers its command.
        assert_eq!(
            cancelled.state.invocations[&id].command_id.as_ref(),
            Some(&command_id)
        );
    }

    #[test]
    fn stream_error_deactivates_the_turn() {
        let engine = engine();
        let state = streaming_state(&engine);
        let out = engine.on_llm_event(
            &state,
            LlmEvent::Error {
                message: "overloaded".into(),
            },
        );
        assert_eq!(out.state.status, TurnStatus::Error);
        assert!(engine.cancel_turn(&out.state).is_err());
    }

    #[test]
    fn memory_and_db_tools_dispatch_as_execute_tool() {
        let engine = engine();
        let mut state = streaming_state(&engine);
        state = engine
            .on_llm_event(
                &state,
                LlmEvent::ToolCall(ToolCall {
                    call_id: "c1".into(),
                    tool_name: "db_query".into(),
                    arguments: serde_json::json!({ "table": "hosts" }),
                }),
            )
            .state;
        let out = engine.on_llm_event(
            &state,
            LlmEvent::Complete {
                stop_reason: StopReason::ToolUse,
                cache_context: None,
            },
        );
        // db_query needs no approval and no mutex: it executes at once.
        assert!(out
            .actions
            .iter()
            .any(|a| matches!(a, Action::ExecuteTool { .. })));
        assert_eq!(out.state.status, TurnStatus::ExecutingTools);
    }
}
