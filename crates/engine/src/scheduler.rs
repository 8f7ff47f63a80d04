//! Tool execution manager: stateless batch scheduler.
//!
//! Given a batch of approved tool calls, group them by mutex key: each
//! sequential group gets one worker that runs its tools in submitted
//! order, awaiting full completion (including out-of-band command
//! completion) before dispatching the next; tools without a mutex each
//! get their own worker and run truly in parallel.
//!
//! Per-tool status messages flow back to the caller over a channel; the
//! turn engine consumes them as reducer inputs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use redlab_domain::{
    CommandId, CommandStatus, ConsoleError, ContainerId, EntryId, Event, ToolCall, ToolError,
    ToolRegistry, Topic, TrackId, WorkspaceId,
};

use crate::container::ContainerHandle;
use crate::events::EventBus;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where a batch executes.
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub workspace_id: WorkspaceId,
    pub workspace_slug: String,
    pub container_id: ContainerId,
    pub track_id: TrackId,
}

/// Per-tool progress message.
#[derive(Debug, Clone)]
pub enum ToolStatus {
    /// The worker picked the tool up.
    Executing,
    /// Normal return with a JSON result.
    Success(serde_json::Value),
    /// The tool's effect is long-running; completion arrives out-of-band
    /// keyed by this command id.
    Async(CommandId),
    Error(ToolError),
    /// The descriptor timeout expired; any late result is discarded.
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ToolStatusUpdate {
    pub entry_id: EntryId,
    pub status: ToolStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Completion hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal outcome of an async command.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Success {
        output: String,
        exit_code: Option<i64>,
    },
    Error {
        message: String,
    },
}

const UNCLAIMED_CAP: usize = 256;

/// Rendezvous between command completions and the workers awaiting them.
///
/// A completion can land before the worker registers (the bus forwarder
/// runs concurrently with the dispatching worker), so unclaimed outcomes
/// are buffered in a bounded ring until someone asks.
#[derive(Default)]
pub struct CompletionHub {
    inner: Mutex<HubInner>,
}

#[derive(Default)]
struct HubInner {
    waiters: HashMap<CommandId, oneshot::Sender<CommandOutcome>>,
    unclaimed: HashMap<CommandId, CommandOutcome>,
    unclaimed_order: VecDeque<CommandId>,
}

impl CompletionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a command's completion.
    pub fn register(&self, id: &CommandId) -> oneshot::Receiver<CommandOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.unclaimed.remove(id) {
            inner.unclaimed_order.retain(|k| k != id);
            let _ = tx.send(outcome);
        } else {
            inner.waiters.insert(id.clone(), tx);
        }
        rx
    }

    /// Deliver a completion. Wakes the waiter if present, otherwise
    /// buffers the outcome (dropping the oldest past the cap).
    pub fn resolve(&self, id: &CommandId, outcome: CommandOutcome) {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.waiters.remove(id) {
            let _ = tx.send(outcome);
            return;
        }
        if inner.unclaimed.len() >= UNCLAIMED_CAP {
            if let Some(oldest) = inner.unclaimed_order.pop_front() {
                inner.unclaimed.remove(&oldest);
            }
        }
        inner.unclaimed.insert(id.clone(), outcome);
        inner.unclaimed_order.push_back(id.clone());
    }

    /// Forget a command (timeout path); a late completion is discarded.
    pub fn discard(&self, id: &CommandId) {
        let mut inner = self.inner.lock();
        inner.waiters.remove(id);
        inner.unclaimed.remove(id);
        inner.unclaimed_order.retain(|k| k != id);
    }
}

/// Forward command completions for one track from the event bus into the
/// hub. Returns the forwarder task for shutdown.
pub fn attach_track(
    hub: Arc<CompletionHub>,
    bus: &EventBus,
    track_id: TrackId,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe(&Topic::Track(track_id));
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::CommandResult { command, .. }) => match command.status {
                    CommandStatus::Finished => hub.resolve(
                        &command.id,
                        CommandOutcome::Success {
                            output: command.output,
                            exit_code: command.exit_code,
                        },
                    ),
                    CommandStatus::Error => hub.resolve(
                        &command.id,
                        CommandOutcome::Error {
                            message: command
                                .error
                                .unwrap_or_else(|| "command failed".to_owned()),
                        },
                    ),
                    CommandStatus::Running => {}
                },
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%track_id, skipped, "completion forwarder lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool host
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read-only security database the `db_query` tool reaches into.
#[async_trait]
pub trait SecurityDb: Send + Sync {
    async fn query(
        &self,
        workspace_id: WorkspaceId,
        table: &str,
        filter: Option<&str>,
    ) -> Result<serde_json::Value, ToolError>;
}

/// Per-track agent working memory the `memory_update` tool mutates.
#[async_trait]
pub trait AgentMemory: Send + Sync {
    async fn update_section(
        &self,
        track_id: TrackId,
        section: &str,
        content: &str,
    ) -> Result<(), ToolError>;
}

/// The effectful surface workers execute against.
#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn send_msf_command(
        &self,
        ctx: &ExecContext,
        text: &str,
    ) -> Result<CommandId, ConsoleError>;

    async fn send_bash_command(
        &self,
        ctx: &ExecContext,
        text: &str,
    ) -> Result<CommandId, ConsoleError>;

    async fn query_database(
        &self,
        ctx: &ExecContext,
        table: &str,
        filter: Option<&str>,
    ) -> Result<serde_json::Value, ToolError>;

    async fn update_memory(
        &self,
        ctx: &ExecContext,
        section: &str,
        content: &str,
    ) -> Result<(), ToolError>;
}

/// Production host: console and shell commands go to the container actor,
/// queries and memory updates to their collaborator seams.
pub struct EngineToolHost {
    container: ContainerHandle,
    db: Arc<dyn SecurityDb>,
    memory: Arc<dyn AgentMemory>,
}

impl EngineToolHost {
    pub fn new(
        container: ContainerHandle,
        db: Arc<dyn SecurityDb>,
        memory: Arc<dyn AgentMemory>,
    ) -> Self {
        Self {
            container,
            db,
            memory,
        }
    }
}

#[async_trait]
impl ToolHost for EngineToolHost {
    async fn send_msf_command(
        &self,
        ctx: &ExecContext,
        text: &str,
    ) -> Result<CommandId, ConsoleError> {
        self.container.send_msf_command(ctx.track_id, text).await
    }

    async fn send_bash_command(
        &self,
        ctx: &ExecContext,
        text: &str,
    ) -> Result<CommandId, ConsoleError> {
        self.container.send_bash_command(ctx.track_id, text).await
    }

    async fn query_database(
        &self,
        ctx: &ExecContext,
        table: &str,
        filter: Option<&str>,
    ) -> Result<serde_json::Value, ToolError> {
        self.db.query(ctx.workspace_id, table, filter).await
    }

    async fn update_memory(
        &self,
        ctx: &ExecContext,
        section: &str,
        content: &str,
    ) -> Result<(), ToolError> {
        self.memory.update_section(ctx.track_id, section, content).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Batch execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PlannedTool {
    entry_id: EntryId,
    call: ToolCall,
    timeout_ms: Option<u64>,
}

/// Dispatch a batch. Returns immediately; progress arrives on `updates`.
///
/// Within a mutex group, dispatch order equals submission order and tool
/// N+1 does not start before tool N's result is in. Tools without a
/// mutex all start concurrently.
pub fn execute_batch(
    registry: &ToolRegistry,
    host: Arc<dyn ToolHost>,
    hub: Arc<CompletionHub>,
    ctx: ExecContext,
    batch: Vec<(EntryId, ToolCall)>,
    updates: mpsc::Sender<ToolStatusUpdate>,
) {
    // Group by mutex, preserving submission order inside each group.
    let mut sequential: Vec<(String, Vec<PlannedTool>)> = Vec::new();
    let mut parallel: Vec<PlannedTool> = Vec::new();
    let mut unknown: Vec<EntryId> = Vec::new();
    let mut unknown_names: Vec<String> = Vec::new();

    for (entry_id, call) in batch {
        let Some(descriptor) = registry.get(&call.tool_name) else {
            unknown.push(entry_id);
            unknown_names.push(call.tool_name.clone());
            continue;
        };
        let planned = PlannedTool {
            entry_id,
            call,
            timeout_ms: descriptor.timeout_ms,
        };
        match &descriptor.mutex {
            Some(key) => {
                if let Some((_, group)) = sequential.iter_mut().find(|(k, _)| k == key) {
                    group.push(planned);
                } else {
                    sequential.push((key.clone(), vec![planned]));
                }
            }
            None => parallel.push(planned),
        }
    }

    if !unknown.is_empty() {
        let updates = updates.clone();
        tokio::spawn(async move {
            for (entry_id, name) in unknown.into_iter().zip(unknown_names) {
                let _ = updates
                    .send(ToolStatusUpdate {
                        entry_id,
                        status: ToolStatus::Error(ToolError::UnknownTool(name)),
                    })
                    .await;
            }
        });
    }

    for (key, group) in sequential {
        let host = host.clone();
        let hub = hub.clone();
        let ctx = ctx.clone();
        let updates = updates.clone();
        tokio::spawn(async move {
            tracing::debug!(mutex = %key, tools = group.len(), "running sequential tool group");
            for tool in group {
                run_tool(&*host, &hub, &ctx, tool, &updates).await;
            }
        });
    }

    for tool in parallel {
        let host = host.clone();
        let hub = hub.clone();
        let ctx = ctx.clone();
        let updates = updates.clone();
        tokio::spawn(async move {
            run_tool(&*host, &hub, &ctx, tool, &updates).await;
        });
    }
}

async fn run_tool(
    host: &dyn ToolHost,
    hub: &CompletionHub,
    ctx: &ExecContext,
    tool: PlannedTool,
    updates: &mpsc::Sender<ToolStatusUpdate>,
) {
    let entry_id = tool.entry_id;
    let send = |status: ToolStatus| {
        let updates = updates.clone();
        async move {
            let _ = updates.send(ToolStatusUpdate { entry_id, status }).await;
        }
    };

    send(ToolStatus::Executing).await;

    let status = match tool.call.tool_name.as_str() {
        "msf_console" | "bash" => {
            let Some(command) = str_arg(&tool.call, "command") else {
                send(ToolStatus::Error(ToolError::MissingParameter(
                    "command".into(),
                )))
                .await;
                return;
            };
            let submitted = if tool.call.tool_name == "msf_console" {
                host.send_msf_command(ctx, &command).await
            } else {
                host.send_bash_command(ctx, &command).await
            };
            match submitted {
                Err(e) => ToolStatus::Error(ToolError::ExecutionError(e.to_string())),
                Ok(command_id) => {
                    send(ToolStatus::Async(command_id.clone())).await;
                    await_completion(hub, &command_id, tool.timeout_ms).await
                }
            }
        }
        "db_query" => {
            let Some(table) = str_arg(&tool.call, "table") else {
                send(ToolStatus::Error(ToolError::MissingParameter(
                    "table".into(),
                )))
                .await;
                return;
            };
            let filter = str_arg(&tool.call, "filter");
            match host.query_database(ctx, &table, filter.as_deref()).await {
                Ok(value) => ToolStatus::Success(value),
                Err(e) => ToolStatus::Error(e),
            }
        }
        "memory_update" => {
            let (Some(section), Some(content)) = (
                str_arg(&tool.call, "section"),
                str_arg(&tool.call, "content"),
            ) else {
                send(ToolStatus::Error(ToolError::MissingParameter(
                    "section, content".into(),
                )))
                .await;
                return;
            };
            match host.update_memory(ctx, &section, &content).await {
                Ok(()) => ToolStatus::Success(serde_json::json!({ "ok": true })),
                Err(e) => ToolStatus::Error(e),
            }
        }
        other => ToolStatus::Error(ToolError::UnknownTool(other.to_owned())),
    };

    send(status).await;
}

async fn await_completion(
    hub: &CompletionHub,
    command_id: &CommandId,
    timeout_ms: Option<u64>,
) -> ToolStatus {
    let rx = hub.register(command_id);
    let outcome = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), rx).await {
            Err(_) => {
                hub.discard(command_id);
                return ToolStatus::TimedOut;
            }
            Ok(result) => result,
        },
        None => rx.await,
    };

    match outcome {
        Ok(CommandOutcome::Success { output, exit_code }) => {
            ToolStatus::Success(serde_json::json!({
                "output": output,
                "exit_code": exit_code,
            }))
        }
        Ok(CommandOutcome::Error { message }) => {
            ToolStatus::Error(ToolError::ExecutionError(message))
        }
        Err(_) => ToolStatus::Error(ToolError::ExecutionError(
            "completion channel closed".into(),
        )),
    }
}

fn str_arg(call: &ToolCall, key: &str) -> Option<String> {
    call.arguments
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
}
