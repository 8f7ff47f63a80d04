//! Console actor: one per `(container, track)` with an active session.
//!
//! Drives a three-state machine (`starting → ready ⇄ busy`) over the
//! destructive console RPC. The actor's single mailbox serializes every
//! read, so the single-consumer contract of the output buffer holds by
//! construction. There is no internal `offline` state: a dead actor *is*
//! offline, and the parent container actor synthesizes that event from
//! the exit notice.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use redlab_domain::config::ConsoleConfig;
use redlab_domain::{
    AuthToken, CommandId, CommandRecord, ConsoleError, ConsoleSessionId, ConsoleStatus,
    ContainerId, Event, RpcEndpoint, Topic, TrackId, WorkspaceId,
};
use redlab_msgrpc::MsgRpc;

use crate::events::EventBus;
use crate::trace::{CommandTrace, CommandTraceSink};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public surface
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Routing keys the actor stamps onto every event and trace record.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleIdentity {
    pub workspace_id: WorkspaceId,
    pub container_id: ContainerId,
    pub track_id: TrackId,
}

/// Why the actor terminated. The parent decides on respawn from this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleExit {
    /// Graceful `go_offline`.
    Normal,
    SessionCreateFailed(String),
    WriteFailed(String),
    ReadFailed(String),
    KeepaliveFailed(String),
}

impl ConsoleExit {
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ConsoleExit::Normal)
    }
}

/// Monitor notices delivered to the parent container actor.
#[derive(Debug)]
pub enum ConsoleNotice {
    /// Entered `ready`; the parent uses this to settle restart counters.
    BecameReady { track_id: TrackId },
    /// The actor is gone. Always the final notice.
    Exited {
        track_id: TrackId,
        exit: ConsoleExit,
    },
}

enum ConsoleMsg {
    SendCommand {
        text: String,
        reply: oneshot::Sender<Result<CommandId, ConsoleError>>,
    },
    GetStatus {
        reply: oneshot::Sender<ConsoleStatus>,
    },
    GetPrompt {
        reply: oneshot::Sender<String>,
    },
    GoOffline,
}

/// Cheap clonable handle to a console actor's mailbox.
#[derive(Clone)]
pub struct ConsoleHandle {
    tx: mpsc::Sender<ConsoleMsg>,
}

impl ConsoleHandle {
    /// Submit a console command. Only valid in `ready`; returns the typed
    /// refusal otherwise.
    pub async fn send_command(&self, text: impl Into<String>) -> Result<CommandId, ConsoleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConsoleMsg::SendCommand {
                text: text.into(),
                reply,
            })
            .await
            .map_err(|_| ConsoleError::ConsoleOffline)?;
        rx.await.map_err(|_| ConsoleError::ConsoleOffline)?
    }

    pub async fn status(&self) -> Result<ConsoleStatus, ConsoleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConsoleMsg::GetStatus { reply })
            .await
            .map_err(|_| ConsoleError::ConsoleOffline)?;
        rx.await.map_err(|_| ConsoleError::ConsoleOffline)
    }

    pub async fn prompt(&self) -> Result<String, ConsoleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ConsoleMsg::GetPrompt { reply })
            .await
            .map_err(|_| ConsoleError::ConsoleOffline)?;
        rx.await.map_err(|_| ConsoleError::ConsoleOffline)
    }

    /// Fire-and-forget graceful shutdown: destroys the session, exits
    /// normally.
    pub fn go_offline(&self) {
        let _ = self.tx.try_send(ConsoleMsg::GoOffline);
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Everything a console actor needs besides its identity.
pub struct ConsoleDeps {
    pub rpc: Arc<dyn MsgRpc>,
    pub bus: Arc<EventBus>,
    pub trace: Arc<dyn CommandTraceSink>,
    pub notices: mpsc::Sender<ConsoleNotice>,
    pub config: ConsoleConfig,
}

pub fn spawn(
    identity: ConsoleIdentity,
    endpoint: RpcEndpoint,
    token: AuthToken,
    deps: ConsoleDeps,
) -> ConsoleHandle {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run(identity, endpoint, token, deps, rx));
    ConsoleHandle { tx }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor internals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Ready,
    Busy,
}

impl Phase {
    fn as_status(self) -> ConsoleStatus {
        match self {
            Phase::Starting => ConsoleStatus::Starting,
            Phase::Ready => ConsoleStatus::Ready,
            Phase::Busy => ConsoleStatus::Busy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Poll,
    Keepalive,
}

struct CurrentCommand {
    id: CommandId,
    text: String,
}

struct ConsoleState {
    phase: Phase,
    session_id: ConsoleSessionId,
    current_command: Option<CurrentCommand>,
    accumulated_output: String,
    current_prompt: String,
    retry_count: u32,
    /// At most one armed timer; re-arming replaces it, which is what
    /// cancels a stale poll when the state that scheduled it is gone.
    timer: Option<(Instant, TimerKind)>,
}

impl ConsoleState {
    fn arm(&mut self, kind: TimerKind, delay_ms: u64) {
        self.timer = Some((Instant::now() + Duration::from_millis(delay_ms), kind));
    }
}

struct Ctx {
    identity: ConsoleIdentity,
    endpoint: RpcEndpoint,
    token: AuthToken,
    rpc: Arc<dyn MsgRpc>,
    bus: Arc<EventBus>,
    trace: Arc<dyn CommandTraceSink>,
    notices: mpsc::Sender<ConsoleNotice>,
    config: ConsoleConfig,
}

impl Ctx {
    fn topic(&self) -> Topic {
        Topic::Track(self.identity.track_id)
    }

    fn publish(&self, event: Event) {
        self.bus.publish(&self.topic(), event);
    }

    fn publish_console(
        &self,
        status: ConsoleStatus,
        output: Option<String>,
        prompt: Option<String>,
        command: Option<&CurrentCommand>,
    ) {
        self.publish(Event::ConsoleUpdated {
            container_id: self.identity.container_id,
            track_id: self.identity.track_id,
            status,
            output,
            prompt,
            command_id: command.map(|c| c.id.clone()),
            command: command.map(|c| c.text.clone()),
            permanent: false,
        });
    }
}

async fn run(
    identity: ConsoleIdentity,
    endpoint: RpcEndpoint,
    token: AuthToken,
    deps: ConsoleDeps,
    mut rx: mpsc::Receiver<ConsoleMsg>,
) {
    let ctx = Ctx {
        identity,
        endpoint,
        token,
        rpc: deps.rpc,
        bus: deps.bus,
        trace: deps.trace,
        notices: deps.notices,
        config: deps.config,
    };

    let session = match ctx.rpc.console_create(&ctx.endpoint, &ctx.token).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(track_id = %identity.track_id, error = %e, "console session create failed");
            let _ = ctx
                .notices
                .send(ConsoleNotice::Exited {
                    track_id: identity.track_id,
                    exit: ConsoleExit::SessionCreateFailed(e.to_string()),
                })
                .await;
            return;
        }
    };

    let mut state = ConsoleState {
        phase: Phase::Starting,
        session_id: session.id,
        current_command: None,
        accumulated_output: String::new(),
        current_prompt: session.prompt,
        retry_count: 0,
        timer: None,
    };

    ctx.publish_console(ConsoleStatus::Starting, None, None, None);
    // Drain the startup banner right away.
    state.arm(TimerKind::Poll, 0);

    let exit = actor_loop(&ctx, &mut state, &mut rx).await;

    // Best-effort session teardown on any exit path.
    let _ = ctx
        .rpc
        .console_destroy(&ctx.endpoint, &ctx.token, &state.session_id)
        .await;

    tracing::debug!(track_id = %identity.track_id, exit = ?exit, "console actor terminating");
    let _ = ctx
        .notices
        .send(ConsoleNotice::Exited {
            track_id: identity.track_id,
            exit,
        })
        .await;
}

async fn actor_loop(
    ctx: &Ctx,
    state: &mut ConsoleState,
    rx: &mut mpsc::Receiver<ConsoleMsg>,
) -> ConsoleExit {
    loop {
        let deadline = state.timer.map(|(at, _)| at);
        tokio::select! {
            maybe_msg = rx.recv() => {
                match maybe_msg {
                    None => return ConsoleExit::Normal,
                    Some(ConsoleMsg::GoOffline) => return ConsoleExit::Normal,
                    Some(ConsoleMsg::GetStatus { reply }) => {
                        let _ = reply.send(state.phase.as_status());
                    }
                    Some(ConsoleMsg::GetPrompt { reply }) => {
                        let _ = reply.send(state.current_prompt.clone());
                    }
                    Some(ConsoleMsg::SendCommand { text, reply }) => {
                        if let Some(exit) = handle_send(ctx, state, text, reply).await {
                            return exit;
                        }
                    }
                }
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            }, if deadline.is_some() => {
                if let Some((_, kind)) = state.timer.take() {
                    let result = match kind {
                        TimerKind::Poll => handle_poll(ctx, state).await,
                        TimerKind::Keepalive => handle_keepalive(ctx, state).await,
                    };
                    if let Some(exit) = result {
                        return exit;
                    }
                }
            }
        }
    }
}

// ── send_command ───────────────────────────────────────────────────

async fn handle_send(
    ctx: &Ctx,
    state: &mut ConsoleState,
    text: String,
    reply: oneshot::Sender<Result<CommandId, ConsoleError>>,
) -> Option<ConsoleExit> {
    match state.phase {
        Phase::Starting => {
            let _ = reply.send(Err(ConsoleError::ConsoleStarting));
            None
        }
        Phase::Busy => {
            let _ = reply.send(Err(ConsoleError::ConsoleBusy));
            None
        }
        Phase::Ready => {
            let mut data = text.clone();
            if !data.ends_with('\n') {
                data.push('\n');
            }

            match ctx
                .rpc
                .console_write(&ctx.endpoint, &ctx.token, &state.session_id, &data)
                .await
            {
                Err(e) => {
                    // A failed write leaves the console in an unknown state;
                    // die and let the parent respawn with a fresh token.
                    let detail = e.to_string();
                    let _ = reply.send(Err(ConsoleError::WriteFailed(detail.clone())));
                    Some(ConsoleExit::WriteFailed(detail))
                }
                Ok(_) => {
                    let command = CurrentCommand {
                        id: CommandId::generate(),
                        text,
                    };
                    let id = command.id.clone();

                    state.phase = Phase::Busy;
                    state.accumulated_output.clear();
                    ctx.publish_console(
                        ConsoleStatus::Busy,
                        Some(String::new()),
                        None,
                        Some(&command),
                    );
                    state.current_command = Some(command);
                    state.arm(TimerKind::Poll, ctx.config.poll_interval_ms);

                    let _ = reply.send(Ok(id));
                    None
                }
            }
        }
    }
}

// ── polling ────────────────────────────────────────────────────────

async fn handle_poll(ctx: &Ctx, state: &mut ConsoleState) -> Option<ConsoleExit> {
    let chunk = match ctx
        .rpc
        .console_read(&ctx.endpoint, &ctx.token, &state.session_id)
        .await
    {
        Ok(chunk) => {
            state.retry_count = 0;
            chunk
        }
        Err(e) => {
            if e.is_auth() {
                return Some(ConsoleExit::ReadFailed(e.to_string()));
            }
            state.retry_count += 1;
            if state.retry_count <= ctx.config.max_read_retries {
                let delay = ctx.config.read_retry_delay_ms(state.retry_count);
                tracing::debug!(
                    track_id = %ctx.identity.track_id,
                    retry = state.retry_count,
                    delay_ms = delay,
                    "console read failed, retrying"
                );
                state.arm(TimerKind::Poll, delay);
                return None;
            }
            return Some(ConsoleExit::ReadFailed(e.to_string()));
        }
    };

    if !chunk.data.is_empty() {
        state.accumulated_output.push_str(&chunk.data);
    }
    let delta = (!chunk.data.is_empty()).then(|| chunk.data.clone());

    match (state.phase, chunk.busy) {
        (Phase::Starting, true) => {
            if delta.is_some() {
                ctx.publish_console(ConsoleStatus::Starting, delta, None, None);
            }
            state.arm(TimerKind::Poll, ctx.config.poll_interval_ms);
        }
        (Phase::Starting, false) => {
            if delta.is_some() {
                ctx.publish_console(ConsoleStatus::Starting, delta, None, None);
            }
            let prompt = chunk.prompt.unwrap_or_default();
            state.current_prompt = prompt.clone();
            state.phase = Phase::Ready;
            state.accumulated_output.clear();
            ctx.publish_console(ConsoleStatus::Ready, None, Some(prompt), None);
            let _ = ctx
                .notices
                .send(ConsoleNotice::BecameReady {
                    track_id: ctx.identity.track_id,
                })
                .await;
            state.arm(TimerKind::Keepalive, ctx.config.keepalive_interval_ms);
        }
        (Phase::Busy, true) => {
            if delta.is_some() {
                ctx.publish_console(
                    ConsoleStatus::Busy,
                    delta,
                    None,
                    state.current_command.as_ref(),
                );
            }
            state.arm(TimerKind::Poll, ctx.config.poll_interval_ms);
        }
        (Phase::Busy, false) => {
            if delta.is_some() {
                ctx.publish_console(
                    ConsoleStatus::Busy,
                    delta,
                    None,
                    state.current_command.as_ref(),
                );
            }
            let prompt = chunk.prompt.unwrap_or_default();
            state.current_prompt = prompt.clone();

            if let Some(command) = state.current_command.take() {
                let mut record = CommandRecord::console(command.id.clone(), command.text.clone());
                record.output = state.accumulated_output.clone();
                record.set_prompt(prompt.clone());
                record.finish(None);

                ctx.trace.record(CommandTrace {
                    workspace_id: ctx.identity.workspace_id,
                    container_id: ctx.identity.container_id,
                    track_id: ctx.identity.track_id,
                    command_id: command.id,
                    command: command.text,
                    output: state.accumulated_output.clone(),
                    prompt: prompt.clone(),
                });
                ctx.publish(Event::CommandResult {
                    container_id: ctx.identity.container_id,
                    track_id: ctx.identity.track_id,
                    command: record,
                });
            }

            state.phase = Phase::Ready;
            state.accumulated_output.clear();
            ctx.publish_console(ConsoleStatus::Ready, None, Some(prompt), None);
            let _ = ctx
                .notices
                .send(ConsoleNotice::BecameReady {
                    track_id: ctx.identity.track_id,
                })
                .await;
            state.arm(TimerKind::Keepalive, ctx.config.keepalive_interval_ms);
        }
        (Phase::Ready, _) => {
            // Stale poll racing a transition; track the prompt, emit nothing.
            if let Some(prompt) = chunk.prompt {
                state.current_prompt = prompt;
            }
            state.arm(TimerKind::Keepalive, ctx.config.keepalive_interval_ms);
        }
    }
    None
}

// ── keepalive ──────────────────────────────────────────────────────

async fn handle_keepalive(ctx: &Ctx, state: &mut ConsoleState) -> Option<ConsoleExit> {
    if state.phase != Phase::Ready {
        // Re-entering busy re-armed the poll timer; nothing to do.
        return None;
    }
    match ctx
        .rpc
        .console_read(&ctx.endpoint, &ctx.token, &state.session_id)
        .await
    {
        Ok(chunk) => {
            if let Some(prompt) = chunk.prompt {
                state.current_prompt = prompt;
            }
            state.arm(TimerKind::Keepalive, ctx.config.keepalive_interval_ms);
            None
        }
        Err(e) => Some(ConsoleExit::KeepaliveFailed(e.to_string())),
    }
}
