//! Container actor: one per managed container record.
//!
//! Drives the `offline → starting → running` lifecycle, holds the MSGRPC
//! token while running, supervises one console actor per registered track
//! (respawning dead ones with exponential backoff), and runs one-shot
//! shell commands through short-lived worker tasks.
//!
//! All maps (`registered_tracks`, `consoles`, `running_shell_commands`)
//! are owned exclusively by the actor; external mutation goes through
//! operations on [`ContainerHandle`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use redlab_docker::{build_labels, ContainerLabels, ContainerRuntime};
use redlab_domain::config::LabConfig;
use redlab_domain::{
    container_name, AuthToken, CommandId, CommandRecord, ConsoleError, ConsoleStatus, ContainerId,
    ContainerStatus, Event, NoPortsAvailable, RpcEndpoint, Topic, TrackId, WorkspaceId,
};
use redlab_msgrpc::MsgRpc;

use crate::backoff::Backoff;
use crate::console::{self, ConsoleDeps, ConsoleExit, ConsoleHandle, ConsoleIdentity, ConsoleNotice};
use crate::events::EventBus;
use crate::ports::allocate_port;
use crate::trace::CommandTraceSink;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable identity of a container record.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub container_id: ContainerId,
    pub workspace_id: WorkspaceId,
    pub workspace_slug: String,
    pub container_slug: String,
}

impl ContainerSpec {
    pub fn external_name(&self, prefix: &str) -> String {
        container_name(prefix, &self.workspace_slug, &self.container_slug)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerStartError {
    #[error("container is not offline")]
    NotOffline,

    #[error(transparent)]
    NoPorts(#[from] NoPortsAvailable),

    #[error("container runtime: {0}")]
    Runtime(String),

    #[error("container is not running in the runtime")]
    NotRunningInRuntime,

    #[error("msgrpc login failed after {attempts} attempts: {detail}")]
    LoginFailed { attempts: u32, detail: String },

    #[error("container actor is gone")]
    ActorGone,
}

/// A shell command currently in flight.
#[derive(Debug, Clone, Serialize)]
pub struct ShellCommandInfo {
    pub command_id: CommandId,
    pub track_id: TrackId,
    pub text: String,
    pub started_at: DateTime<Utc>,
}

/// Read-only introspection of a container actor's state.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerSnapshot {
    pub container_id: ContainerId,
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub status: ContainerStatus,
    pub docker_id: Option<String>,
    pub rpc_endpoint: Option<RpcEndpoint>,
    pub registered_tracks: Vec<TrackId>,
    pub consoles: Vec<ConsoleSnapshot>,
    pub running_shell_commands: Vec<ShellCommandInfo>,
    pub restart_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleSnapshot {
    pub track_id: TrackId,
    pub alive: bool,
    pub restart_attempts: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mailbox
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum ContainerMsg {
    Start {
        reply: oneshot::Sender<Result<(), ContainerStartError>>,
    },
    AdoptDocker {
        docker_id: String,
        reply: oneshot::Sender<Result<(), ContainerStartError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    RegisterConsole {
        track_id: TrackId,
        reply: oneshot::Sender<()>,
    },
    UnregisterConsole {
        track_id: TrackId,
        reply: oneshot::Sender<()>,
    },
    SendMsfCommand {
        track_id: TrackId,
        text: String,
        reply: oneshot::Sender<Result<CommandId, ConsoleError>>,
    },
    SendBashCommand {
        track_id: TrackId,
        text: String,
        reply: oneshot::Sender<Result<CommandId, ConsoleError>>,
    },
    GetStatus {
        reply: oneshot::Sender<ContainerStatus>,
    },
    GetEndpoint {
        reply: oneshot::Sender<Option<RpcEndpoint>>,
    },
    GetRunningShell {
        reply: oneshot::Sender<Vec<ShellCommandInfo>>,
    },
    GetSnapshot {
        reply: oneshot::Sender<ContainerSnapshot>,
    },
    /// Delayed self-message scheduled by the respawn backoff timer.
    RespawnConsole { track_id: TrackId },
    /// Completion sent back by a shell-exec worker.
    ShellCompleted {
        command_id: CommandId,
        track_id: TrackId,
        result: Result<redlab_docker::ExecOutput, String>,
    },
}

/// Cheap clonable handle to a container actor.
#[derive(Clone)]
pub struct ContainerHandle {
    tx: mpsc::Sender<ContainerMsg>,
}

macro_rules! ask {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }, $gone:expr) => {{
        let (reply, rx) = oneshot::channel();
        if $self
            .tx
            .send(ContainerMsg::$variant { $($field: $value,)* reply })
            .await
            .is_err()
        {
            return $gone;
        }
        match rx.await {
            Ok(value) => value,
            Err(_) => return $gone,
        }
    }};
}

impl ContainerHandle {
    pub async fn start(&self) -> Result<(), ContainerStartError> {
        ask!(self, Start {}, Err(ContainerStartError::ActorGone))
    }

    /// Adopt an already-running container instead of creating one: probe
    /// liveness, resolve the endpoint, authenticate.
    pub async fn adopt_docker_container(
        &self,
        docker_id: String,
    ) -> Result<(), ContainerStartError> {
        ask!(
            self,
            AdoptDocker { docker_id: docker_id },
            Err(ContainerStartError::ActorGone)
        )
    }

    pub async fn stop(&self) {
        ask!(self, Stop {}, ())
    }

    pub async fn register_console(&self, track_id: TrackId) {
        ask!(self, RegisterConsole { track_id: track_id }, ())
    }

    pub async fn unregister_console(&self, track_id: TrackId) {
        ask!(self, UnregisterConsole { track_id: track_id }, ())
    }

    pub async fn send_msf_command(
        &self,
        track_id: TrackId,
        text: impl Into<String>,
    ) -> Result<CommandId, ConsoleError> {
        ask!(
            self,
            SendMsfCommand {
                track_id: track_id,
                text: text.into(),
            },
            Err(ConsoleError::ContainerNotRunning)
        )
    }

    pub async fn send_bash_command(
        &self,
        track_id: TrackId,
        text: impl Into<String>,
    ) -> Result<CommandId, ConsoleError> {
        ask!(
            self,
            SendBashCommand {
                track_id: track_id,
                text: text.into(),
            },
            Err(ConsoleError::ContainerNotRunning)
        )
    }

    pub async fn status(&self) -> ContainerStatus {
        ask!(self, GetStatus {}, ContainerStatus::Offline)
    }

    pub async fn rpc_endpoint(&self) -> Option<RpcEndpoint> {
        ask!(self, GetEndpoint {}, None)
    }

    pub async fn running_bash_commands(&self) -> Vec<ShellCommandInfo> {
        ask!(self, GetRunningShell {}, Vec::new())
    }

    pub async fn snapshot(&self) -> Option<ContainerSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(ContainerMsg::GetSnapshot { reply })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared collaborators handed to every container actor.
#[derive(Clone)]
pub struct ContainerDeps {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub rpc: Arc<dyn MsgRpc>,
    pub bus: Arc<EventBus>,
    pub trace: Arc<dyn CommandTraceSink>,
    pub config: LabConfig,
}

struct ConsoleSlot {
    handle: Option<ConsoleHandle>,
    restart_attempts: u32,
    last_restart_at: Option<Instant>,
    became_ready_at: Option<Instant>,
}

impl ConsoleSlot {
    fn empty() -> Self {
        Self {
            handle: None,
            restart_attempts: 0,
            last_restart_at: None,
            became_ready_at: None,
        }
    }

    fn live_handle(&self) -> Option<&ConsoleHandle> {
        self.handle.as_ref().filter(|h| h.is_alive())
    }
}

struct ShellWorker {
    info: ShellCommandInfo,
    task: JoinHandle<()>,
}

struct ContainerActor {
    spec: ContainerSpec,
    deps: ContainerDeps,
    self_tx: mpsc::Sender<ContainerMsg>,
    notice_tx: mpsc::Sender<ConsoleNotice>,

    status: ContainerStatus,
    docker_id: Option<String>,
    endpoint: Option<RpcEndpoint>,
    token: Option<AuthToken>,
    registered_tracks: BTreeSet<TrackId>,
    consoles: HashMap<TrackId, ConsoleSlot>,
    running_shell: HashMap<CommandId, ShellWorker>,
    restart_count: u32,
    msgrpc_connect_attempts: u32,
}

pub fn spawn(spec: ContainerSpec, deps: ContainerDeps) -> ContainerHandle {
    let (tx, rx) = mpsc::channel(64);
    let (notice_tx, notice_rx) = mpsc::channel(64);
    let actor = ContainerActor {
        spec,
        deps,
        self_tx: tx.clone(),
        notice_tx,
        status: ContainerStatus::Offline,
        docker_id: None,
        endpoint: None,
        token: None,
        registered_tracks: BTreeSet::new(),
        consoles: HashMap::new(),
        running_shell: HashMap::new(),
        restart_count: 0,
        msgrpc_connect_attempts: 0,
    };
    tokio::spawn(actor.run(rx, notice_rx));
    ContainerHandle { tx }
}

impl ContainerActor {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<ContainerMsg>,
        mut notice_rx: mpsc::Receiver<ConsoleNotice>,
    ) {
        loop {
            tokio::select! {
                maybe_msg = rx.recv() => {
                    match maybe_msg {
                        None => break,
                        Some(msg) => self.handle_msg(msg).await,
                    }
                }
                Some(notice) = notice_rx.recv() => {
                    self.handle_notice(notice);
                }
            }
        }
        // All handles dropped: tear everything down.
        self.teardown().await;
    }

    async fn handle_msg(&mut self, msg: ContainerMsg) {
        match msg {
            ContainerMsg::Start { reply } => {
                let result = self.start_new().await;
                let _ = reply.send(result);
            }
            ContainerMsg::AdoptDocker { docker_id, reply } => {
                let result = self.adopt(docker_id).await;
                let _ = reply.send(result);
            }
            ContainerMsg::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
            }
            ContainerMsg::RegisterConsole { track_id, reply } => {
                self.registered_tracks.insert(track_id);
                let slot = self
                    .consoles
                    .entry(track_id)
                    .or_insert_with(ConsoleSlot::empty);
                if self.status == ContainerStatus::Running && slot.live_handle().is_none() {
                    self.spawn_console(track_id);
                }
                let _ = reply.send(());
            }
            ContainerMsg::UnregisterConsole { track_id, reply } => {
                self.registered_tracks.remove(&track_id);
                if let Some(slot) = self.consoles.remove(&track_id) {
                    if let Some(handle) = slot.handle {
                        handle.go_offline();
                    }
                }
                let _ = reply.send(());
            }
            ContainerMsg::SendMsfCommand {
                track_id,
                text,
                reply,
            } => {
                // Three-layer validation with distinct error kinds.
                if self.status != ContainerStatus::Running {
                    let _ = reply.send(Err(ConsoleError::ContainerNotRunning));
                    return;
                }
                if !self.registered_tracks.contains(&track_id) {
                    let _ = reply.send(Err(ConsoleError::ConsoleNotRegistered));
                    return;
                }
                let handle = self
                    .consoles
                    .get(&track_id)
                    .and_then(|slot| slot.live_handle())
                    .cloned();
                match handle {
                    None => {
                        let _ = reply.send(Err(ConsoleError::ConsoleOffline));
                    }
                    Some(handle) => {
                        // Forward off-actor so a slow console poll cannot
                        // block this mailbox.
                        tokio::spawn(async move {
                            let result = handle.send_command(text).await;
                            let _ = reply.send(result);
                        });
                    }
                }
            }
            ContainerMsg::SendBashCommand {
                track_id,
                text,
                reply,
            } => {
                let _ = reply.send(self.start_shell_command(track_id, text));
            }
            ContainerMsg::GetStatus { reply } => {
                let _ = reply.send(self.status);
            }
            ContainerMsg::GetEndpoint { reply } => {
                let _ = reply.send(self.endpoint.clone());
            }
            ContainerMsg::GetRunningShell { reply } => {
                let _ = reply.send(
                    self.running_shell
                        .values()
                        .map(|w| w.info.clone())
                        .collect(),
                );
            }
            ContainerMsg::GetSnapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            ContainerMsg::RespawnConsole { track_id } => {
                self.respawn_console(track_id).await;
            }
            ContainerMsg::ShellCompleted {
                command_id,
                track_id,
                result,
            } => {
                self.finish_shell_command(command_id, track_id, result);
            }
        }
    }

    // ── lifecycle ──────────────────────────────────────────────────

    async fn start_new(&mut self) -> Result<(), ContainerStartError> {
        if self.status != ContainerStatus::Offline {
            return Err(ContainerStartError::NotOffline);
        }
        self.set_status(ContainerStatus::Starting);

        if self.restart_count > 0 {
            let backoff = self.container_backoff();
            tokio::time::sleep(backoff.delay(self.restart_count)).await;
        }

        match self.create_and_connect().await {
            Ok(()) => {
                self.finish_start();
                Ok(())
            }
            Err(e) => {
                self.restart_count += 1;
                self.set_status(ContainerStatus::Offline);
                Err(e)
            }
        }
    }

    async fn create_and_connect(&mut self) -> Result<(), ContainerStartError> {
        let docker = &self.deps.config.docker;

        let managed = self
            .deps
            .runtime
            .list_managed()
            .await
            .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;
        let used: HashSet<u16> = managed
            .iter()
            .filter_map(|c| ContainerLabels::parse(&c.labels).map(|l| l.rpc_port))
            .collect();
        let port = allocate_port(&used, docker.port_range_start..=docker.port_range_end)?;

        let name = self.spec.external_name(&docker.name_prefix);
        let labels = build_labels(
            self.spec.container_id,
            &self.spec.workspace_slug,
            &self.spec.container_slug,
            port,
        );

        tracing::info!(
            container_id = %self.spec.container_id,
            name = %name,
            rpc_port = port,
            "creating sandbox container"
        );
        let docker_id = self
            .deps
            .runtime
            .start_container(&name, labels, port)
            .await
            .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;
        self.docker_id = Some(docker_id.clone());

        let endpoint = self
            .deps
            .runtime
            .resolve_rpc_endpoint(&docker_id)
            .await
            .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;
        self.endpoint = Some(endpoint.clone());

        let token = self.login_with_retry(&endpoint).await?;
        self.token = Some(token);
        Ok(())
    }

    async fn adopt(&mut self, docker_id: String) -> Result<(), ContainerStartError> {
        if self.status != ContainerStatus::Offline {
            return Err(ContainerStartError::NotOffline);
        }
        self.set_status(ContainerStatus::Starting);

        let result = async {
            let running = self
                .deps
                .runtime
                .container_running(&docker_id)
                .await
                .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;
            if !running {
                return Err(ContainerStartError::NotRunningInRuntime);
            }

            let endpoint = self
                .deps
                .runtime
                .resolve_rpc_endpoint(&docker_id)
                .await
                .map_err(|e| ContainerStartError::Runtime(e.to_string()))?;

            let token = self.login_with_retry(&endpoint).await?;
            Ok((endpoint, token))
        }
        .await;

        match result {
            Ok((endpoint, token)) => {
                tracing::info!(
                    container_id = %self.spec.container_id,
                    docker_id = %docker_id,
                    "adopted running container"
                );
                self.docker_id = Some(docker_id);
                self.endpoint = Some(endpoint);
                self.token = Some(token);
                self.finish_start();
                Ok(())
            }
            Err(e) => {
                self.set_status(ContainerStatus::Offline);
                Err(e)
            }
        }
    }

    fn finish_start(&mut self) {
        self.set_status(ContainerStatus::Running);
        let tracks: Vec<TrackId> = self.registered_tracks.iter().copied().collect();
        for track_id in tracks {
            let slot = self
                .consoles
                .entry(track_id)
                .or_insert_with(ConsoleSlot::empty);
            slot.restart_attempts = 0;
            self.spawn_console(track_id);
        }
    }

    async fn login_with_retry(
        &mut self,
        endpoint: &RpcEndpoint,
    ) -> Result<AuthToken, ContainerStartError> {
        let config = &self.deps.config.msgrpc;
        let backoff = Backoff::new(config.initial_delay_ms, config.backoff_max_ms);

        tokio::time::sleep(std::time::Duration::from_millis(config.initial_delay_ms)).await;

        let mut last_error = String::new();
        for attempt in 1..=config.max_connect_attempts {
            self.msgrpc_connect_attempts = attempt;
            match self
                .deps
                .rpc
                .login(endpoint, &config.user, &config.password)
                .await
            {
                Ok(token) => {
                    self.msgrpc_connect_attempts = 0;
                    return Ok(token);
                }
                Err(e) => {
                    tracing::debug!(
                        container_id = %self.spec.container_id,
                        attempt,
                        error = %e,
                        "msgrpc login failed"
                    );
                    last_error = e.to_string();
                    if attempt < config.max_connect_attempts {
                        tokio::time::sleep(backoff.delay(attempt)).await;
                    }
                }
            }
        }
        Err(ContainerStartError::LoginFailed {
            attempts: config.max_connect_attempts,
            detail: last_error,
        })
    }

    async fn stop(&mut self) {
        // Children go down before the status leaves `running`.
        for slot in self.consoles.values_mut() {
            if let Some(handle) = slot.handle.take() {
                handle.go_offline();
            }
        }
        for (_, worker) in self.running_shell.drain() {
            worker.task.abort();
        }

        if let Some(docker_id) = &self.docker_id {
            if let Err(e) = self.deps.runtime.stop_container(docker_id).await {
                tracing::warn!(
                    container_id = %self.spec.container_id,
                    error = %e,
                    "container stop reported an error"
                );
            }
        }
        self.token = None;
        self.endpoint = None;
        self.set_status(ContainerStatus::Offline);
    }

    async fn teardown(&mut self) {
        if self.status != ContainerStatus::Offline {
            self.stop().await;
        }
    }

    // ── console supervision ────────────────────────────────────────

    fn spawn_console(&mut self, track_id: TrackId) {
        let (endpoint, token) = match (&self.endpoint, &self.token) {
            (Some(endpoint), Some(token)) => (endpoint.clone(), token.clone()),
            _ => {
                tracing::warn!(track_id = %track_id, "cannot spawn console without endpoint/token");
                return;
            }
        };

        let handle = console::spawn(
            ConsoleIdentity {
                workspace_id: self.spec.workspace_id,
                container_id: self.spec.container_id,
                track_id,
            },
            endpoint,
            token,
            ConsoleDeps {
                rpc: self.deps.rpc.clone(),
                bus: self.deps.bus.clone(),
                trace: self.deps.trace.clone(),
                notices: self.notice_tx.clone(),
                config: self.deps.config.console.clone(),
            },
        );

        if let Some(slot) = self.consoles.get_mut(&track_id) {
            slot.handle = Some(handle);
            slot.became_ready_at = None;
        }
    }

    fn handle_notice(&mut self, notice: ConsoleNotice) {
        match notice {
            ConsoleNotice::BecameReady { track_id } => {
                if let Some(slot) = self.consoles.get_mut(&track_id) {
                    if slot.became_ready_at.is_none() {
                        slot.became_ready_at = Some(Instant::now());
                    }
                }
            }
            ConsoleNotice::Exited { track_id, exit } => {
                self.handle_console_exit(track_id, exit);
            }
        }
    }

    fn handle_console_exit(&mut self, track_id: TrackId, exit: ConsoleExit) {
        // The actor is gone either way; subscribers learn it from us.
        let should_respawn = self.status == ContainerStatus::Running
            && self.registered_tracks.contains(&track_id)
            && self.consoles.contains_key(&track_id);

        if !should_respawn {
            self.publish_console_offline(track_id, false);
            return;
        }

        let cooldown = std::time::Duration::from_millis(
            self.deps.config.container.console_restart_cooldown_ms,
        );
        let max_attempts = self.deps.config.container.console_max_restart_attempts;
        let backoff = self.container_backoff();

        let Some(slot) = self.consoles.get_mut(&track_id) else {
            return;
        };
        slot.handle = None;

        // A console that stayed ready through the cooling interval has
        // earned a clean slate.
        if slot
            .became_ready_at
            .map(|at| at.elapsed() >= cooldown)
            .unwrap_or(false)
        {
            slot.restart_attempts = 0;
        }
        slot.became_ready_at = None;

        if slot.restart_attempts >= max_attempts {
            tracing::warn!(
                track_id = %track_id,
                attempts = slot.restart_attempts,
                "console restart attempts exhausted"
            );
            self.consoles.remove(&track_id);
            self.publish_console_offline(track_id, true);
            return;
        }

        slot.restart_attempts += 1;
        slot.last_restart_at = Some(Instant::now());
        let attempt = slot.restart_attempts;
        let delay = backoff.delay(attempt);

        tracing::info!(
            track_id = %track_id,
            exit = ?exit,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "scheduling console respawn"
        );
        self.publish_console_offline(track_id, false);

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ContainerMsg::RespawnConsole { track_id }).await;
        });
    }

    async fn respawn_console(&mut self, track_id: TrackId) {
        let ready = self.status == ContainerStatus::Running
            && self.registered_tracks.contains(&track_id)
            && self
                .consoles
                .get(&track_id)
                .map(|slot| slot.live_handle().is_none())
                .unwrap_or(false);
        if !ready {
            return;
        }

        // Reauthenticate so a console killed by an expired token comes
        // back on a fresh one.
        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => return,
        };
        let rpc = self.deps.rpc.clone();
        let user = self.deps.config.msgrpc.user.clone();
        let password = self.deps.config.msgrpc.password.clone();
        match rpc.login(&endpoint, &user, &password).await {
            Ok(token) => {
                self.token = Some(token);
                self.spawn_console(track_id);
            }
            Err(e) => {
                tracing::warn!(track_id = %track_id, error = %e, "respawn login failed");
                // Walk the same death path so attempts keep counting up.
                self.handle_console_exit(track_id, ConsoleExit::SessionCreateFailed(e.to_string()));
            }
        }
    }

    fn publish_console_offline(&self, track_id: TrackId, permanent: bool) {
        self.deps.bus.publish(
            &Topic::Track(track_id),
            Event::ConsoleUpdated {
                container_id: self.spec.container_id,
                track_id,
                status: ConsoleStatus::Offline,
                output: None,
                prompt: None,
                command_id: None,
                command: None,
                permanent,
            },
        );
    }

    // ── shell commands ─────────────────────────────────────────────

    fn start_shell_command(
        &mut self,
        track_id: TrackId,
        text: String,
    ) -> Result<CommandId, ConsoleError> {
        if self.status != ContainerStatus::Running {
            return Err(ConsoleError::ContainerNotRunning);
        }
        let Some(docker_id) = self.docker_id.clone() else {
            return Err(ConsoleError::ContainerNotRunning);
        };

        let command_id = CommandId::generate();
        let info = ShellCommandInfo {
            command_id: command_id.clone(),
            track_id,
            text: text.clone(),
            started_at: Utc::now(),
        };

        let record = CommandRecord::shell(command_id.clone(), text.clone());
        self.deps.bus.publish(
            &Topic::Track(track_id),
            Event::CommandResult {
                container_id: self.spec.container_id,
                track_id,
                command: record,
            },
        );

        let runtime = self.deps.runtime.clone();
        let tx = self.self_tx.clone();
        let worker_command_id = command_id.clone();
        let task = tokio::spawn(async move {
            let result = runtime
                .exec(
                    &docker_id,
                    &["/bin/sh".to_owned(), "-c".to_owned(), text],
                )
                .await
                .map_err(|e| e.to_string());
            let _ = tx
                .send(ContainerMsg::ShellCompleted {
                    command_id: worker_command_id,
                    track_id,
                    result,
                })
                .await;
        });

        self.running_shell
            .insert(command_id.clone(), ShellWorker { info, task });
        Ok(command_id)
    }

    fn finish_shell_command(
        &mut self,
        command_id: CommandId,
        track_id: TrackId,
        result: Result<redlab_docker::ExecOutput, String>,
    ) {
        let Some(worker) = self.running_shell.remove(&command_id) else {
            return;
        };

        let mut record = CommandRecord::shell(command_id, worker.info.text.clone());
        record.started_at = worker.info.started_at;
        match result {
            Ok(exec) => {
                record.output = exec.output;
                record.finish(Some(exec.exit_code));
            }
            Err(message) => {
                record.fail(message);
            }
        }

        self.deps.bus.publish(
            &Topic::Track(track_id),
            Event::CommandResult {
                container_id: self.spec.container_id,
                track_id,
                command: record,
            },
        );
    }

    // ── helpers ────────────────────────────────────────────────────

    fn container_backoff(&self) -> Backoff {
        Backoff::new(
            self.deps.config.container.restart_backoff_base_ms,
            self.deps.config.container.restart_backoff_max_ms,
        )
    }

    fn set_status(&mut self, status: ContainerStatus) {
        if self.status == status {
            return;
        }
        self.status = status;
        let event = Event::ContainerStatusChanged {
            workspace_id: self.spec.workspace_id,
            container_id: self.spec.container_id,
            status,
        };
        self.deps
            .bus
            .publish(&Topic::Container(self.spec.container_id), event.clone());
        self.deps
            .bus
            .publish(&Topic::Workspace(self.spec.workspace_id), event);
    }

    fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            container_id: self.spec.container_id,
            workspace_id: self.spec.workspace_id,
            name: self
                .spec
                .external_name(&self.deps.config.docker.name_prefix),
            status: self.status,
            docker_id: self.docker_id.clone(),
            rpc_endpoint: self.endpoint.clone(),
            registered_tracks: self.registered_tracks.iter().copied().collect(),
            consoles: self
                .consoles
                .iter()
                .map(|(track_id, slot)| ConsoleSnapshot {
                    track_id: *track_id,
                    alive: slot.live_handle().is_some(),
                    restart_attempts: slot.restart_attempts,
                })
                .collect(),
            running_shell_commands: self
                .running_shell
                .values()
                .map(|w| w.info.clone())
                .collect(),
            restart_count: self.restart_count,
        }
    }
}
