//! Scripted fakes for the two capability seams, plus a tightened test
//! configuration. Each mock replays a queue of scripted responses and
//! falls back to a benign default when the queue is empty.

// Not every test binary touches every helper.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use redlab_docker::{ContainerRuntime, ExecOutput, ManagedContainer};
use redlab_domain::config::LabConfig;
use redlab_domain::{
    AuthToken, ConsoleSessionId, RpcEndpoint, RpcError, RuntimeError,
};
use redlab_msgrpc::{ConsoleChunk, ConsoleSession, MsgRpc};

pub const PROMPT: &str = "msf6 > ";

/// Timing constants shrunk so actor tests finish in milliseconds.
pub fn test_config() -> LabConfig {
    let mut config = LabConfig::default();
    config.console.poll_interval_ms = 5;
    config.console.keepalive_interval_ms = 2_000;
    config.console.read_retry_delays_ms = vec![2, 4, 8];
    config.msgrpc.initial_delay_ms = 1;
    config.msgrpc.backoff_max_ms = 5;
    config.msgrpc.max_connect_attempts = 3;
    config.container.restart_backoff_base_ms = 10;
    config.container.restart_backoff_max_ms = 50;
    config.container.console_restart_cooldown_ms = 60_000;
    config
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MSGRPC mock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct MockRpcState {
    login_script: VecDeque<Result<AuthToken, RpcError>>,
    create_script: VecDeque<Result<ConsoleSession, RpcError>>,
    write_script: VecDeque<Result<u64, RpcError>>,
    read_script: VecDeque<Result<ConsoleChunk, RpcError>>,
    login_count: u32,
    create_count: u32,
    destroy_count: u32,
}

#[derive(Default)]
pub struct MockRpc {
    state: Mutex<MockRpcState>,
}

impl MockRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_read(&self, chunk: ConsoleChunk) {
        self.state.lock().read_script.push_back(Ok(chunk));
    }

    pub fn fail_next_read(&self, error: RpcError) {
        self.state.lock().read_script.push_back(Err(error));
    }

    pub fn fail_next_write(&self, error: RpcError) {
        self.state.lock().write_script.push_back(Err(error));
    }

    pub fn fail_next_login(&self, error: RpcError) {
        self.state.lock().login_script.push_back(Err(error));
    }

    pub fn fail_next_create(&self, error: RpcError) {
        self.state.lock().create_script.push_back(Err(error));
    }

    pub fn login_count(&self) -> u32 {
        self.state.lock().login_count
    }

    pub fn create_count(&self) -> u32 {
        self.state.lock().create_count
    }

    pub fn destroy_count(&self) -> u32 {
        self.state.lock().destroy_count
    }

    /// A read chunk mid-command: more output coming.
    pub fn busy_chunk(data: &str) -> ConsoleChunk {
        ConsoleChunk {
            data: data.into(),
            busy: true,
            prompt: None,
        }
    }

    /// A read chunk ending a command: prompt is back.
    pub fn done_chunk(data: &str) -> ConsoleChunk {
        ConsoleChunk {
            data: data.into(),
            busy: false,
            prompt: Some(PROMPT.into()),
        }
    }
}

#[async_trait]
impl MsgRpc for MockRpc {
    async fn login(
        &self,
        _endpoint: &RpcEndpoint,
        _user: &str,
        _password: &str,
    ) -> Result<AuthToken, RpcError> {
        let mut state = self.state.lock();
        state.login_count += 1;
        let count = state.login_count;
        state
            .login_script
            .pop_front()
            .unwrap_or_else(|| Ok(AuthToken::new(format!("token-{count}"))))
    }

    async fn console_create(
        &self,
        _endpoint: &RpcEndpoint,
        _token: &AuthToken,
    ) -> Result<ConsoleSession, RpcError> {
        let mut state = self.state.lock();
        state.create_count += 1;
        let count = state.create_count;
        state.create_script.pop_front().unwrap_or_else(|| {
            Ok(ConsoleSession {
                id: ConsoleSessionId::new(count.to_string()),
                prompt: PROMPT.into(),
                busy: false,
            })
        })
    }

    async fn console_destroy(
        &self,
        _endpoint: &RpcEndpoint,
        _token: &AuthToken,
        _console: &ConsoleSessionId,
    ) -> Result<(), RpcError> {
        self.state.lock().destroy_count += 1;
        Ok(())
    }

    async fn console_write(
        &self,
        _endpoint: &RpcEndpoint,
        _token: &AuthToken,
        _console: &ConsoleSessionId,
        data: &str,
    ) -> Result<u64, RpcError> {
        self.state
            .lock()
            .write_script
            .pop_front()
            .unwrap_or(Ok(data.len() as u64))
    }

    async fn console_read(
        &self,
        _endpoint: &RpcEndpoint,
        _token: &AuthToken,
        _console: &ConsoleSessionId,
    ) -> Result<ConsoleChunk, RpcError> {
        self.state
            .lock()
            .read_script
            .pop_front()
            .unwrap_or_else(|| Ok(Self::done_chunk("")))
    }

    async fn call(
        &self,
        _endpoint: &RpcEndpoint,
        _token: &AuthToken,
        _method: &str,
        _args: Vec<rmpv::Value>,
    ) -> Result<rmpv::Value, RpcError> {
        Ok(rmpv::Value::Nil)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Container runtime mock
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct MockContainer {
    name: String,
    labels: HashMap<String, String>,
    running: bool,
}

#[derive(Default)]
struct MockRuntimeState {
    containers: HashMap<String, MockContainer>,
    exec_script: VecDeque<Result<ExecOutput, RuntimeError>>,
    next_id: u64,
}

#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockRuntimeState>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_exec(&self, output: &str, exit_code: i64) {
        self.state.lock().exec_script.push_back(Ok(ExecOutput {
            output: output.into(),
            exit_code,
        }));
    }

    pub fn fail_next_exec(&self, error: RuntimeError) {
        self.state.lock().exec_script.push_back(Err(error));
    }

    pub fn running_count(&self) -> usize {
        self.state
            .lock()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    /// Seed a pre-existing container (for adoption tests).
    pub fn seed_container(&self, docker_id: &str, labels: HashMap<String, String>, running: bool) {
        self.state.lock().containers.insert(
            docker_id.to_owned(),
            MockContainer {
                name: docker_id.to_owned(),
                labels,
                running,
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start_container(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        _rpc_port: u16,
    ) -> Result<String, RuntimeError> {
        let mut state = self.state.lock();
        if state.containers.values().any(|c| c.name == name && c.running) {
            return Err(RuntimeError::NameConflict(name.to_owned()));
        }
        state.next_id += 1;
        let docker_id = format!("mock-{}", state.next_id);
        state.containers.insert(
            docker_id.clone(),
            MockContainer {
                name: name.to_owned(),
                labels,
                running: true,
            },
        );
        Ok(docker_id)
    }

    async fn stop_container(&self, docker_id: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        match state.containers.get_mut(docker_id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(docker_id.to_owned())),
        }
    }

    async fn remove_container(&self, docker_id: &str) -> Result<(), RuntimeError> {
        self.state.lock().containers.remove(docker_id);
        Ok(())
    }

    async fn container_running(&self, docker_id: &str) -> Result<bool, RuntimeError> {
        Ok(self
            .state
            .lock()
            .containers
            .get(docker_id)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        Ok(self
            .state
            .lock()
            .containers
            .iter()
            .map(|(docker_id, c)| ManagedContainer {
                docker_id: docker_id.clone(),
                name: c.name.clone(),
                running: c.running,
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn exec(
        &self,
        docker_id: &str,
        _command: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.state.lock();
        if !state
            .containers
            .get(docker_id)
            .map(|c| c.running)
            .unwrap_or(false)
        {
            return Err(RuntimeError::NotFound(docker_id.to_owned()));
        }
        state.exec_script.pop_front().unwrap_or(Ok(ExecOutput {
            output: String::new(),
            exit_code: 0,
        }))
    }

    async fn resolve_rpc_endpoint(&self, docker_id: &str) -> Result<RpcEndpoint, RuntimeError> {
        if self.state.lock().containers.contains_key(docker_id) {
            Ok(RpcEndpoint::new("127.0.0.1", 55553))
        } else {
            Err(RuntimeError::NotFound(docker_id.to_owned()))
        }
    }
}
