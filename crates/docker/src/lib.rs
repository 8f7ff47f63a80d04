//! Container runtime capability interface and its Docker implementation.
//!
//! Managed containers are identified exclusively by their labels, so
//! endpoint resolution survives an orchestrator restart without database
//! help. The engine depends only on the [`ContainerRuntime`] trait.

mod labels;
mod runtime;

pub use labels::{build_labels, ContainerLabels};
pub use runtime::DockerRuntime;

use std::collections::HashMap;

use async_trait::async_trait;
use redlab_domain::{RpcEndpoint, RuntimeError};

/// A managed container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    pub docker_id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

impl ManagedContainer {
    /// The RPC port recorded at creation time, if the label parses.
    pub fn rpc_port(&self) -> Option<u16> {
        self.labels
            .get(labels::LABEL_RPC_PORT)
            .and_then(|v| v.parse().ok())
    }
}

/// Output of a one-shot command inside a container.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i64,
}

/// Thin capability interface to the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container with the given external name and
    /// labels, exposing `rpc_port`. A name collision with a stale managed
    /// container is recoverable: the implementation force-removes it and
    /// retries once.
    async fn start_container(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        rpc_port: u16,
    ) -> Result<String, RuntimeError>;

    async fn stop_container(&self, docker_id: &str) -> Result<(), RuntimeError>;

    /// Force-remove, used by collision recovery and teardown.
    async fn remove_container(&self, docker_id: &str) -> Result<(), RuntimeError>;

    async fn container_running(&self, docker_id: &str) -> Result<bool, RuntimeError>;

    /// All containers carrying the managed marker label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;

    async fn exec(&self, docker_id: &str, command: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Where the container's MSGRPC listener is reachable from here,
    /// according to the configured network mode.
    async fn resolve_rpc_endpoint(&self, docker_id: &str) -> Result<RpcEndpoint, RuntimeError>;
}
