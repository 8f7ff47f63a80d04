//! Docker Engine implementation of [`ContainerRuntime`] over bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, InspectContainerOptions, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::StreamExt;

use redlab_domain::config::{DockerConfig, NetworkMode};
use redlab_domain::{RpcEndpoint, RuntimeError};

use crate::labels::{LABEL_MANAGED, LABEL_RPC_PORT};
use crate::{ContainerRuntime, ExecOutput, ManagedContainer};

const STOP_TIMEOUT_SECS: i32 = 10;

pub struct DockerRuntime {
    docker: Docker,
    config: DockerConfig,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Result<Self, RuntimeError> {
        let docker = if let Some(path) = config.host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
        } else if config.host.starts_with("tcp://") || config.host.starts_with("http://") {
            Docker::connect_with_http(&config.host, 120, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_local_defaults()
        }
        .map_err(|e| RuntimeError::Transport(e.to_string()))?;

        Ok(Self { docker, config })
    }

    async fn create_and_start(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
        rpc_port: u16,
    ) -> Result<String, RuntimeError> {
        let port_key = format!("{rpc_port}/tcp");

        let host_config = match self.config.network_mode {
            NetworkMode::Host => HostConfig {
                network_mode: Some("host".into()),
                ..Default::default()
            },
            NetworkMode::PortMapping => HostConfig {
                port_bindings: Some(HashMap::from([(
                    port_key.clone(),
                    Some(vec![PortBinding {
                        host_ip: Some("127.0.0.1".into()),
                        // Empty host port: the daemon picks a free one.
                        host_port: None,
                    }]),
                )])),
                ..Default::default()
            },
            NetworkMode::UserNetwork => HostConfig {
                network_mode: Some(self.config.network.clone()),
                ..Default::default()
            },
        };

        let body = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            labels: Some(labels.clone()),
            exposed_ports: Some(vec![port_key]),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptionsBuilder::default().name(name).build();
        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(map_err)?;

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(map_err)?;

        Ok(created.id)
    }

    /// The RPC port recorded in the container's labels at creation.
    async fn labeled_rpc_port(&self, docker_id: &str) -> Result<u16, RuntimeError> {
        let inspect = self
            .docker
            .inspect_container(docker_id, None::<InspectContainerOptions>)
            .await
            .map_err(map_err)?;
        inspect
            .config
            .and_then(|c| c.labels)
            .and_then(|labels| labels.get(LABEL_RPC_PORT).cloned())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| RuntimeError::PortNotMapped(docker_id.to_owned()))
    }
}

fn map_err(e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => RuntimeError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::NameConflict(message),
        other => RuntimeError::Transport(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start_container(
        &self,
        name: &str,
        labels: HashMap<String, String>,
        rpc_port: u16,
    ) -> Result<String, RuntimeError> {
        match self.create_and_start(name, &labels, rpc_port).await {
            Ok(id) => Ok(id),
            Err(RuntimeError::NameConflict(_)) => {
                // A stale container from a previous run holds the name.
                tracing::warn!(name, "container name in use, removing stale container");
                self.remove_container(name).await?;
                self.create_and_start(name, &labels, rpc_port).await
            }
            Err(e) => Err(e),
        }
    }

    async fn stop_container(&self, docker_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(
                docker_id,
                Some(
                    StopContainerOptionsBuilder::default()
                        .t(STOP_TIMEOUT_SECS)
                        .build(),
                ),
            )
            .await
            .map_err(map_err)
    }

    async fn remove_container(&self, docker_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .remove_container(
                docker_id,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await
            .map_err(map_err)
    }

    async fn container_running(&self, docker_id: &str) -> Result<bool, RuntimeError> {
        match self
            .docker
            .inspect_container(docker_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(inspect
                .state
                .and_then(|s| s.running)
                .unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        let filters = HashMap::from([(
            "label".to_owned(),
            vec![format!("{LABEL_MANAGED}=true")],
        )]);
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(map_err)?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                Some(ManagedContainer {
                    docker_id: summary.id?,
                    name: summary
                        .names
                        .and_then(|names| names.into_iter().next())
                        .map(|n| n.trim_start_matches('/').to_owned())
                        .unwrap_or_default(),
                    running: summary
                        .state
                        .map(|s| s.to_string().eq_ignore_ascii_case("running"))
                        .unwrap_or(false),
                    labels: summary.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn exec(&self, docker_id: &str, command: &[String]) -> Result<ExecOutput, RuntimeError> {
        let exec = self
            .docker
            .create_exec(
                docker_id,
                CreateExecOptions {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        let mut output = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?
        {
            StartExecResults::Attached {
                output: mut stream, ..
            } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;
                    output.push_str(&chunk.to_string());
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| RuntimeError::ExecFailed(e.to_string()))?;

        Ok(ExecOutput {
            output,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }

    async fn resolve_rpc_endpoint(&self, docker_id: &str) -> Result<RpcEndpoint, RuntimeError> {
        let labeled_port = self.labeled_rpc_port(docker_id).await?;

        match self.config.network_mode {
            NetworkMode::Host => Ok(RpcEndpoint::new("localhost", labeled_port)),
            NetworkMode::PortMapping => {
                let inspect = self
                    .docker
                    .inspect_container(docker_id, None::<InspectContainerOptions>)
                    .await
                    .map_err(map_err)?;
                let host_port = inspect
                    .network_settings
                    .and_then(|ns| ns.ports)
                    .and_then(|ports| {
                        ports
                            .get(&format!("{labeled_port}/tcp"))
                            .cloned()
                            .flatten()
                    })
                    .and_then(|bindings| bindings.into_iter().next())
                    .and_then(|binding| binding.host_port)
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(|| RuntimeError::PortNotMapped(docker_id.to_owned()))?;
                Ok(RpcEndpoint::new("127.0.0.1", host_port))
            }
            NetworkMode::UserNetwork => {
                let inspect = self
                    .docker
                    .inspect_container(docker_id, None::<InspectContainerOptions>)
                    .await
                    .map_err(map_err)?;
                let name = inspect
                    .name
                    .map(|n| n.trim_start_matches('/').to_owned())
                    .ok_or_else(|| RuntimeError::NotFound(docker_id.to_owned()))?;
                Ok(RpcEndpoint::new(name, labeled_port))
            }
        }
    }
}
