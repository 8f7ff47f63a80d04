//! Registry of container actors.
//!
//! One actor per logical container, created on demand and kept until
//! explicit shutdown. `ensure_container` is idempotent, which makes it the
//! natural entry point for a startup reconciler replaying persisted
//! container records.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use redlab_docker::ContainerRuntime;
use redlab_domain::config::LabConfig;
use redlab_domain::ContainerId;
use redlab_msgrpc::MsgRpc;

use crate::container::{self, ContainerDeps, ContainerHandle, ContainerSpec};
use crate::events::EventBus;
use crate::trace::CommandTraceSink;

pub struct Supervisor {
    deps: ContainerDeps,
    containers: RwLock<HashMap<ContainerId, ContainerHandle>>,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        rpc: Arc<dyn MsgRpc>,
        bus: Arc<EventBus>,
        trace: Arc<dyn CommandTraceSink>,
        config: LabConfig,
    ) -> Self {
        Self {
            deps: ContainerDeps {
                runtime,
                rpc,
                bus,
                trace,
                config,
            },
            containers: RwLock::new(HashMap::new()),
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.deps.bus.clone()
    }

    /// Return the live actor for this container, spawning one if needed.
    /// Calling it twice with the same id hands back the same actor.
    pub fn ensure_container(&self, spec: ContainerSpec) -> ContainerHandle {
        let mut containers = self.containers.write();
        if let Some(handle) = containers.get(&spec.container_id) {
            if handle.is_alive() {
                return handle.clone();
            }
        }
        let handle = container::spawn(spec.clone(), self.deps.clone());
        containers.insert(spec.container_id, handle.clone());
        handle
    }

    pub fn get(&self, container_id: ContainerId) -> Option<ContainerHandle> {
        self.containers
            .read()
            .get(&container_id)
            .filter(|h| h.is_alive())
            .cloned()
    }

    pub fn container_ids(&self) -> Vec<ContainerId> {
        self.containers.read().keys().copied().collect()
    }

    /// Gracefully stop every container actor and forget the handles.
    pub async fn stop_all(&self) {
        let handles: Vec<ContainerHandle> = {
            let mut containers = self.containers.write();
            containers.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.stop().await;
        }
    }
}
