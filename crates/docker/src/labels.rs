//! Label schema for managed containers.
//!
//! Labels are the only identity the runtime stores for us: the record id,
//! the slugs the external name derives from, and the RPC port chosen at
//! creation. `managed=true` is the stable marker every list query filters
//! on.

use std::collections::HashMap;

use redlab_domain::ContainerId;

pub const LABEL_MANAGED: &str = "redlab.managed";
pub const LABEL_CONTAINER_ID: &str = "redlab.container_id";
pub const LABEL_WORKSPACE_SLUG: &str = "redlab.workspace_slug";
pub const LABEL_CONTAINER_SLUG: &str = "redlab.container_slug";
pub const LABEL_RPC_PORT: &str = "redlab.rpc_port";

/// Typed view of the labels a managed container carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLabels {
    pub container_id: ContainerId,
    pub workspace_slug: String,
    pub container_slug: String,
    pub rpc_port: u16,
}

impl ContainerLabels {
    /// Parse the typed view back out of a raw label map. Returns `None`
    /// for unmanaged containers or mangled labels.
    pub fn parse(labels: &HashMap<String, String>) -> Option<Self> {
        if labels.get(LABEL_MANAGED).map(String::as_str) != Some("true") {
            return None;
        }
        Some(Self {
            container_id: ContainerId(labels.get(LABEL_CONTAINER_ID)?.parse().ok()?),
            workspace_slug: labels.get(LABEL_WORKSPACE_SLUG)?.clone(),
            container_slug: labels.get(LABEL_CONTAINER_SLUG)?.clone(),
            rpc_port: labels.get(LABEL_RPC_PORT)?.parse().ok()?,
        })
    }
}

/// The label set stamped onto every managed container at creation.
pub fn build_labels(
    container_id: ContainerId,
    workspace_slug: &str,
    container_slug: &str,
    rpc_port: u16,
) -> HashMap<String, String> {
    HashMap::from([
        (LABEL_MANAGED.to_owned(), "true".to_owned()),
        (LABEL_CONTAINER_ID.to_owned(), container_id.to_string()),
        (LABEL_WORKSPACE_SLUG.to_owned(), workspace_slug.to_owned()),
        (LABEL_CONTAINER_SLUG.to_owned(), container_slug.to_owned()),
        (LABEL_RPC_PORT.to_owned(), rpc_port.to_string()),
    ])
}
