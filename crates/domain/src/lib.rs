//! Shared domain types for the RedLab orchestration core.
//!
//! Identifiers, configuration, the error taxonomy, command records, tool
//! descriptors, and the event vocabulary. Everything here is plain data;
//! actors and I/O live in `redlab-engine` and the adapter crates.

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod tool;

pub use command::{CommandKind, CommandRecord, CommandStatus};
pub use config::LabConfig;
pub use error::{ConsoleError, NoPortsAvailable, RpcError, RuntimeError, ToolError};
pub use event::{ConsoleStatus, ContainerStatus, Event, Topic};
pub use ids::{
    container_name, AuthToken, CommandId, ConsoleSessionId, ContainerId, EntryId, RpcEndpoint,
    TrackId, WorkspaceId,
};
pub use tool::{MutexGroup, ToolCall, ToolDescriptor, ToolRegistry};
