//! Error taxonomy for the orchestration core.
//!
//! Synchronous operations return `Result` with one of these tagged kinds;
//! callers never see panics. Display strings double as the user-visible
//! messages embedded into tool results, so an agent's next turn can see
//! what went wrong and react.

use serde::Serialize;

/// Errors surfaced by console command submission and the console actor.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConsoleError {
    #[error("Container is not running")]
    ContainerNotRunning,

    #[error("Console is not registered for this track")]
    ConsoleNotRegistered,

    #[error("Console is offline")]
    ConsoleOffline,

    #[error("Console is still starting")]
    ConsoleStarting,

    #[error("Console is busy processing a command")]
    ConsoleBusy,

    #[error("Console write failed: {0}")]
    WriteFailed(String),

    #[error("Console read failed: {0}")]
    ReadFailed(String),

    #[error("Console keepalive failed: {0}")]
    KeepaliveFailed(String),

    #[error("Console session could not be created: {0}")]
    SessionCreateFailed(String),
}

/// MSGRPC channel failures.
///
/// `Auth` is fatal for the current session: the token is gone and only a
/// fresh `login` can recover, so callers must not retry the failing call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rpc transport: {0}")]
    Transport(String),

    #[error("rpc server error {name}: {message}")]
    Server { name: String, message: String },

    #[error("rpc decode: {0}")]
    Decode(String),
}

impl RpcError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// Container runtime adapter failures.
#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("container runtime transport: {0}")]
    Transport(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("RPC port is not mapped for container {0}")]
    PortNotMapped(String),

    #[error("exec failed: {0}")]
    ExecFailed(String),
}

/// Tool resolution and execution failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Missing required parameter: {0}")]
    MissingParameter(String),

    #[error("Invalid status for this operation")]
    InvalidStatus,

    #[error("Not found")]
    NotFound,

    #[error("Tool execution timed out")]
    Timeout,

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

/// The configured port range has no free port left.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no ports available in the configured range")]
pub struct NoPortsAvailable;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_errors_have_human_messages() {
        assert_eq!(ConsoleError::ConsoleOffline.to_string(), "Console is offline");
        assert_eq!(
            ConsoleError::ConsoleBusy.to_string(),
            "Console is busy processing a command"
        );
    }

    #[test]
    fn auth_errors_are_flagged_fatal() {
        assert!(RpcError::Auth("token expired".into()).is_auth());
        assert!(!RpcError::Transport("connection reset".into()).is_auth());
    }

    #[test]
    fn console_error_serializes_tagged() {
        let json = serde_json::to_value(ConsoleError::WriteFailed("boom".into())).unwrap();
        assert_eq!(json["kind"], "write_failed");
        assert_eq!(json["detail"], "boom");
    }
}
