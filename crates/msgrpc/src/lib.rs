//! MSGRPC capability interface: the in-container Metasploit console RPC.
//!
//! The wire format is MessagePack-encoded arrays over HTTP POST to a fixed
//! path; every call but `login` carries the session token as its first
//! argument. The engine depends only on the [`MsgRpc`] trait, so tests swap
//! in scripted fakes and never touch the network.
//!
//! `console_read` is destructive: bytes returned are removed from the
//! server's buffer, so callers must accumulate. `busy = true` means more
//! output is coming for the current command; the prompt is only meaningful
//! once `busy` drops to `false`.

mod http;
mod wire;

pub use http::HttpMsgRpc;

use async_trait::async_trait;
use redlab_domain::{AuthToken, ConsoleSessionId, RpcEndpoint, RpcError};

/// Result of `console.create`.
#[derive(Debug, Clone)]
pub struct ConsoleSession {
    pub id: ConsoleSessionId,
    pub prompt: String,
    pub busy: bool,
}

/// One destructive read from the console's output buffer.
#[derive(Debug, Clone)]
pub struct ConsoleChunk {
    pub data: String,
    /// More output is coming for the current command.
    pub busy: bool,
    /// Present when `busy` is false.
    pub prompt: Option<String>,
}

/// Capability interface over the console RPC.
///
/// Any call may fail with [`RpcError::Auth`] when the token has expired;
/// that is fatal for the current session and must not be retried here.
#[async_trait]
pub trait MsgRpc: Send + Sync {
    async fn login(
        &self,
        endpoint: &RpcEndpoint,
        user: &str,
        password: &str,
    ) -> Result<AuthToken, RpcError>;

    async fn console_create(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
    ) -> Result<ConsoleSession, RpcError>;

    async fn console_destroy(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        console: &ConsoleSessionId,
    ) -> Result<(), RpcError>;

    /// Returns the number of bytes the server accepted.
    async fn console_write(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        console: &ConsoleSessionId,
        data: &str,
    ) -> Result<u64, RpcError>;

    async fn console_read(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        console: &ConsoleSessionId,
    ) -> Result<ConsoleChunk, RpcError>;

    /// Escape hatch for methods the typed surface doesn't cover
    /// (e.g. `db.hosts`, `core.version`).
    async fn call(
        &self,
        endpoint: &RpcEndpoint,
        token: &AuthToken,
        method: &str,
        args: Vec<rmpv::Value>,
    ) -> Result<rmpv::Value, RpcError>;
}
