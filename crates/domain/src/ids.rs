//! Identifier newtypes used across the workspace.
//!
//! Workspace/container/track ids are opaque integers assigned by the
//! collaborating persistence layer. Command ids are generated locally.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

macro_rules! int_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

int_id! {
    /// Top-level multi-tenant unit. Every container, track, and event is
    /// workspace-scoped.
    WorkspaceId
}

int_id! {
    /// A managed sandbox container record.
    ContainerId
}

int_id! {
    /// A long-lived research session bound to one container.
    TrackId
}

int_id! {
    /// A chat timeline entry (user message, assistant block, tool invocation).
    EntryId
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommandId
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identifier of a single console or shell command invocation.
///
/// 16 lowercase hex characters derived from 8 cryptographically random
/// bytes, so ids are unguessable across tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandId(String);

impl CommandId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    /// Accept an externally supplied id if it has the canonical shape.
    pub fn parse(s: &str) -> Option<Self> {
        let ok = s.len() == 16
            && s.bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        ok.then(|| Self(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RPC identifiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Console session id assigned by the MSGRPC server on `console.create`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConsoleSessionId(String);

impl ConsoleSessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsoleSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque MSGRPC credential returned by `auth.login`.
///
/// Debug output is redacted so tokens never land in logs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(****)")
    }
}

/// Host/port pair where a container's MSGRPC listener is reachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEndpoint {
    pub host: String,
    pub port: u16,
}

impl RpcEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for RpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Naming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Externally visible container name: `<prefix>-<workspace>-<container>`.
///
/// A pure function of the two slugs. The container slug is immutable after
/// creation because it names Docker resources.
pub fn container_name(prefix: &str, workspace_slug: &str, container_slug: &str) -> String {
    format!("{prefix}-{workspace_slug}-{container_slug}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_id_shape() {
        let id = CommandId::generate();
        assert_eq!(id.as_str().len(), 16);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn command_ids_are_unique() {
        let a = CommandId::generate();
        let b = CommandId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn command_id_parse_rejects_bad_shapes() {
        assert!(CommandId::parse("0123456789abcdef").is_some());
        assert!(CommandId::parse("0123456789ABCDEF").is_none());
        assert!(CommandId::parse("0123456789abcde").is_none());
        assert!(CommandId::parse("0123456789abcdeg").is_none());
    }

    #[test]
    fn container_name_is_pure_join() {
        assert_eq!(
            container_name("redlab", "acme", "msf-1"),
            "redlab-acme-msf-1"
        );
    }

    #[test]
    fn auth_token_debug_is_redacted() {
        let token = AuthToken::new("super-secret");
        assert_eq!(format!("{token:?}"), "AuthToken(****)");
        assert_eq!(token.expose(), "super-secret");
    }
}
