//! Event vocabulary published on the bus.
//!
//! One explicit variant per event kind. Collaborators translate these to
//! WebSocket frames or stdout; the core only guarantees per-publisher
//! ordering and best-effort delivery.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::command::CommandRecord;
use crate::ids::{CommandId, ContainerId, TrackId, WorkspaceId};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Topics
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Subscription key. Every event is published under one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Workspace(WorkspaceId),
    Container(ContainerId),
    Track(TrackId),
}

impl Topic {
    /// The wire-level key, e.g. `container:7`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Workspace(id) => write!(f, "workspace:{id}"),
            Topic::Container(id) => write!(f, "container:{id}"),
            Topic::Track(id) => write!(f, "track:{id}"),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Statuses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Offline,
    Starting,
    Running,
}

/// Console status as subscribers see it. The actor itself never holds
/// `Offline`: a dead actor is offline, and the parent container
/// synthesizes that event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleStatus {
    Starting,
    Ready,
    Busy,
    Offline,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "container_status_changed")]
    ContainerStatusChanged {
        workspace_id: WorkspaceId,
        container_id: ContainerId,
        status: ContainerStatus,
    },

    #[serde(rename = "console_updated")]
    ConsoleUpdated {
        container_id: ContainerId,
        track_id: TrackId,
        status: ConsoleStatus,
        /// New output delta, present when the poll drained bytes.
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command_id: Option<CommandId>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        /// Set on `offline` when restart attempts are exhausted and the
        /// console will not come back without operator action.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        permanent: bool,
    },

    #[serde(rename = "command_result")]
    CommandResult {
        container_id: ContainerId,
        track_id: TrackId,
        command: CommandRecord,
    },

    #[serde(rename = "database_updated")]
    DatabaseUpdated {
        workspace_id: WorkspaceId,
        changes: serde_json::Value,
        totals: serde_json::Value,
    },

    #[serde(rename = "workspace_changed")]
    WorkspaceChanged { workspace_id: WorkspaceId },

    #[serde(rename = "chat_changed")]
    ChatChanged { track_id: TrackId },
}

impl Event {
    /// Convenience constructor for the common console transition event.
    pub fn console_status(
        container_id: ContainerId,
        track_id: TrackId,
        status: ConsoleStatus,
    ) -> Self {
        Event::ConsoleUpdated {
            container_id,
            track_id,
            status,
            output: None,
            prompt: None,
            command_id: None,
            command: None,
            permanent: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_keys() {
        assert_eq!(Topic::Workspace(WorkspaceId(3)).key(), "workspace:3");
        assert_eq!(Topic::Container(ContainerId(7)).key(), "container:7");
        assert_eq!(Topic::Track(TrackId(42)).key(), "track:42");
    }

    #[test]
    fn console_event_omits_empty_fields() {
        let event = Event::console_status(ContainerId(1), TrackId(2), ConsoleStatus::Ready);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "console_updated");
        assert_eq!(json["status"], "ready");
        assert!(json.get("output").is_none());
        assert!(json.get("permanent").is_none());
    }
}
