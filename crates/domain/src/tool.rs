//! Tool descriptors and the built-in registry.
//!
//! A descriptor tells the scheduler everything it needs: the JSON-schema
//! parameter spec shown to the LLM, whether a human must approve the call,
//! an optional execution timeout, and the mutex group that serializes it
//! against conflicting tools.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Tools sharing this key run sequentially: the console is single-threaded.
pub const MUTEX_CONSOLE: &str = "console";
/// Agent working memory must accumulate in submission order.
pub const MUTEX_MEMORY: &str = "memory";

/// A single request by the agent to execute a named tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Mutex key of a descriptor; `None` means freely parallel.
pub type MutexGroup = Option<String>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    pub description: String,
    /// JSON-schema-style parameter spec.
    pub parameters: serde_json::Value,
    #[serde(default = "d_true")]
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutex: MutexGroup,
}

fn d_true() -> bool {
    true
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lookup table of tool descriptors, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    descriptors: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in tool set every track gets.
    pub fn builtin() -> Self {
        let mut registry = Self::default();

        registry.register(ToolDescriptor {
            name: "msf_console".into(),
            description: "Run a command in the sandbox's Metasploit console. \
                          Output streams back as the console produces it."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Console command, e.g. 'db_status'" }
                },
                "required": ["command"]
            }),
            approval_required: true,
            timeout_ms: Some(300_000),
            mutex: Some(MUTEX_CONSOLE.into()),
        });

        registry.register(ToolDescriptor {
            name: "bash".into(),
            description: "Run a one-shot shell command inside the sandbox container.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" }
                },
                "required": ["command"]
            }),
            approval_required: true,
            timeout_ms: Some(120_000),
            mutex: None,
        });

        registry.register(ToolDescriptor {
            name: "db_query".into(),
            description: "Query the workspace's security database (hosts, services, \
                          vulns, creds, loot). Read-only."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "table": {
                        "type": "string",
                        "enum": ["hosts", "services", "vulns", "creds", "loot", "notes"],
                        "description": "Which table to query"
                    },
                    "filter": { "type": "string", "description": "Optional filter expression" }
                },
                "required": ["table"]
            }),
            approval_required: false,
            timeout_ms: Some(30_000),
            mutex: None,
        });

        registry.register(ToolDescriptor {
            name: "memory_update".into(),
            description: "Replace a section of the agent's working memory for this track.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "section": { "type": "string", "description": "Memory section name" },
                    "content": { "type": "string", "description": "New section content" }
                },
                "required": ["section", "content"]
            }),
            approval_required: false,
            timeout_ms: None,
            mutex: Some(MUTEX_MEMORY.into()),
        });

        registry
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        self.descriptors.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.get(name)
    }

    /// Descriptors sorted by name, for stable listings.
    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut all: Vec<_> = self.descriptors.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
