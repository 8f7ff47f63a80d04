//! Command records: one value per console or shell invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::CommandId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Console,
    Shell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Running,
    Finished,
    Error,
}

/// One command invocation as observed by subscribers.
///
/// `output` accumulates across deltas; `prompt` is replaced, never appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: CommandId,
    pub kind: CommandKind,
    pub text: String,
    pub status: CommandStatus,
    pub output: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl CommandRecord {
    pub fn console(id: CommandId, text: impl Into<String>) -> Self {
        Self::new(id, CommandKind::Console, text)
    }

    pub fn shell(id: CommandId, text: impl Into<String>) -> Self {
        Self::new(id, CommandKind::Shell, text)
    }

    fn new(id: CommandId, kind: CommandKind, text: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            text: text.into(),
            status: CommandStatus::Running,
            output: String::new(),
            prompt: String::new(),
            exit_code: None,
            error: None,
            started_at: Utc::now(),
        }
    }

    pub fn append_output(&mut self, delta: &str) {
        self.output.push_str(delta);
    }

    pub fn set_prompt(&mut self, prompt: impl Into<String>) {
        self.prompt = prompt.into();
    }

    pub fn finish(&mut self, exit_code: Option<i64>) {
        self.status = CommandStatus::Finished;
        self.exit_code = exit_code;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = CommandStatus::Error;
        self.error = Some(error.into());
    }
}
