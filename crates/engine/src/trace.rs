//! Trace sink for completed console commands.
//!
//! The console actor hands the full `{prompt, command, output}` record to a
//! sink once a command finishes. The default sink is a structured log
//! line; a persistence collaborator can swap in its own implementation.

use serde::Serialize;

use redlab_domain::{CommandId, ContainerId, TrackId, WorkspaceId};

#[derive(Debug, Clone, Serialize)]
pub struct CommandTrace {
    pub workspace_id: WorkspaceId,
    pub container_id: ContainerId,
    pub track_id: TrackId,
    pub command_id: CommandId,
    pub command: String,
    pub output: String,
    pub prompt: String,
}

pub trait CommandTraceSink: Send + Sync {
    fn record(&self, trace: CommandTrace);
}

/// Default sink: one structured log line per completed command.
pub struct LogTraceSink;

impl CommandTraceSink for LogTraceSink {
    fn record(&self, trace: CommandTrace) {
        tracing::info!(
            workspace_id = %trace.workspace_id,
            container_id = %trace.container_id,
            track_id = %trace.track_id,
            command_id = %trace.command_id,
            command = %trace.command,
            output_chars = trace.output.len(),
            "console command completed"
        );
    }
}

/// Discards everything; for tests that assert on events instead.
pub struct NullTraceSink;

impl CommandTraceSink for NullTraceSink {
    fn record(&self, _trace: CommandTrace) {}
}
