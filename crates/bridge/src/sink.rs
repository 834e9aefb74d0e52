//! Where applied intents end up.

use tracing::info;

use crate::{
    approval::{ApprovalResolution, PendingApproval},
    policy::AgentStatusPatch,
};

/// External mutators the handler drives. Implementations must not block;
/// anything slow belongs on a task of its own.
pub trait IntentSink: Send + Sync {
    /// Apply a (possibly batched) patch to one agent's state.
    fn patch_agent(&self, agent_id: &str, patch: &AgentStatusPatch);

    /// Append finished output to the agent's transcript.
    fn commit_chat(&self, agent_id: &str, lines: &[String]);

    fn refresh_summary(&self);

    fn refresh_history(&self, agent_id: &str, reason: &str);

    fn approval_pending(&self, agent_id: &str, approval: &PendingApproval);

    fn approval_resolved(&self, agent_id: &str, resolution: &ApprovalResolution);
}

/// Writes every applied intent to the log. Used by `studio watch`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl IntentSink for TracingSink {
    fn patch_agent(&self, agent_id: &str, patch: &AgentStatusPatch) {
        info!(agent_id, ?patch, "agent patch");
    }

    fn commit_chat(&self, agent_id: &str, lines: &[String]) {
        for line in lines {
            info!(agent_id, line = %line, "chat");
        }
    }

    fn refresh_summary(&self) {
        info!("summary refresh");
    }

    fn refresh_history(&self, agent_id: &str, reason: &str) {
        info!(agent_id, reason, "history refresh");
    }

    fn approval_pending(&self, agent_id: &str, approval: &PendingApproval) {
        info!(
            agent_id,
            approval_id = %approval.id,
            command = %approval.command,
            "approval requested"
        );
    }

    fn approval_resolved(&self, agent_id: &str, resolution: &ApprovalResolution) {
        info!(
            agent_id,
            approval_id = %resolution.id,
            decision = resolution.decision.as_deref().unwrap_or("unknown"),
            "approval resolved"
        );
    }
}
