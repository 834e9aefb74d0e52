//! Classified events → ordered intents. Pure; every input maps to at least one
//! intent, with [`EventIntent::Ignore`] carrying the reason when nothing applies.

use serde::Serialize;

use crate::{
    approval::{ApprovalResolution, PendingApproval},
    classify::{
        ASSISTANT_STREAM, AgentPayload, ChatPayload, ChatState, ClassifiedEvent, EventKind,
        LIFECYCLE_STREAM, LifecyclePhase, is_reasoning_stream,
    },
};

/// Reason attached to the history refresh after a final without a thinking trace.
pub const HISTORY_REFRESH_NO_TRACE: &str = "chat-final-no-trace";

// ── Patches ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Running,
    Error,
}

/// One field of a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "op", content = "value")]
pub enum FieldPatch<T> {
    /// Leave the current value alone.
    #[default]
    Keep,
    Clear,
    Set(T),
}

impl<T> FieldPatch<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, Self::Keep)
    }

    /// `newer` wins unless it leaves the field alone.
    pub fn overlay(self, newer: Self) -> Self {
        match newer {
            Self::Keep => self,
            newer => newer,
        }
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<Option<T>> for FieldPatch<T> {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Keep, Self::Set)
    }
}

/// Delta against one agent's externally owned state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(skip_serializing_if = "FieldPatch::is_keep")]
    pub run_id: FieldPatch<String>,
    #[serde(skip_serializing_if = "FieldPatch::is_keep")]
    pub run_started_at: FieldPatch<u64>,
    #[serde(skip_serializing_if = "FieldPatch::is_keep")]
    pub streaming_text: FieldPatch<String>,
    #[serde(skip_serializing_if = "FieldPatch::is_keep")]
    pub thinking_trace: FieldPatch<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<u64>,
}

impl AgentStatusPatch {
    /// A run has started: fresh run id, no leftover streaming state.
    pub fn running(run_id: Option<String>, started_at: u64) -> Self {
        Self {
            status: Some(AgentStatus::Running),
            run_id: run_id.into(),
            run_started_at: FieldPatch::Set(started_at),
            streaming_text: FieldPatch::Clear,
            thinking_trace: FieldPatch::Clear,
            last_activity_at: Some(started_at),
        }
    }

    /// A run has ended. `error` becomes the visible streaming text.
    pub fn terminal(error: Option<String>, at: u64) -> Self {
        Self {
            status: Some(if error.is_some() {
                AgentStatus::Error
            } else {
                AgentStatus::Idle
            }),
            run_id: FieldPatch::Clear,
            run_started_at: FieldPatch::Clear,
            streaming_text: error.map_or(FieldPatch::Clear, FieldPatch::Set),
            thinking_trace: FieldPatch::Clear,
            last_activity_at: Some(at),
        }
    }

    /// Streaming progress for the live queue.
    pub fn live(
        run_id: Option<String>,
        text: Option<String>,
        thinking: Option<String>,
        at: u64,
    ) -> Self {
        Self {
            status: Some(AgentStatus::Running),
            run_id: run_id.into(),
            run_started_at: FieldPatch::Keep,
            streaming_text: text.into(),
            thinking_trace: thinking.into(),
            last_activity_at: Some(at),
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == Some(AgentStatus::Running)
    }

    /// Field-wise last write wins.
    pub fn overlay(self, newer: Self) -> Self {
        Self {
            status: newer.status.or(self.status),
            run_id: self.run_id.overlay(newer.run_id),
            run_started_at: self.run_started_at.overlay(newer.run_started_at),
            streaming_text: self.streaming_text.overlay(newer.streaming_text),
            thinking_trace: self.thinking_trace.overlay(newer.thinking_trace),
            last_activity_at: newer.last_activity_at.or(self.last_activity_at),
        }
    }
}

// ── Intents ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Plane {
    /// Session output: streaming text and committed transcript lines.
    Work,
    /// Agent lifecycle and fleet summary.
    Agent,
    /// Exec approvals.
    Trust,
}

/// What should happen as a result of one event.
///
/// `run_id` on status-bearing variants is the run the event belongs to, which
/// may differ from the run id the patch writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventIntent {
    QueueLivePatch {
        agent_id: String,
        patch: AgentStatusPatch,
    },
    ClearPendingLivePatch {
        agent_id: String,
    },
    CommitChat {
        agent_id: String,
        run_id: Option<String>,
        patch: AgentStatusPatch,
        output_lines: Vec<String>,
    },
    UpdateAgentStatus {
        agent_id: String,
        run_id: Option<String>,
        patch: AgentStatusPatch,
    },
    ScheduleSummaryRefresh,
    RequestHistoryRefresh {
        agent_id: String,
        reason: String,
    },
    ApprovalPending {
        agent_id: String,
        approval: PendingApproval,
    },
    ApprovalResolved {
        agent_id: String,
        resolution: ApprovalResolution,
    },
    Ignore {
        reason: String,
    },
}

impl EventIntent {
    pub fn ignore(reason: impl Into<String>) -> Self {
        Self::Ignore {
            reason: reason.into(),
        }
    }

    /// `None` for [`EventIntent::Ignore`].
    pub fn plane(&self) -> Option<Plane> {
        match self {
            Self::QueueLivePatch { .. }
            | Self::ClearPendingLivePatch { .. }
            | Self::CommitChat { .. }
            | Self::RequestHistoryRefresh { .. } => Some(Plane::Work),
            Self::UpdateAgentStatus { .. } | Self::ScheduleSummaryRefresh => Some(Plane::Agent),
            Self::ApprovalPending { .. } | Self::ApprovalResolved { .. } => Some(Plane::Trust),
            Self::Ignore { .. } => None,
        }
    }
}

// ── Decisions ────────────────────────────────────────────────────────────────

/// Map one classified event to the intents it implies, in application order.
pub fn decide(event: &ClassifiedEvent) -> Vec<EventIntent> {
    match &event.kind {
        EventKind::SummaryRefresh => vec![EventIntent::ScheduleSummaryRefresh],
        EventKind::Ignore(reason) => vec![EventIntent::ignore(reason.clone())],
        kind => {
            let Some(agent_id) = event.agent_id.clone() else {
                return vec![EventIntent::ignore(format!("{} event without an agent id", event.event))];
            };
            match kind {
                EventKind::Work => work_intents(event, agent_id),
                EventKind::Agent => agent_intents(event, agent_id),
                EventKind::Trust { requested } => trust_intents(event, agent_id, *requested),
                EventKind::SummaryRefresh | EventKind::Ignore(_) => Vec::new(),
            }
        },
    }
}

fn work_intents(event: &ClassifiedEvent, agent_id: String) -> Vec<EventIntent> {
    let chat = ChatPayload::from_value(&event.payload);
    let Some(state) = chat.chat_state() else {
        return vec![EventIntent::ignore(format!(
            "chat state {:?} not handled",
            chat.state.as_deref().unwrap_or_default()
        ))];
    };
    let at = event.timestamp;

    match state {
        ChatState::Delta => {
            let (text, thinking) = (chat.text(), chat.thinking());
            if text.is_none() && thinking.is_none() {
                return vec![EventIntent::ignore("chat delta without text")];
            }
            vec![EventIntent::QueueLivePatch {
                agent_id,
                patch: AgentStatusPatch::live(chat.run_id, text, thinking, at),
            }]
        },
        ChatState::Final => {
            let thinking = chat.thinking();
            let mut output_lines = Vec::new();
            if let Some(thinking) = &thinking {
                output_lines.push(format!("[thinking] {thinking}"));
            }
            output_lines.extend(chat.tool_lines());
            if let Some(text) = chat.text() {
                output_lines.push(text);
            }

            let mut intents = vec![
                EventIntent::ClearPendingLivePatch {
                    agent_id: agent_id.clone(),
                },
                EventIntent::CommitChat {
                    agent_id: agent_id.clone(),
                    run_id: chat.run_id,
                    patch: AgentStatusPatch::terminal(None, at),
                    output_lines,
                },
            ];
            if thinking.is_none() {
                intents.push(EventIntent::RequestHistoryRefresh {
                    agent_id,
                    reason: HISTORY_REFRESH_NO_TRACE.into(),
                });
            }
            intents
        },
        ChatState::Aborted | ChatState::Error => {
            let error = (state == ChatState::Error).then(|| {
                chat.error_message
                    .clone()
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| "chat error".into())
            });
            vec![
                EventIntent::ClearPendingLivePatch {
                    agent_id: agent_id.clone(),
                },
                EventIntent::UpdateAgentStatus {
                    agent_id,
                    run_id: chat.run_id,
                    patch: AgentStatusPatch::terminal(error, at),
                },
            ]
        },
    }
}

fn agent_intents(event: &ClassifiedEvent, agent_id: String) -> Vec<EventIntent> {
    let agent = AgentPayload::from_value(&event.payload);
    let at = event.timestamp;
    let stream = agent.stream();

    if stream == LIFECYCLE_STREAM {
        let raw_phase = agent.phase().unwrap_or_default().to_string();
        return match LifecyclePhase::parse(&raw_phase) {
            Some(LifecyclePhase::Start) => {
                let started_at = agent.started_at().unwrap_or(at);
                vec![EventIntent::UpdateAgentStatus {
                    agent_id,
                    run_id: agent.run_id.clone(),
                    patch: AgentStatusPatch::running(agent.run_id, started_at),
                }]
            },
            Some(phase @ (LifecyclePhase::End | LifecyclePhase::Error)) => {
                let error = (phase == LifecyclePhase::Error)
                    .then(|| agent.error().unwrap_or_else(|| "agent run failed".into()));
                vec![
                    EventIntent::ClearPendingLivePatch {
                        agent_id: agent_id.clone(),
                    },
                    EventIntent::UpdateAgentStatus {
                        agent_id,
                        run_id: agent.run_id,
                        patch: AgentStatusPatch::terminal(error, at),
                    },
                ]
            },
            None => vec![EventIntent::ignore(format!(
                "lifecycle phase {raw_phase:?} not handled"
            ))],
        };
    }

    let reasoning = is_reasoning_stream(stream);
    if !reasoning && stream != ASSISTANT_STREAM {
        return vec![EventIntent::ignore(format!("agent stream {stream:?} not handled"))];
    }
    let Some(text) = agent.text() else {
        return vec![EventIntent::ignore(format!("empty {stream} delta"))];
    };
    let patch = if reasoning {
        AgentStatusPatch::live(agent.run_id, None, Some(text), at)
    } else {
        AgentStatusPatch::live(agent.run_id, Some(text), None, at)
    };
    vec![EventIntent::QueueLivePatch { agent_id, patch }]
}

fn trust_intents(event: &ClassifiedEvent, agent_id: String, requested: bool) -> Vec<EventIntent> {
    if requested {
        return match PendingApproval::from_payload(&event.payload) {
            Some(approval) => vec![EventIntent::ApprovalPending { agent_id, approval }],
            None => vec![EventIntent::ignore("approval request without id or command")],
        };
    }
    match ApprovalResolution::from_payload(&event.payload) {
        Some(resolution) => vec![EventIntent::ApprovalResolved {
            agent_id,
            resolution,
        }],
        None => vec![EventIntent::ignore("approval resolution without id")],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        crate::classify::classify,
        serde_json::{Value, json},
        studio_protocol::EventFrame,
    };

    fn decide_raw(event: &str, payload: Value) -> Vec<EventIntent> {
        decide(&classify(&EventFrame::new(event, payload), 1_000))
    }

    #[test]
    fn chat_final_without_trace_commits_and_refreshes_history() {
        let intents = decide_raw(
            "chat",
            json!({
                "sessionKey": "agent:abc123:main",
                "runId": "r1",
                "state": "final",
                "message": {"role": "assistant", "content": [{"type": "text", "text": "Done."}]}
            }),
        );
        assert_eq!(intents.len(), 3);
        assert_eq!(intents[0], EventIntent::ClearPendingLivePatch {
            agent_id: "abc123".into()
        });
        match &intents[1] {
            EventIntent::CommitChat {
                agent_id,
                output_lines,
                patch,
                run_id,
            } => {
                assert_eq!(agent_id, "abc123");
                assert_eq!(output_lines, &vec!["Done.".to_string()]);
                assert_eq!(run_id.as_deref(), Some("r1"));
                assert_eq!(patch.status, Some(AgentStatus::Idle));
                assert_eq!(patch.run_id, FieldPatch::Clear);
            },
            other => panic!("expected commit, got {other:?}"),
        }
        assert_eq!(intents[2], EventIntent::RequestHistoryRefresh {
            agent_id: "abc123".into(),
            reason: HISTORY_REFRESH_NO_TRACE.into(),
        });
    }

    #[test]
    fn chat_final_with_trace_skips_history_refresh() {
        let intents = decide_raw(
            "chat",
            json!({
                "sessionKey": "agent:a:main",
                "state": "final",
                "message": {"content": [
                    {"type": "thinking", "thinking": "hmm"},
                    {"type": "text", "text": "ok"}
                ]}
            }),
        );
        assert_eq!(intents.len(), 2);
        let EventIntent::CommitChat { output_lines, .. } = &intents[1] else {
            panic!("expected commit");
        };
        assert_eq!(output_lines, &vec!["[thinking] hmm".to_string(), "ok".to_string()]);
    }

    #[test]
    fn chat_delta_queues_live_patch() {
        let intents = decide_raw(
            "chat",
            json!({"sessionKey": "agent:a:main", "runId": "r1", "state": "delta", "message": {"content": "Hel"}}),
        );
        let [EventIntent::QueueLivePatch { agent_id, patch }] = intents.as_slice() else {
            panic!("expected live patch, got {intents:?}");
        };
        assert_eq!(agent_id, "a");
        assert_eq!(patch.run_id, FieldPatch::Set("r1".into()));
        assert_eq!(patch.streaming_text, FieldPatch::Set("Hel".into()));
        assert_eq!(patch.last_activity_at, Some(1_000));
    }

    #[test]
    fn chat_error_shows_message_without_output_lines() {
        let intents = decide_raw(
            "chat",
            json!({"sessionKey": "agent:a:main", "runId": "r1", "state": "error", "errorMessage": "rate limited"}),
        );
        assert!(matches!(intents[0], EventIntent::ClearPendingLivePatch { .. }));
        let EventIntent::UpdateAgentStatus { patch, run_id, .. } = &intents[1] else {
            panic!("expected status update");
        };
        assert_eq!(run_id.as_deref(), Some("r1"));
        assert_eq!(patch.status, Some(AgentStatus::Error));
        assert_eq!(patch.streaming_text, FieldPatch::Set("rate limited".into()));
        assert!(!patch.is_running());
    }

    #[test]
    fn chat_aborted_is_idle_and_clears_text() {
        let intents = decide_raw(
            "chat",
            json!({"sessionKey": "agent:a:main", "state": "aborted"}),
        );
        let EventIntent::UpdateAgentStatus { patch, .. } = &intents[1] else {
            panic!("expected status update");
        };
        assert_eq!(patch.status, Some(AgentStatus::Idle));
        assert_eq!(patch.streaming_text, FieldPatch::Clear);
    }

    #[test]
    fn lifecycle_phases() {
        let start = decide_raw(
            "agent",
            json!({"sessionKey": "agent:a:main", "runId": "r2", "stream": "lifecycle", "data": {"phase": "start", "startedAt": 500}}),
        );
        let [EventIntent::UpdateAgentStatus { patch, .. }] = start.as_slice() else {
            panic!("expected running update");
        };
        assert!(patch.is_running());
        assert_eq!(patch.run_id, FieldPatch::Set("r2".into()));
        assert_eq!(patch.run_started_at, FieldPatch::Set(500));

        let end = decide_raw(
            "agent",
            json!({"sessionKey": "agent:a:main", "runId": "r2", "stream": "lifecycle", "data": {"phase": "end"}}),
        );
        assert!(matches!(
            &end[1],
            EventIntent::UpdateAgentStatus { patch, .. } if patch.status == Some(AgentStatus::Idle)
        ));

        let other = decide_raw(
            "agent",
            json!({"sessionKey": "agent:a:main", "stream": "lifecycle", "data": {"phase": "compacting"}}),
        );
        assert!(matches!(other.as_slice(), [EventIntent::Ignore { .. }]));
    }

    #[test]
    fn reasoning_and_assistant_streams() {
        let thinking = decide_raw(
            "agent",
            json!({"sessionKey": "agent:a:main", "runId": "r1", "stream": "thinking", "data": {"text": "plan"}}),
        );
        let [EventIntent::QueueLivePatch { patch, .. }] = thinking.as_slice() else {
            panic!("expected live patch");
        };
        assert_eq!(patch.thinking_trace, FieldPatch::Set("plan".into()));
        assert!(patch.streaming_text.is_keep());

        let empty = decide_raw(
            "agent",
            json!({"sessionKey": "agent:a:main", "stream": "assistant", "data": {"text": ""}}),
        );
        assert!(matches!(empty.as_slice(), [EventIntent::Ignore { .. }]));

        let tool = decide_raw(
            "agent",
            json!({"sessionKey": "agent:a:main", "stream": "tool", "data": {"text": "x"}}),
        );
        assert!(matches!(tool.as_slice(), [EventIntent::Ignore { .. }]));
    }

    #[test]
    fn approvals() {
        let pending = decide_raw(
            "exec.approval.requested",
            json!({"id": "ap-1", "request": {"agentId": "ops", "command": "ls"}}),
        );
        assert!(matches!(
            pending.as_slice(),
            [EventIntent::ApprovalPending { agent_id, .. }] if agent_id == "ops"
        ));
        assert_eq!(pending[0].plane(), Some(Plane::Trust));

        let resolved = decide_raw(
            "exec.approval.resolved",
            json!({"id": "ap-1", "agentId": "ops", "decision": "deny"}),
        );
        assert!(matches!(resolved.as_slice(), [EventIntent::ApprovalResolved { .. }]));

        let anonymous = decide_raw("exec.approval.requested", json!({"id": "ap-2"}));
        assert!(matches!(anonymous.as_slice(), [EventIntent::Ignore { .. }]));
    }

    #[test]
    fn chat_without_agent_is_ignored() {
        let intents = decide_raw("chat", json!({"sessionKey": "main", "state": "final"}));
        assert_eq!(intents, vec![EventIntent::ignore("chat event without an agent id")]);
    }

    #[test]
    fn overlay_is_last_write_wins() {
        let first = AgentStatusPatch::live(Some("r1".into()), Some("a".into()), Some("t".into()), 1);
        let second = AgentStatusPatch::live(Some("r1".into()), Some("ab".into()), None, 2);
        let merged = first.overlay(second);
        assert_eq!(merged.streaming_text, FieldPatch::Set("ab".into()));
        assert_eq!(merged.thinking_trace, FieldPatch::Set("t".into()));
        assert_eq!(merged.last_activity_at, Some(2));
    }
}
