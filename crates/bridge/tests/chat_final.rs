//! A finished chat turn flowing through classify → decide → handler.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    serde_json::json,
    studio_bridge::{
        AgentStatus, AgentStatusPatch, ApprovalResolution, EventIntent, FieldPatch,
        HandlerOptions, IntentHandler, IntentSink, PendingApproval, classify, decide,
    },
    studio_common::{ManualScheduler, SharedScheduler},
    studio_protocol::EventFrame,
};

#[derive(Default)]
struct Log(Mutex<Vec<String>>);

impl Log {
    fn push(&self, line: String) {
        self.0.lock().unwrap().push(line);
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl IntentSink for Log {
    fn patch_agent(&self, agent_id: &str, patch: &AgentStatusPatch) {
        self.push(format!("patch {agent_id} {:?}", patch.status));
    }

    fn commit_chat(&self, agent_id: &str, lines: &[String]) {
        self.push(format!("commit {agent_id} {}", lines.join("|")));
    }

    fn refresh_summary(&self) {
        self.push("summary".into());
    }

    fn refresh_history(&self, agent_id: &str, reason: &str) {
        self.push(format!("history {agent_id} {reason}"));
    }

    fn approval_pending(&self, agent_id: &str, approval: &PendingApproval) {
        self.push(format!("pending {agent_id} {}", approval.id));
    }

    fn approval_resolved(&self, agent_id: &str, resolution: &ApprovalResolution) {
        self.push(format!("resolved {agent_id} {}", resolution.id));
    }
}

fn final_event() -> EventFrame {
    EventFrame::new(
        "chat",
        json!({
            "runId": "run-1",
            "sessionKey": "agent:abc123:main",
            "state": "final",
            "message": {
                "role": "assistant",
                "content": [{"type": "text", "text": "Done."}]
            }
        }),
    )
}

#[test]
fn chat_final_yields_clear_commit_then_history_refresh() {
    let classified = classify(&final_event(), 0);
    let intents = decide(&classified);

    assert_eq!(intents.len(), 3);
    assert_eq!(intents[0], EventIntent::ClearPendingLivePatch {
        agent_id: "abc123".into()
    });
    let EventIntent::CommitChat {
        agent_id,
        output_lines,
        ..
    } = &intents[1]
    else {
        panic!("expected commitChat, got {:?}", intents[1]);
    };
    assert_eq!(agent_id, "abc123");
    assert_eq!(output_lines, &vec!["Done.".to_string()]);
    assert_eq!(intents[2], EventIntent::RequestHistoryRefresh {
        agent_id: "abc123".into(),
        reason: "chat-final-no-trace".into(),
    });
}

#[test]
fn streamed_turn_settles_into_one_commit() {
    let scheduler = ManualScheduler::shared(1_000);
    let log = Arc::new(Log::default());
    let mut handler = IntentHandler::new(
        Arc::clone(&scheduler) as SharedScheduler,
        Arc::clone(&log) as Arc<dyn IntentSink>,
        HandlerOptions::default(),
    );
    let mut feed = |frame: EventFrame| {
        let classified = classify(&frame, 1_000);
        handler.apply_intents(decide(&classified), &classified);
    };

    feed(EventFrame::new(
        "agent",
        json!({"sessionKey": "agent:abc123:main", "runId": "run-1", "stream": "lifecycle", "data": {"phase": "start"}}),
    ));
    for text in ["Do", "Don", "Done"] {
        feed(EventFrame::new(
            "chat",
            json!({"sessionKey": "agent:abc123:main", "runId": "run-1", "state": "delta", "message": {"content": text}}),
        ));
    }
    // The final lands inside the same tick, so the queued deltas never flush.
    feed(final_event());
    scheduler.advance(Duration::from_millis(16));

    assert_eq!(log.take(), vec![
        format!("patch abc123 {:?}", Some(AgentStatus::Running)),
        "commit abc123 Done.".to_string(),
        format!("patch abc123 {:?}", Some(AgentStatus::Idle)),
        "history abc123 chat-final-no-trace".to_string(),
    ]);

    // A duplicate lifecycle end for the same run is now stale.
    feed(EventFrame::new(
        "agent",
        json!({"sessionKey": "agent:abc123:main", "runId": "run-1", "stream": "lifecycle", "data": {"phase": "end"}}),
    ));
    assert!(log.take().is_empty());
}

#[test]
fn terminal_patch_clears_run_fields() {
    let intents = decide(&classify(&final_event(), 7));
    let EventIntent::CommitChat { patch, .. } = &intents[1] else {
        panic!("expected commitChat");
    };
    assert_eq!(patch.run_id, FieldPatch::Clear);
    assert_eq!(patch.streaming_text, FieldPatch::Clear);
    assert_eq!(patch.last_activity_at, Some(7));
}
