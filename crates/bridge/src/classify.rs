//! Raw pushed events → [`ClassifiedEvent`], plus field extraction for the
//! payload shapes the policy layer reads.

use {
    serde::Deserialize,
    serde_json::Value,
    studio_protocol::{EventFrame, events},
};

/// Terms that mark a stream name as carrying model reasoning.
const REASONING_TERMS: &[&str] = &["reason", "think", "analysis", "trace"];
/// Terms that rule a stream out as reasoning even when a reasoning term matches.
const EXCLUDED_STREAM_TERMS: &[&str] = &["assistant", "tool", "lifecycle"];

/// Which concern a pushed event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Presence/heartbeat style events: only the fleet summary needs a refresh.
    SummaryRefresh,
    /// `chat` events for one session.
    Work,
    /// `agent` lifecycle and stream events.
    Agent,
    /// Exec approval requested (`requested == true`) or resolved.
    Trust { requested: bool },
    Ignore(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedEvent {
    pub kind: EventKind,
    /// Event name as received.
    pub event: String,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub payload: Value,
    /// Event time in epoch milliseconds; the receive time when the payload has none.
    pub timestamp: u64,
}

impl ClassifiedEvent {
    pub fn is_ignored(&self) -> bool {
        matches!(self.kind, EventKind::Ignore(_))
    }
}

/// Agent id from a session key of the form `agent:<id>:<suffix>`.
pub fn agent_id_from_session_key(session_key: &str) -> Option<&str> {
    let rest = session_key.trim().strip_prefix("agent:")?;
    let (id, suffix) = rest.split_once(':')?;
    (!id.is_empty() && !suffix.is_empty()).then_some(id)
}

/// Whether a stream name carries reasoning output.
pub fn is_reasoning_stream(stream: &str) -> bool {
    let stream = stream.to_ascii_lowercase();
    REASONING_TERMS.iter().any(|t| stream.contains(t))
        && !EXCLUDED_STREAM_TERMS.iter().any(|t| stream.contains(t))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn explicit_agent_id(payload: &Value) -> Option<String> {
    str_field(payload, "agentId")
        .or_else(|| payload.get("request").and_then(|r| str_field(r, "agentId")))
        .map(str::to_string)
}

fn session_key_of(payload: &Value) -> Option<String> {
    str_field(payload, "sessionKey")
        .or_else(|| payload.get("request").and_then(|r| str_field(r, "sessionKey")))
        .map(str::to_string)
}

fn event_timestamp(payload: &Value) -> Option<u64> {
    ["ts", "timestamp"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_u64))
}

/// Classify one pushed event. Total over all inputs.
pub fn classify(frame: &EventFrame, now_ms: u64) -> ClassifiedEvent {
    let payload = frame.payload_value();
    let session_key = session_key_of(&payload);
    let explicit = explicit_agent_id(&payload);
    let timestamp = event_timestamp(&payload).unwrap_or(now_ms);

    let (kind, agent_id) = match frame.event.as_str() {
        events::PRESENCE | events::HEARTBEAT => (EventKind::SummaryRefresh, explicit),
        events::CHAT | events::AGENT => {
            let derived = explicit.or_else(|| {
                session_key
                    .as_deref()
                    .and_then(agent_id_from_session_key)
                    .map(str::to_string)
            });
            let kind = if frame.event == events::CHAT {
                EventKind::Work
            } else {
                EventKind::Agent
            };
            (kind, derived)
        },
        events::EXEC_APPROVAL_REQUESTED | events::EXEC_APPROVAL_RESOLVED => match explicit {
            Some(agent_id) => (
                EventKind::Trust {
                    requested: frame.event == events::EXEC_APPROVAL_REQUESTED,
                },
                Some(agent_id),
            ),
            None => (
                EventKind::Ignore("approval event without an agent id".into()),
                None,
            ),
        },
        other => (EventKind::Ignore(format!("unhandled event {other}")), explicit),
    };

    ClassifiedEvent {
        kind,
        event: frame.event.clone(),
        agent_id,
        session_key,
        payload,
        timestamp,
    }
}

// ── Chat payloads ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
    Delta,
    Final,
    Aborted,
    Error,
}

impl ChatState {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "delta" => Some(Self::Delta),
            "final" => Some(Self::Final),
            "aborted" => Some(Self::Aborted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatPayload {
    pub run_id: Option<String>,
    pub state: Option<String>,
    pub message: Option<Value>,
    pub error_message: Option<String>,
}

impl ChatPayload {
    pub fn from_value(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn chat_state(&self) -> Option<ChatState> {
        self.state.as_deref().and_then(ChatState::parse)
    }

    pub fn text(&self) -> Option<String> {
        self.message.as_ref().and_then(message_text)
    }

    pub fn thinking(&self) -> Option<String> {
        self.message.as_ref().and_then(message_thinking)
    }

    pub fn tool_lines(&self) -> Vec<String> {
        self.message.as_ref().map(message_tool_lines).unwrap_or_default()
    }
}

fn content_blocks(message: &Value) -> &[Value] {
    message
        .get("content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn block_type(block: &Value) -> &str {
    block.get("type").and_then(Value::as_str).unwrap_or_default()
}

fn joined(parts: Vec<&str>) -> Option<String> {
    let text = parts.join("");
    (!text.trim().is_empty()).then_some(text)
}

/// Rendered text of a chat message: a string `content`, `text` blocks, or a `text` field.
pub fn message_text(message: &Value) -> Option<String> {
    if let Some(text) = message.as_str() {
        return joined(vec![text]);
    }
    if let Some(text) = message.get("content").and_then(Value::as_str) {
        return joined(vec![text]);
    }
    let parts: Vec<&str> = content_blocks(message)
        .iter()
        .filter(|b| block_type(b) == "text")
        .filter_map(|b| b.get("text").and_then(Value::as_str))
        .collect();
    if !parts.is_empty() {
        return joined(parts);
    }
    message.get("text").and_then(Value::as_str).and_then(|t| joined(vec![t]))
}

/// Thinking trace of a chat message, from `thinking` blocks or a top-level field.
pub fn message_thinking(message: &Value) -> Option<String> {
    let parts: Vec<&str> = content_blocks(message)
        .iter()
        .filter(|b| block_type(b) == "thinking")
        .filter_map(|b| b.get("thinking").or_else(|| b.get("text")).and_then(Value::as_str))
        .collect();
    if !parts.is_empty() {
        return joined(parts);
    }
    ["thinking", "reasoning"]
        .iter()
        .find_map(|key| message.get(*key).and_then(Value::as_str))
        .and_then(|t| joined(vec![t]))
}

/// One line per structured tool call or tool result block.
pub fn message_tool_lines(message: &Value) -> Vec<String> {
    content_blocks(message)
        .iter()
        .filter_map(|block| {
            let name = block
                .get("name")
                .or_else(|| block.get("toolName"))
                .and_then(Value::as_str)
                .unwrap_or("tool");
            match block_type(block) {
                "toolCall" | "tool_use" => {
                    let args = block.get("arguments").or_else(|| block.get("input"));
                    Some(match args {
                        Some(args) if !args.is_null() => format!("[tool] {name} {args}"),
                        _ => format!("[tool] {name}"),
                    })
                },
                "toolResult" | "tool_result" => {
                    let output = block
                        .get("content")
                        .and_then(message_text_of_result)
                        .or_else(|| block.get("text").and_then(Value::as_str).map(str::to_string));
                    Some(match output {
                        Some(output) => format!("[tool result] {name}: {output}"),
                        None => format!("[tool result] {name}"),
                    })
                },
                _ => None,
            }
        })
        .collect()
}

fn message_text_of_result(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => joined(vec![s]),
        Value::Array(blocks) => joined(
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect(),
        ),
        _ => None,
    }
}

// ── Agent payloads ───────────────────────────────────────────────────────────

pub const LIFECYCLE_STREAM: &str = "lifecycle";
pub const ASSISTANT_STREAM: &str = "assistant";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Start,
    End,
    Error,
}

impl LifecyclePhase {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "end" => Some(Self::End),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentPayload {
    pub run_id: Option<String>,
    pub stream: Option<String>,
    pub data: Value,
}

impl AgentPayload {
    pub fn from_value(payload: &Value) -> Self {
        serde_json::from_value(payload.clone()).unwrap_or_default()
    }

    pub fn stream(&self) -> &str {
        self.stream.as_deref().unwrap_or_default()
    }

    pub fn phase(&self) -> Option<&str> {
        str_field(&self.data, "phase")
    }

    /// Accumulated stream text, falling back to the latest delta.
    pub fn text(&self) -> Option<String> {
        ["text", "delta"]
            .iter()
            .find_map(|key| self.data.get(*key).and_then(Value::as_str))
            .and_then(|t| joined(vec![t]))
    }

    pub fn started_at(&self) -> Option<u64> {
        self.data.get("startedAt").and_then(Value::as_u64)
    }

    pub fn error(&self) -> Option<String> {
        str_field(&self.data, "error").map(str::to_string)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn frame(event: &str, payload: Value) -> EventFrame {
        EventFrame::new(event, payload)
    }

    #[rstest]
    #[case("agent:abc123:main", Some("abc123"))]
    #[case("agent:ops:telegram:42", Some("ops"))]
    #[case("agent::main", None)]
    #[case("agent:abc", None)]
    #[case("main", None)]
    fn session_key_agent_ids(#[case] key: &str, #[case] expected: Option<&str>) {
        assert_eq!(agent_id_from_session_key(key), expected);
    }

    #[rstest]
    #[case("reasoning", true)]
    #[case("thinking", true)]
    #[case("analysis", true)]
    #[case("trace", true)]
    #[case("assistant_thinking", false)]
    #[case("tool_trace", false)]
    #[case("lifecycle", false)]
    #[case("assistant", false)]
    fn reasoning_streams(#[case] stream: &str, #[case] expected: bool) {
        assert_eq!(is_reasoning_stream(stream), expected);
    }

    #[test]
    fn chat_derives_agent_from_session_key() {
        let event = classify(
            &frame("chat", json!({"sessionKey": "agent:abc123:main", "state": "delta"})),
            99,
        );
        assert_eq!(event.kind, EventKind::Work);
        assert_eq!(event.agent_id.as_deref(), Some("abc123"));
        assert_eq!(event.timestamp, 99);
    }

    #[test]
    fn explicit_agent_id_wins() {
        let event = classify(
            &frame(
                "agent",
                json!({"agentId": "x", "sessionKey": "agent:y:main", "ts": 5}),
            ),
            99,
        );
        assert_eq!(event.kind, EventKind::Agent);
        assert_eq!(event.agent_id.as_deref(), Some("x"));
        assert_eq!(event.timestamp, 5);
    }

    #[test]
    fn presence_and_heartbeat_refresh_summary() {
        assert_eq!(
            classify(&frame("presence", json!({})), 0).kind,
            EventKind::SummaryRefresh
        );
        assert_eq!(
            classify(&frame("heartbeat", Value::Null), 0).kind,
            EventKind::SummaryRefresh
        );
    }

    #[test]
    fn approvals_need_an_explicit_agent() {
        let requested = classify(
            &frame(
                "exec.approval.requested",
                json!({"id": "a1", "request": {"agentId": "ops", "sessionKey": "agent:ops:main"}}),
            ),
            0,
        );
        assert_eq!(requested.kind, EventKind::Trust { requested: true });
        assert_eq!(requested.agent_id.as_deref(), Some("ops"));

        // A session key is not enough on the trust plane.
        let anonymous = classify(
            &frame("exec.approval.resolved", json!({"id": "a1", "sessionKey": "agent:ops:main"})),
            0,
        );
        assert!(anonymous.is_ignored());
    }

    #[test]
    fn unknown_events_are_ignored() {
        let event = classify(&frame("cron", json!({})), 0);
        assert_eq!(event.kind, EventKind::Ignore("unhandled event cron".into()));
    }

    #[test]
    fn chat_message_fields() {
        let payload = ChatPayload::from_value(&json!({
            "runId": "r1",
            "state": "final",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "consider"},
                    {"type": "toolCall", "name": "exec", "arguments": {"cmd": "ls"}},
                    {"type": "toolResult", "name": "exec", "content": [{"type": "text", "text": "a.txt"}]},
                    {"type": "text", "text": "Done."}
                ]
            }
        }));
        assert_eq!(payload.chat_state(), Some(ChatState::Final));
        assert_eq!(payload.text().as_deref(), Some("Done."));
        assert_eq!(payload.thinking().as_deref(), Some("consider"));
        assert_eq!(payload.tool_lines(), vec![
            r#"[tool] exec {"cmd":"ls"}"#.to_string(),
            "[tool result] exec: a.txt".to_string(),
        ]);
    }

    #[test]
    fn blank_text_reads_as_missing() {
        let payload = ChatPayload::from_value(&json!({"message": {"content": "   "}}));
        assert_eq!(payload.text(), None);
        assert_eq!(ChatPayload::from_value(&json!("garbage")).state, None);
    }

    #[test]
    fn agent_payload_fields() {
        let payload = AgentPayload::from_value(&json!({
            "runId": "r1",
            "stream": "lifecycle",
            "data": {"phase": "start", "startedAt": 1234}
        }));
        assert_eq!(payload.stream(), LIFECYCLE_STREAM);
        assert_eq!(payload.phase(), Some("start"));
        assert_eq!(payload.started_at(), Some(1234));

        let delta = AgentPayload::from_value(&json!({"stream": "assistant", "data": {"delta": "he"}}));
        assert_eq!(delta.text().as_deref(), Some("he"));
    }
}
