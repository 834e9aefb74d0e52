//! Typed exec approval payloads.

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
};

/// A command waiting for an operator decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResolution {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RequestedWire {
    id: Option<String>,
    request: RequestWire,
    created_at_ms: Option<u64>,
    expires_at_ms: Option<u64>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RequestWire {
    command: Option<String>,
    cwd: Option<String>,
    host: Option<String>,
    security: Option<String>,
    ask: Option<String>,
    session_key: Option<String>,
}

impl PendingApproval {
    /// Parse an `exec.approval.requested` payload. `None` without an id or command.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let wire: RequestedWire = serde_json::from_value(payload.clone()).ok()?;
        let id = wire.id.filter(|id| !id.trim().is_empty())?;
        let command = wire.request.command.filter(|c| !c.trim().is_empty())?;
        Some(Self {
            id,
            command,
            cwd: wire.request.cwd,
            host: wire.request.host,
            security: wire.request.security,
            ask: wire.request.ask,
            session_key: wire.request.session_key,
            created_at_ms: wire.created_at_ms,
            expires_at_ms: wire.expires_at_ms,
        })
    }
}

impl ApprovalResolution {
    /// Parse an `exec.approval.resolved` payload. `None` without an id.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())?;
        Some(Self {
            id: id.to_string(),
            decision: payload
                .get("decision")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }
}
