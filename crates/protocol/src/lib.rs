//! Gateway WebSocket/RPC frame definitions.
//!
//! Protocol version 3. All communication uses JSON text frames over WebSocket.
//!
//! Frame types:
//! - `RequestFrame`  — client → gateway RPC call (the first one is the `connect` handshake)
//! - `ResponseFrame` — gateway → client RPC result, correlated by `id`
//! - `EventFrame`    — gateway → client server-push, optionally sequenced

use serde::{Deserialize, Serialize};

// ── Constants ────────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u32 = 3;
pub const CONNECT_METHOD: &str = "connect";

// ── Events ───────────────────────────────────────────────────────────────────

pub mod events {
    pub const CONNECT_CHALLENGE: &str = "connect.challenge";
    pub const CHAT: &str = "chat";
    pub const AGENT: &str = "agent";
    pub const PRESENCE: &str = "presence";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const EXEC_APPROVAL_REQUESTED: &str = "exec.approval.requested";
    pub const EXEC_APPROVAL_RESOLVED: &str = "exec.approval.resolved";
}

// ── Close codes ──────────────────────────────────────────────────────────────

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    /// Malformed JSON or an unexpected frame shape.
    pub const INVALID_FRAME: u16 = 1003;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL: u16 = 1011;
    pub const SERVICE_RESTART: u16 = 1012;
    /// Handshake rejected; the close reason carries `connect failed: <CODE> <message>`.
    pub const CONNECT_FAILED: u16 = 4008;
}

pub const CONNECT_FAILED_PREFIX: &str = "connect failed: ";

/// WebSocket close reasons are limited to 123 bytes of UTF-8.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

// ── Error codes ──────────────────────────────────────────────────────────────

pub mod error_codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const UNAVAILABLE: &str = "UNAVAILABLE";
    pub const INTERNAL: &str = "INTERNAL";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";

    // Relay-side handshake failures.
    pub const GATEWAY_URL_MISSING: &str = "studio.gateway_url_missing";
    pub const GATEWAY_TOKEN_MISSING: &str = "studio.gateway_token_missing";
    pub const GATEWAY_URL_INVALID: &str = "studio.gateway_url_invalid";
    pub const SETTINGS_LOAD_FAILED: &str = "studio.settings_load_failed";
    pub const UPSTREAM_ERROR: &str = "studio.upstream_error";
    pub const UPSTREAM_CLOSED: &str = "studio.upstream_closed";
    pub const BACKLOG_FULL: &str = "studio.backlog_full";

    /// Handshake failures that retrying cannot fix without a settings change.
    pub const NON_RETRYABLE_CONNECT: &[&str] = &[
        GATEWAY_URL_MISSING,
        GATEWAY_TOKEN_MISSING,
        GATEWAY_URL_INVALID,
        SETTINGS_LOAD_FAILED,
    ];

    pub fn is_non_retryable_connect(code: &str) -> bool {
        NON_RETRYABLE_CONNECT.contains(&code.trim())
    }
}

// ── Roles and scopes ─────────────────────────────────────────────────────────

pub mod roles {
    pub const OPERATOR: &str = "operator";
}

pub mod scopes {
    pub const ADMIN: &str = "operator.admin";
    pub const APPROVALS: &str = "operator.approvals";
    pub const PAIRING: &str = "operator.pairing";

    pub const DEFAULT_OPERATOR: &[&str] = &[ADMIN, APPROVALS, PAIRING];
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid frame json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    Shape(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// ── Error shape ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
    #[serde(rename = "retryAfterMs", skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: None,
            retry_after_ms: None,
        }
    }
}

impl std::fmt::Display for ErrorShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Client → gateway RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// Gateway → client RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResponseFrame {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: ErrorShape) -> Self {
        Self {
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }
}

/// Gateway → client server-push event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(
        rename = "stateVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            payload: Some(payload),
            seq: None,
            state_version: None,
        }
    }

    #[must_use]
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Payload as a JSON value, `Null` when absent.
    pub fn payload_value(&self) -> serde_json::Value {
        self.payload.clone().unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVersion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
}

/// Discriminated union of all frame types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "req")]
    Request(RequestFrame),
    #[serde(rename = "res")]
    Response(ResponseFrame),
    #[serde(rename = "event")]
    Event(EventFrame),
}

impl Frame {
    /// Parse a text frame and check the minimal shape each kind needs.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: Self = serde_json::from_str(text)?;
        frame.validate()?;
        Ok(frame)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<()> {
        match self {
            Self::Request(req) => {
                if req.id.trim().is_empty() {
                    return Err(Error::Shape("request id is empty".into()));
                }
                if req.method.trim().is_empty() {
                    return Err(Error::Shape("request method is empty".into()));
                }
            },
            Self::Response(res) => {
                if res.id.trim().is_empty() {
                    return Err(Error::Shape("response id is empty".into()));
                }
            },
            Self::Event(evt) => {
                if evt.event.trim().is_empty() {
                    return Err(Error::Shape("event name is empty".into()));
                }
            },
        }
        Ok(())
    }
}

impl From<RequestFrame> for Frame {
    fn from(frame: RequestFrame) -> Self {
        Self::Request(frame)
    }
}

impl From<ResponseFrame> for Frame {
    fn from(frame: ResponseFrame) -> Self {
        Self::Response(frame)
    }
}

impl From<EventFrame> for Frame {
    fn from(frame: EventFrame) -> Self {
        Self::Event(frame)
    }
}

/// Whether a raw JSON frame is the `connect` handshake request.
///
/// Works on untyped values so callers that must preserve unknown fields
/// (the relay) can inspect a frame without a typed round trip.
pub fn is_connect_request(frame: &serde_json::Value) -> bool {
    frame.get("type").and_then(|v| v.as_str()) == Some("req")
        && frame.get("method").and_then(|v| v.as_str()) == Some(CONNECT_METHOD)
}

// ── Connect handshake ────────────────────────────────────────────────────────

/// Parameters sent by the client in the initial `connect` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "minProtocol")]
    pub min_protocol: u32,
    #[serde(rename = "maxProtocol")]
    pub max_protocol: u32,
    pub client: ClientInfo,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceInfo>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ConnectAuth>,
    #[serde(rename = "userAgent", default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub version: String,
    pub platform: String,
    pub mode: String,
    #[serde(rename = "instanceId", default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// Signed device block proving possession of the device private key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub signature: String,
    #[serde(rename = "signedAt")]
    pub signed_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl ConnectAuth {
    pub fn is_empty(&self) -> bool {
        self.token.as_deref().is_none_or(str::is_empty)
            && self.password.as_deref().is_none_or(str::is_empty)
    }
}

/// Payload of the `connect.challenge` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectChallenge {
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// Payload of a successful `connect` response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloOk {
    #[serde(default)]
    pub protocol: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<Features>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<HelloAuth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

/// Credential minted by the gateway for this device, role and scope set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HelloAuth {
    #[serde(rename = "deviceToken", default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(rename = "issuedAtMs", default, skip_serializing_if = "Option::is_none")]
    pub issued_at_ms: Option<u64>,
}

// ── Structured handshake rejection ───────────────────────────────────────────

/// A handshake rejection carried through a close reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectFailure {
    pub code: String,
    pub message: String,
}

impl ConnectFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Parse `connect failed: <CODE> <message>`; `None` for any other reason.
    pub fn parse_close_reason(reason: &str) -> Option<Self> {
        let rest = reason.strip_prefix(CONNECT_FAILED_PREFIX)?.trim();
        let (code, message) = match rest.split_once(char::is_whitespace) {
            Some((code, message)) => (code, message.trim()),
            None => (rest, ""),
        };
        if code.is_empty() {
            return None;
        }
        Some(Self::new(code, message))
    }

    /// Render as a close reason, truncated to the WebSocket limit.
    pub fn to_close_reason(&self) -> String {
        let full = if self.message.is_empty() {
            format!("{CONNECT_FAILED_PREFIX}{}", self.code)
        } else {
            format!("{CONNECT_FAILED_PREFIX}{} {}", self.code, self.message)
        };
        truncate_close_reason(&full)
    }

    pub fn is_retryable(&self) -> bool {
        !error_codes::is_non_retryable_connect(&self.code)
    }
}

impl From<ErrorShape> for ConnectFailure {
    fn from(shape: ErrorShape) -> Self {
        Self::new(shape.code, shape.message)
    }
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Cut a close reason to [`MAX_CLOSE_REASON_BYTES`] on a char boundary.
pub fn truncate_close_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
