use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub gateway: GatewayConfig,
    pub relay: RelayConfig,
    pub client: ClientConfig,
    pub bridge: BridgeConfig,
}

/// Upstream gateway the relay forwards to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// WebSocket URL of the gateway (`ws://` or `wss://`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Server-held credential injected into handshakes that carry none.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub token: Option<Secret<String>>,
}

impl GatewayConfig {
    /// Trimmed URL, `None` when unset or blank.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }

    /// Trimmed token, `None` when unset or blank.
    pub fn token(&self) -> Option<&str> {
        self.token
            .as_ref()
            .map(|t| t.expose_secret().trim())
            .filter(|t| !t.is_empty())
    }
}

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub port: u16,
    /// Route the browser connects to.
    pub path: String,
    /// Give up on an upstream that has not completed its WebSocket upgrade.
    pub upstream_connect_timeout_ms: u64,
    /// How long a caller may stay attached after the upstream failed without
    /// sending anything the failure can be reported on.
    pub failure_hold_ms: u64,
    /// Caller frames held while the upstream is still connecting.
    pub max_buffered_frames: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 3000,
            path: "/api/gateway/ws".into(),
            upstream_connect_timeout_ms: 10_000,
            failure_hold_ms: 5_000,
            max_buffered_frames: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Wait before sending the handshake so a pushed challenge can arrive first.
    pub settle_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_factor: f64,
    /// Sign handshakes with the persisted device key.
    pub device_identity: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            settle_ms: 750,
            reconnect_initial_ms: 800,
            reconnect_max_ms: 15_000,
            reconnect_factor: 1.7,
            device_identity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub closed_run_ttl_ms: u64,
    pub summary_debounce_ms: u64,
    pub live_tick_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            closed_run_ttl_ms: 30_000,
            summary_debounce_ms: 750,
            live_tick_ms: 16,
        }
    }
}
