use std::time::Duration;

use {
    secrecy::{ExposeSecret, Secret},
    studio_config::StudioConfig,
    studio_protocol::{ClientInfo, roles, scopes},
};

use crate::BackoffPolicy;

pub const DEFAULT_CLIENT_ID: &str = "studio";
pub const DEFAULT_CLIENT_MODE: &str = "webchat";

/// How the client presents itself and paces its connection attempts.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    /// Shared gateway token; a cached device token takes precedence.
    pub token: Option<Secret<String>>,
    pub password: Option<Secret<String>>,
    /// Sign handshakes with the persisted device key.
    pub device_identity: bool,
    pub settle: Duration,
    pub backoff: BackoffPolicy,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client: ClientInfo {
                id: DEFAULT_CLIENT_ID.into(),
                display_name: None,
                version: env!("CARGO_PKG_VERSION").into(),
                platform: std::env::consts::OS.into(),
                mode: DEFAULT_CLIENT_MODE.into(),
                instance_id: Some(uuid::Uuid::new_v4().to_string()),
            },
            role: roles::OPERATOR.into(),
            scopes: scopes::DEFAULT_OPERATOR
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            caps: Vec::new(),
            token: None,
            password: None,
            device_identity: true,
            settle: Duration::from_millis(750),
            backoff: BackoffPolicy::default(),
            user_agent: Some(format!("studio/{}", env!("CARGO_PKG_VERSION"))),
            locale: None,
        }
    }
}

impl ClientOptions {
    pub fn from_config(config: &StudioConfig) -> Self {
        let client = &config.client;
        Self {
            token: config.gateway.token().map(|t| Secret::new(t.to_string())),
            device_identity: client.device_identity,
            settle: Duration::from_millis(client.settle_ms),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(client.reconnect_initial_ms),
                factor: client.reconnect_factor,
                max: Duration::from_millis(client.reconnect_max_ms),
            },
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(Secret::new(token.into()));
        self
    }

    #[must_use]
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    #[must_use]
    pub fn without_device_identity(mut self) -> Self {
        self.device_identity = false;
        self
    }

    pub(crate) fn token_str(&self) -> Option<&str> {
        self.token
            .as_ref()
            .map(|t| t.expose_secret().trim())
            .filter(|t| !t.is_empty())
    }

    pub(crate) fn password_str(&self) -> Option<&str> {
        self.password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_timings_flow_into_options() {
        let mut config = StudioConfig::default();
        config.client.settle_ms = 10;
        config.client.reconnect_initial_ms = 100;
        config.client.device_identity = false;
        config.gateway.token = Some(Secret::new(" tok ".into()));

        let options = ClientOptions::from_config(&config);
        assert_eq!(options.settle, Duration::from_millis(10));
        assert_eq!(options.backoff.initial, Duration::from_millis(100));
        assert!(!options.device_identity);
        assert_eq!(options.token_str(), Some("tok"));
        assert_eq!(options.role, roles::OPERATOR);
    }

    #[test]
    fn blank_token_reads_as_none() {
        let options = ClientOptions::default().with_token("   ");
        assert!(options.token_str().is_none());
    }
}
