//! Where the relay learns the upstream gateway URL and token.

use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    studio_config::{StudioConfig, try_discover_and_load},
    url::Url,
};

use crate::RelayError;

/// Upstream target as loaded for one caller.
#[derive(Debug, Clone, Default)]
pub struct UpstreamSettings {
    pub url: Option<String>,
    pub token: Option<Secret<String>>,
}

impl UpstreamSettings {
    pub fn new(url: impl Into<String>, token: Option<&str>) -> Self {
        Self {
            url: Some(url.into()),
            token: token.map(|t| Secret::new(t.to_string())),
        }
    }

    pub fn from_config(config: &StudioConfig) -> Self {
        Self {
            url: config.gateway.url().map(str::to_string),
            token: config.gateway.token().map(|t| Secret::new(t.to_string())),
        }
    }

    /// Validated `ws://` or `wss://` URL.
    pub fn resolve_url(&self) -> Result<Url, RelayError> {
        let raw = self
            .url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(RelayError::UrlMissing)?;
        let url = Url::parse(raw).map_err(|e| RelayError::UrlInvalid(format!("{raw}: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(RelayError::UrlInvalid(format!(
                "{raw}: unsupported scheme {other}"
            ))),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token
            .as_ref()
            .map(|t| t.expose_secret().trim())
            .filter(|t| !t.is_empty())
    }
}

/// Loaded once per accepted caller so edits apply without a restart.
pub trait SettingsSource: Send + Sync {
    fn load(&self) -> anyhow::Result<UpstreamSettings>;
}

/// Fixed settings, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings(pub UpstreamSettings);

impl SettingsSource for StaticSettings {
    fn load(&self) -> anyhow::Result<UpstreamSettings> {
        Ok(self.0.clone())
    }
}

/// Reads the studio config file (plus environment overrides) on every load.
#[derive(Debug, Clone, Default)]
pub struct ConfigFileSettings {
    explicit: Option<PathBuf>,
}

impl ConfigFileSettings {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        Self { explicit }
    }
}

impl SettingsSource for ConfigFileSettings {
    fn load(&self) -> anyhow::Result<UpstreamSettings> {
        let config = try_discover_and_load(self.explicit.as_deref())?;
        Ok(UpstreamSettings::from_config(&config))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_invalid_urls() {
        assert!(matches!(
            UpstreamSettings::default().resolve_url(),
            Err(RelayError::UrlMissing)
        ));
        assert!(matches!(
            UpstreamSettings::new("  ", None).resolve_url(),
            Err(RelayError::UrlMissing)
        ));
        assert!(matches!(
            UpstreamSettings::new("https://gw.example", None).resolve_url(),
            Err(RelayError::UrlInvalid(_))
        ));
        assert!(matches!(
            UpstreamSettings::new("::::", None).resolve_url(),
            Err(RelayError::UrlInvalid(_))
        ));
        assert_eq!(
            UpstreamSettings::new("wss://gw.example/ws", None)
                .resolve_url()
                .unwrap()
                .as_str(),
            "wss://gw.example/ws"
        );
    }

    #[test]
    fn config_file_is_reread_on_every_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studio.toml");
        std::fs::write(&path, "[gateway]\nurl = \"ws://one.example\"\n").unwrap();
        let source = ConfigFileSettings::new(Some(path.clone()));
        assert_eq!(source.load().unwrap().url.as_deref(), Some("ws://one.example"));

        std::fs::write(&path, "[gateway]\nurl = \"ws://two.example\"\ntoken = \"t\"\n").unwrap();
        let settings = source.load().unwrap();
        assert_eq!(settings.url.as_deref(), Some("ws://two.example"));
        assert_eq!(settings.token(), Some("t"));
    }

    #[test]
    fn malformed_config_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studio.toml");
        std::fs::write(&path, "[gateway\n").unwrap();
        assert!(ConfigFileSettings::new(Some(path)).load().is_err());
    }
}
