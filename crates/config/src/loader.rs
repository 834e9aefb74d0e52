use std::path::{Path, PathBuf};

use {secrecy::Secret, tracing::debug};

use crate::{Error, Result, schema::StudioConfig};

pub const CONFIG_FILENAMES: &[&str] = &["studio.toml", "studio.yaml", "studio.yml", "studio.json"];

pub const ENV_GATEWAY_URL: &str = "STUDIO_GATEWAY_URL";
pub const ENV_GATEWAY_TOKEN: &str = "STUDIO_GATEWAY_TOKEN";

/// Per-user configuration directory (`~/.config/studio` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "studio").map(|d| d.config_dir().to_path_buf())
}

/// First config file found in the current directory, then the user config dir.
pub fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok();
    [cwd, config_dir()]
        .into_iter()
        .flatten()
        .find_map(|dir| find_in_dir(&dir))
}

fn find_in_dir(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}

/// Load a config file, choosing the parser from its extension.
pub fn load_from(path: &Path) -> Result<StudioConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_err = |message: String| Error::Parse {
        path: path.to_path_buf(),
        message,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw).map_err(|e| parse_err(e.to_string())),
        Some("yaml" | "yml") => serde_yaml::from_str(&raw).map_err(|e| parse_err(e.to_string())),
        Some("json") => serde_json::from_str(&raw).map_err(|e| parse_err(e.to_string())),
        _ => Err(Error::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Load from `explicit` (or the discovered file), then apply environment overrides.
///
/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn try_discover_and_load(explicit: Option<&Path>) -> Result<StudioConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_file(),
    };
    let mut config = match path {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_from(&path)?
        },
        None => {
            debug!("no config file found, using defaults");
            StudioConfig::default()
        },
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn apply_env_overrides(config: &mut StudioConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply gateway overrides from an arbitrary variable lookup. Blank values are ignored.
pub fn apply_overrides_from(config: &mut StudioConfig, lookup: impl Fn(&str) -> Option<String>) {
    let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
    if let Some(url) = non_blank(ENV_GATEWAY_URL) {
        config.gateway.url = Some(url);
    }
    if let Some(token) = non_blank(ENV_GATEWAY_TOKEN) {
        config.gateway.token = Some(Secret::new(token));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studio.toml");
        std::fs::write(
            &path,
            "[gateway]\nurl = \"ws://127.0.0.1:18789\"\n\n[relay]\nport = 4100\n",
        )
        .unwrap();
        let cfg = load_from(&path).unwrap();
        assert_eq!(cfg.gateway.url(), Some("ws://127.0.0.1:18789"));
        assert_eq!(cfg.relay.port, 4100);
        assert_eq!(cfg.relay.bind, "127.0.0.1");
    }

    #[test]
    fn loads_yaml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("studio.yaml");
        std::fs::write(&yaml, "client:\n  settle_ms: 100\n").unwrap();
        assert_eq!(load_from(&yaml).unwrap().client.settle_ms, 100);

        let json = dir.path().join("studio.json");
        std::fs::write(&json, r#"{"bridge":{"live_tick_ms":33}}"#).unwrap();
        assert_eq!(load_from(&json).unwrap().bridge.live_tick_ms, 33);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studio.toml");
        std::fs::write(&path, "[gateway\nurl=").unwrap();
        assert!(matches!(load_from(&path), Err(Error::Parse { .. })));
        assert!(try_discover_and_load(Some(&path)).is_err());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("studio.ini");
        std::fs::write(&path, "").unwrap();
        assert!(matches!(
            load_from(&path),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn missing_explicit_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(load_from(&path), Err(Error::Io { .. })));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut cfg = StudioConfig::default();
        cfg.gateway.url = Some("ws://file".into());
        let env = HashMap::from([
            (ENV_GATEWAY_URL, "wss://env/ws".to_string()),
            (ENV_GATEWAY_TOKEN, "  ".to_string()),
        ]);
        apply_overrides_from(&mut cfg, |k| env.get(k).cloned());
        assert_eq!(cfg.gateway.url(), Some("wss://env/ws"));
        assert!(cfg.gateway.token.is_none());
    }

    #[test]
    fn find_in_dir_prefers_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("studio.json"), "{}").unwrap();
        std::fs::write(dir.path().join("studio.toml"), "").unwrap();
        let found = find_in_dir(dir.path()).unwrap();
        assert!(found.ends_with("studio.toml"));
    }
}
