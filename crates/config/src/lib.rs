//! Configuration loading for the studio relay, client and bridge.
//!
//! Config files: `studio.toml`, `studio.yaml`/`studio.yml`, or `studio.json`,
//! searched in the current directory and then the user config directory.

pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{
        CONFIG_FILENAMES, ENV_GATEWAY_TOKEN, ENV_GATEWAY_URL, apply_env_overrides,
        apply_overrides_from, config_dir, find_config_file, load_from,
        try_discover_and_load,
    },
    schema::{BridgeConfig, ClientConfig, GatewayConfig, RelayConfig, StudioConfig},
};
