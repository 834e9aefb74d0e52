//! Same-origin relay between browser callers and the upstream gateway.
//!
//! Each caller gets its own upstream connection, opened as soon as the caller
//! attaches. Caller frames are held until the upstream is open. When the
//! caller's `connect` handshake carries no token the relay writes its own into
//! `params.auth.token` and leaves the rest of the frame alone.

pub mod error;
pub mod inject;
pub mod server;
mod session;
pub mod settings;

pub use {
    error::RelayError,
    inject::{HandshakeAuth, prepare_connect_frame},
    server::{RelayLimits, RelayState, build_relay_app, start_relay},
    settings::{ConfigFileSettings, SettingsSource, StaticSettings, UpstreamSettings},
};
