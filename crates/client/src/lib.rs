//! Client side of the gateway protocol.
//!
//! [`GatewayClient`] opens the WebSocket, waits briefly for a pushed
//! `connect.challenge`, sends a (device-signed) `connect` handshake, and then
//! multiplexes request/response calls and server-push events over the one
//! transport. A session that completed its handshake is re-established with
//! exponential backoff after unexpected loss.

pub mod backoff;
pub mod client;
mod connection;
pub mod error;
pub mod options;

pub use {
    backoff::{Backoff, BackoffPolicy, auto_retry_delay},
    client::{ConnectionStatus, GatewayClient, GatewayEvent},
    error::{ClientError, ConnectError},
    options::{ClientOptions, DEFAULT_CLIENT_ID, DEFAULT_CLIENT_MODE},
};
