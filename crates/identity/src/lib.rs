//! Device identity for the gateway handshake.
//!
//! An Ed25519 keypair is created once per installation and persisted through a
//! [`KeyValueStore`]. Every handshake carries a signature over a canonical
//! pipe-delimited payload (`v1`, or `v2` once the gateway issued a nonce).
//! Device tokens minted by the gateway are cached per `(auth scope, role)`.

pub mod auth_store;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod payload;
pub mod store;

pub use {
    auth_store::{
        DeviceAuthEntry, clear_credential, load_device_auth, normalize_auth_scope,
        record_issued_credential,
    },
    error::{Error, Result},
    handshake::{HandshakeSigningInput, SignedHandshake, build_signed_handshake_fields},
    identity::{DeviceIdentity, fingerprint_public_key, load_or_create_identity},
    payload::{DeviceAuthPayload, build_device_auth_payload, verify_device_signature},
    store::{FileStore, KeyValueStore, MemoryStore},
};
