use studio_protocol::DeviceInfo;

use crate::{
    DeviceAuthPayload, DeviceIdentity, KeyValueStore, auth_store::load_device_auth,
    build_device_auth_payload,
};

/// Everything the signer needs besides the identity itself.
#[derive(Debug, Clone, Default)]
pub struct HandshakeSigningInput {
    /// Usually the gateway URL; normalized before keying the token cache.
    pub auth_scope: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub caller_token: Option<String>,
    pub nonce: Option<String>,
    pub signed_at_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SignedHandshake {
    pub device: DeviceInfo,
    /// Token to place in `auth.token`: the cached device token when one
    /// exists, else the caller's.
    pub token: Option<String>,
    pub used_device_token: bool,
    pub scopes: Vec<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Build the signed device block for a handshake.
///
/// A cached device token for `(auth scope, role)` takes precedence over the
/// caller-supplied token; the chosen token is the one covered by the
/// signature.
pub fn build_signed_handshake_fields(
    identity: &DeviceIdentity,
    store: &dyn KeyValueStore,
    input: &HandshakeSigningInput,
) -> SignedHandshake {
    let cached = load_device_auth(store, &input.auth_scope, &input.role)
        .and_then(|entry| non_empty(Some(entry.token.as_str())));
    let used_device_token = cached.is_some();
    let token = cached.or_else(|| non_empty(input.caller_token.as_deref()));
    let nonce = non_empty(input.nonce.as_deref());

    let mut scopes = input.scopes.clone();
    scopes.sort();
    scopes.dedup();

    let payload = DeviceAuthPayload {
        device_id: identity.device_id().to_string(),
        client_id: input.client_id.clone(),
        client_mode: input.client_mode.clone(),
        role: input.role.clone(),
        scopes: scopes.clone(),
        signed_at_ms: input.signed_at_ms,
        token: token.clone(),
        nonce: nonce.clone(),
    };
    let signature = identity.sign(&build_device_auth_payload(&payload));

    SignedHandshake {
        device: DeviceInfo {
            id: identity.device_id().to_string(),
            public_key: identity.public_key().to_string(),
            signature,
            signed_at: input.signed_at_ms,
            nonce,
        },
        token,
        used_device_token,
        scopes,
    }
}
