//! Credential handling for the `connect` frame passing through the relay.

use serde_json::{Map, Value};

use crate::RelayError;

/// Which credential the forwarded handshake carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeAuth {
    /// The caller supplied a token; the frame is forwarded untouched.
    Caller,
    /// The relay wrote its own token into `params.auth.token`.
    Injected,
}

fn caller_token(frame: &Value) -> Option<&str> {
    frame
        .pointer("/params/auth/token")
        .and_then(Value::as_str)
        .filter(|t| !t.trim().is_empty())
}

/// Ensure a `connect` request carries a token.
///
/// A non-empty caller token wins and nothing is modified. Otherwise the relay
/// token is written to `params.auth.token`, creating `params`/`auth` as needed
/// and leaving every other field (device block included) as it was.
pub fn prepare_connect_frame(
    frame: &mut Value,
    relay_token: Option<&str>,
) -> Result<HandshakeAuth, RelayError> {
    if caller_token(frame).is_some() {
        return Ok(HandshakeAuth::Caller);
    }
    let token = relay_token
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(RelayError::TokenMissing)?;

    let auth = frame
        .as_object_mut()
        .and_then(|root| object_entry(root, "params"))
        .and_then(|params| object_entry(params, "auth"))
        .ok_or(RelayError::TokenMissing)?;
    auth.insert("token".into(), Value::String(token.to_string()));
    Ok(HandshakeAuth::Injected)
}

/// `map[key]` as an object, replacing a missing or non-object value.
fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> Option<&'a mut Map<String, Value>> {
    if !map.get(key).is_some_and(Value::is_object) {
        map.insert(key.to_string(), Value::Object(Map::new()));
    }
    map.get_mut(key).and_then(Value::as_object_mut)
}

/// `id` of a request frame, when present.
pub fn request_id(frame: &Value) -> Option<String> {
    frame
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}
