//! Cache of gateway-issued device tokens, keyed by `(auth scope, role)`.
//!
//! Every operation here is best-effort: storage failures are logged and the
//! caller proceeds as if nothing was cached.

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
    url::Url,
};

use crate::KeyValueStore;

pub(crate) const DEVICE_AUTH_SCOPE: &str = "device-auth";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAuthEntry {
    pub token: String,
    pub role: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub updated_at_ms: u64,
}

fn entry_key(auth_scope: &str, role: &str) -> String {
    format!("{}|{}", normalize_auth_scope(auth_scope), role.trim())
}

/// Normalize a gateway URL so equivalent spellings share one cache slot.
///
/// Scheme and host are lowercased by the URL parser, default ports dropped,
/// query and fragment removed, trailing slashes trimmed. Strings that do not
/// parse as URLs are only trimmed and lowercased.
pub fn normalize_auth_scope(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.trim_end_matches('/').to_ascii_lowercase();
    };
    url.set_query(None);
    url.set_fragment(None);
    let mut normalized = url.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

pub fn load_device_auth(
    store: &dyn KeyValueStore,
    auth_scope: &str,
    role: &str,
) -> Option<DeviceAuthEntry> {
    let raw = match store.get(DEVICE_AUTH_SCOPE, &entry_key(auth_scope, role)) {
        Ok(raw) => raw?,
        Err(e) => {
            warn!(error = %e, "failed to read cached device token");
            return None;
        },
    };
    match serde_json::from_str::<DeviceAuthEntry>(&raw) {
        Ok(entry) if !entry.token.trim().is_empty() => Some(entry),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "ignoring corrupt cached device token");
            None
        },
    }
}

/// Persist a freshly issued device token, replacing any prior entry for the
/// same `(auth scope, role)`.
pub fn record_issued_credential(
    store: &dyn KeyValueStore,
    auth_scope: &str,
    entry: &DeviceAuthEntry,
) {
    if entry.token.trim().is_empty() {
        return;
    }
    let key = entry_key(auth_scope, &entry.role);
    let result = serde_json::to_string(entry)
        .map_err(crate::Error::from)
        .and_then(|json| store.set(DEVICE_AUTH_SCOPE, &key, &json));
    match result {
        Ok(()) => debug!(role = %entry.role, "cached issued device token"),
        Err(e) => warn!(error = %e, "failed to cache issued device token"),
    }
}

pub fn clear_credential(store: &dyn KeyValueStore, auth_scope: &str, role: &str) {
    if let Err(e) = store.remove(DEVICE_AUTH_SCOPE, &entry_key(auth_scope, role)) {
        warn!(error = %e, "failed to clear cached device token");
    }
}
