use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    ed25519_dalek::{Signature, VerifyingKey},
};

/// Fields covered by the handshake signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthPayload {
    pub device_id: String,
    pub client_id: String,
    pub client_mode: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub signed_at_ms: u64,
    pub token: Option<String>,
    pub nonce: Option<String>,
}

impl DeviceAuthPayload {
    pub fn version(&self) -> &'static str {
        if self.nonce.is_some() { "v2" } else { "v1" }
    }

    /// Canonical pipe-delimited form.
    ///
    /// `version|deviceId|clientId|clientMode|role|scopes|signedAtMs|token[|nonce]`
    /// with scopes sorted and comma-joined, and an empty field for a missing
    /// token.
    pub fn canonical(&self) -> String {
        let mut scopes = self.scopes.clone();
        scopes.sort();
        scopes.dedup();
        let mut fields = vec![
            self.version().to_string(),
            self.device_id.clone(),
            self.client_id.clone(),
            self.client_mode.clone(),
            self.role.clone(),
            scopes.join(","),
            self.signed_at_ms.to_string(),
            self.token.clone().unwrap_or_default(),
        ];
        if let Some(nonce) = &self.nonce {
            fields.push(nonce.clone());
        }
        fields.join("|")
    }
}

pub fn build_device_auth_payload(payload: &DeviceAuthPayload) -> String {
    payload.canonical()
}

/// Check an unpadded base64url Ed25519 signature over `payload`.
pub fn verify_device_signature(public_key: &str, payload: &str, signature: &str) -> bool {
    let Ok(key_bytes) = URL_SAFE_NO_PAD.decode(public_key.trim().as_bytes()) else {
        return false;
    };
    let Ok(key_bytes) = <[u8; 32]>::try_from(key_bytes.as_slice()) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = URL_SAFE_NO_PAD.decode(signature.trim().as_bytes()) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(sig_bytes.as_slice()) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify_strict(payload.as_bytes(), &signature)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(nonce: Option<&str>, token: Option<&str>) -> DeviceAuthPayload {
        DeviceAuthPayload {
            device_id: "dev".into(),
            client_id: "studio".into(),
            client_mode: "webchat".into(),
            role: "operator".into(),
            scopes: vec!["operator.write".into(), "operator.admin".into()],
            signed_at_ms: 1_700_000_000_000,
            token: token.map(str::to_string),
            nonce: nonce.map(str::to_string),
        }
    }

    #[test]
    fn v1_without_nonce() {
        assert_eq!(
            build_device_auth_payload(&payload(None, Some("tok"))),
            "v1|dev|studio|webchat|operator|operator.admin,operator.write|1700000000000|tok"
        );
    }

    #[test]
    fn v2_appends_nonce() {
        assert_eq!(
            build_device_auth_payload(&payload(Some("n-1"), None)),
            "v2|dev|studio|webchat|operator|operator.admin,operator.write|1700000000000||n-1"
        );
    }

    #[test]
    fn scope_order_does_not_change_payload() {
        let mut reversed = payload(None, None);
        reversed.scopes.reverse();
        assert_eq!(reversed.canonical(), payload(None, None).canonical());
    }

    #[test]
    fn garbage_inputs_do_not_verify() {
        assert!(!verify_device_signature("not-base64!", "x", "AAAA"));
        assert!(!verify_device_signature("AAAA", "x", "AAAA"));
    }
}
