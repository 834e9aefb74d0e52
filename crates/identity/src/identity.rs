use std::fmt;

use {
    base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD},
    ed25519_dalek::{Signer, SigningKey},
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
    tracing::{info, warn},
};

use crate::{Error, KeyValueStore, Result};

pub(crate) const IDENTITY_SCOPE: &str = "device";
pub(crate) const IDENTITY_KEY: &str = "identity";
const IDENTITY_VERSION: u32 = 1;

/// Persisted record. Keys are raw bytes encoded as unpadded base64url.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredIdentity {
    version: u32,
    device_id: String,
    public_key: String,
    private_key: String,
    created_at_ms: u64,
}

/// The installation's signing identity.
#[derive(Clone)]
pub struct DeviceIdentity {
    device_id: String,
    public_key: String,
    signing_key: SigningKey,
}

impl DeviceIdentity {
    fn from_signing_key(signing_key: SigningKey) -> Self {
        let raw_public = signing_key.verifying_key().to_bytes();
        Self {
            device_id: fingerprint_raw(&raw_public),
            public_key: URL_SAFE_NO_PAD.encode(raw_public),
            signing_key,
        }
    }

    fn generate() -> Self {
        let seed: [u8; 32] = rand::random();
        Self::from_signing_key(SigningKey::from_bytes(&seed))
    }

    /// `hex(sha256(raw public key))`.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Raw public key, unpadded base64url.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign `payload`, returning the signature as unpadded base64url.
    pub fn sign(&self, payload: &str) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.sign(payload.as_bytes()).to_bytes())
    }

    fn to_stored(&self, created_at_ms: u64) -> StoredIdentity {
        StoredIdentity {
            version: IDENTITY_VERSION,
            device_id: self.device_id.clone(),
            public_key: self.public_key.clone(),
            private_key: URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes()),
            created_at_ms,
        }
    }
}

impl fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

fn fingerprint_raw(raw_public: &[u8]) -> String {
    hex::encode(Sha256::digest(raw_public))
}

/// Derive the device id from an encoded public key.
pub fn fingerprint_public_key(public_key: &str) -> Result<String> {
    let raw = decode_key(public_key)?;
    Ok(fingerprint_raw(&raw))
}

fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(encoded.trim().as_bytes())
        .map_err(|e| Error::InvalidKey(format!("not unpadded base64url: {e}")))
}

fn restore(stored: &StoredIdentity) -> Result<DeviceIdentity> {
    let seed = decode_key(&stored.private_key)?;
    let seed: [u8; 32] = seed
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidKey(format!("private key is {} bytes, want 32", seed.len())))?;
    let identity = DeviceIdentity::from_signing_key(SigningKey::from_bytes(&seed));
    if identity.public_key != stored.public_key.trim() {
        return Err(Error::KeyMismatch);
    }
    Ok(identity)
}

/// Load the persisted identity, repairing or creating it as needed.
///
/// - stored fingerprint differs from the one derived from the key: the record
///   is rewritten with the derived id, keys unchanged;
/// - nothing stored, or the record cannot be decoded: a new keypair is
///   generated and persisted.
///
/// Persistence failures on write are logged and ignored; a read failure is
/// returned so the caller can fall back to unsigned handshakes.
pub fn load_or_create_identity(store: &dyn KeyValueStore, now_ms: u64) -> Result<DeviceIdentity> {
    if let Some(raw) = store.get(IDENTITY_SCOPE, IDENTITY_KEY)? {
        let restored = serde_json::from_str::<StoredIdentity>(&raw)
            .map_err(|e| Error::CorruptIdentity(e.to_string()))
            .and_then(|stored| restore(&stored).map(|identity| (stored, identity)));
        match restored {
            Ok((stored, identity)) => {
                if stored.device_id != identity.device_id {
                    info!(
                        stored = %stored.device_id,
                        derived = %identity.device_id,
                        "repairing device identity fingerprint"
                    );
                    persist(store, &identity, stored.created_at_ms);
                }
                return Ok(identity);
            },
            Err(e) if e.is_corrupt_identity() => {
                warn!(error = %e, "stored device identity is corrupt, generating a new one");
            },
            Err(e) => return Err(e),
        }
    }

    let identity = DeviceIdentity::generate();
    info!(device_id = %identity.device_id, "created device identity");
    persist(store, &identity, now_ms);
    Ok(identity)
}

fn persist(store: &dyn KeyValueStore, identity: &DeviceIdentity, created_at_ms: u64) {
    let result = serde_json::to_string(&identity.to_stored(created_at_ms))
        .map_err(Error::from)
        .and_then(|json| store.set(IDENTITY_SCOPE, IDENTITY_KEY, &json));
    if let Err(e) = result {
        warn!(error = %e, "failed to persist device identity");
    }
}
