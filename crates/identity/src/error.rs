use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The store file could not be read or written.
    #[error("device store {}: {source}", path.display())]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("device store {} is not valid JSON: {source}", path.display())]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A store that is not file-backed refused the operation.
    #[error("device store unavailable: {0}")]
    Unavailable(String),

    #[error("stored device identity is unreadable: {0}")]
    CorruptIdentity(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// The stored public key is not the one derived from the stored private key.
    #[error("stored public key does not match the private key")]
    KeyMismatch,

    #[error("failed to encode device record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// The stored identity is unusable and should be replaced.
    pub fn is_corrupt_identity(&self) -> bool {
        matches!(
            self,
            Self::CorruptIdentity(_) | Self::InvalidKey(_) | Self::KeyMismatch
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
