//! Stable SHA-256 fingerprints of desired-state sections.
//!
//! A section is serialized with bincode and hashed; equal fingerprints mean
//! a reconciliation pass has nothing to do. Sections must only contain
//! ordered collections so the encoding is deterministic.

use std::fmt;

use bincode::config;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Hex-encoded SHA-256 digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a serializable section.
    ///
    /// # Errors
    ///
    /// Returns a render error if the section cannot be encoded.
    pub fn of<T: Serialize>(section: &str, value: &T) -> Result<Self> {
        let bytes = bincode::serde::encode_to_vec(value, config::standard())
            .map_err(|e| Error::render(section, format!("cannot fingerprint: {e}")))?;
        Ok(Self::of_bytes(&bytes))
    }

    /// Fingerprint raw bytes.
    #[must_use]
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex digits, for log lines.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
