//! Deterministic keys identifying one logical operation instance.

use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 over a namespace and the canonical JSON of some content.
///
/// Every pipeline derives its idempotency key through this one type, so two
/// requests collide exactly when they carry the same identifying content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints `content` within `namespace`.
    ///
    /// Struct fields serialize in declaration order and maps used in
    /// requests are `BTreeMap`s, so the JSON is stable for equal values.
    pub fn of<T: Serialize + ?Sized>(namespace: &str, content: &T) -> Result<Self> {
        let body = serde_json::to_vec(content)?;

        let mut hasher = Sha256::new();
        hasher.update(namespace.as_bytes());
        hasher.update(b"::");
        hasher.update(&body);
        Ok(Fingerprint(hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
