//! Hashing of secrets presented by callers.

use derive_more::{Debug, Display};
use sha2::{Digest, Sha256};

/// The SHA-256 digest of a secret, hex encoded.
///
/// Used wherever a caller-presented secret has to be compared or used as a
/// key without keeping the plaintext around: the metrics token is stored only
/// in this form, and callers identified by their `Authorization` header are
/// rate limited by the hash of the header rather than the header itself.
///
/// Comparing digests rather than plaintexts also means the comparison time
/// doesn't depend on how long a common prefix the candidate shares with the
/// real secret.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{_0}")]
#[debug("{_0:?}")]
pub struct SecretHash(String);

impl SecretHash {
    /// Hash the given plaintext secret.
    pub fn new(secret: impl AsRef<str>) -> Self {
        let hash = Sha256::digest(secret.as_ref().as_bytes());
        Self(hex::encode(hash))
    }

    /// Whether `candidate` hashes to this value.
    pub fn matches(&self, candidate: impl AsRef<str>) -> bool {
        Self::new(candidate) == *self
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
