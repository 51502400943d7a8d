use clients::herald::v1::Platform;
use derive_more::{Debug, Display};
use sha2::{Digest, Sha256};

use crate::social::{Credentials, NormalizedSocialInput};

/// Number of hex characters of the credential digest kept in the key.
const FINGERPRINT_LEN: usize = 16;

/// Identifies an upstream feed source.
///
/// Rate limits, caches and in-flight requests are all keyed by this value.
/// Two subscriptions to the same profile share a key only if they also use
/// the same bridge login, so that feeds fetched with one account's access are
/// never served to another.
///
/// The contents should be treated as opaque; the credential part is a short
/// digest, never the credentials themselves.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[display("{_0}")]
#[debug("{_0:?}")]
pub struct SourceKey(String);

impl SourceKey {
    pub fn new(platform: Platform, handle: &str, credentials: Option<&Credentials>) -> Self {
        let fingerprint = match credentials {
            Some(Credentials { username, password }) => {
                let digest = Sha256::new()
                    .chain_update(username.as_bytes())
                    .chain_update(b"\n")
                    .chain_update(password.as_bytes())
                    .finalize();
                let mut hex = hex::encode(digest);
                hex.truncate(FINGERPRINT_LEN);
                hex
            }
            None => String::from("anon"),
        };
        Self(format!(
            "{}:{}:{fingerprint}",
            platform.as_str(),
            handle.to_ascii_lowercase()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&NormalizedSocialInput> for SourceKey {
    fn from(input: &NormalizedSocialInput) -> Self {
        Self::new(input.platform, &input.handle, input.credentials.as_ref())
    }
}
