//! Opaque routing tokens for proxied feeds.
//!
//! A proxied feed URL carries everything needed to serve it: the bridge URL
//! that was discovered when the feed was created, plus any bridge login. The
//! server stores nothing; instead the payload is sealed with AES-256-GCM so
//! that it can be neither read nor altered by whoever holds the URL.
//!
//! ## Format
//!
//! ```not_rust
//! v1.<nonce>.<ciphertext>.<tag>
//! ```
//!
//! Each segment is base64url without padding. The nonce is 12 random bytes
//! per token and the tag is the 16 byte GCM authentication tag.
//!
//! ## Failure
//!
//! Decoding fails closed: any malformed segment, authentication failure, or
//! payload that doesn't validate is an [`InvalidToken`] and nothing from the
//! token is used.

use aes_gcm::{
    Aes256Gcm, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use clients::herald::v1::Platform;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display, Error};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::social::Credentials;

const VERSION: u8 = 1;
const VERSION_PREFIX: &str = "v1";
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// The contents of a feed token.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SocialFeedTokenPayload {
    pub platform: Platform,
    pub handle: String,

    /// Must be checked against the configured bridge before use.
    pub bridge_feed_url: String,

    pub credentials: Option<Credentials>,
}

/// Wire form of the payload, as sealed inside the token.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Sealed {
    v: u8,
    platform: Platform,
    handle: String,
    bridge_feed_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    bridge_login_username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    bridge_login_password: Option<String>,
}

/// The token could not be decoded.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("invalid token: {reason}")]
pub struct InvalidToken {
    pub reason: &'static str,
}

impl InvalidToken {
    const fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

/// Encodes and decodes feed tokens with a key derived from a server secret.
///
/// The key is the SHA-256 digest of the secret, so any secret string works
/// but tokens only survive restarts if the secret does.
#[derive(Clone, Debug)]
pub struct TokenCodec {
    #[debug(skip)]
    cipher: Aes256Gcm,
}

impl TokenCodec {
    pub fn new(secret: impl AsRef<str>) -> Result<Self> {
        let key = Sha256::digest(secret.as_ref().as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| eyre!("derive token key: {err}"))?;
        Ok(Self { cipher })
    }

    /// Seal the payload into a token.
    ///
    /// Each call uses a fresh nonce, so encoding the same payload twice
    /// produces different tokens.
    pub fn encode(&self, payload: &SocialFeedTokenPayload) -> Result<String> {
        let (username, password) = match &payload.credentials {
            Some(Credentials { username, password }) => {
                (Some(username.clone()), Some(password.clone()))
            }
            None => (None, None),
        };
        let sealed = Sealed {
            v: VERSION,
            platform: payload.platform,
            handle: payload.handle.clone(),
            bridge_feed_url: payload.bridge_feed_url.clone(),
            bridge_login_username: username,
            bridge_login_password: password,
        };
        let mut buffer = serde_json::to_vec(&sealed).context("serialize token payload")?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", &mut buffer)
            .map_err(|err| eyre!("seal token payload: {err}"))?;

        Ok(format!(
            "{VERSION_PREFIX}.{}.{}.{}",
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(&buffer),
            URL_SAFE_NO_PAD.encode(tag),
        ))
    }

    /// Open and validate a token.
    pub fn decode(&self, token: &str) -> Result<SocialFeedTokenPayload, InvalidToken> {
        let mut segments = token.split('.');
        let (Some(version), Some(nonce), Some(ciphertext), Some(tag), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(InvalidToken::new("expected four segments"));
        };
        if version != VERSION_PREFIX {
            return Err(InvalidToken::new("unsupported version"));
        }

        let nonce = decode_segment(nonce)?;
        let mut buffer = decode_segment(ciphertext)?;
        let tag = decode_segment(tag)?;
        if nonce.len() != NONCE_LEN {
            return Err(InvalidToken::new("bad nonce length"));
        }
        if tag.len() != TAG_LEN {
            return Err(InvalidToken::new("bad tag length"));
        }

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buffer,
                Tag::from_slice(&tag),
            )
            .map_err(|_| InvalidToken::new("authentication failed"))?;

        let sealed = serde_json::from_slice::<Sealed>(&buffer)
            .map_err(|_| InvalidToken::new("malformed payload"))?;
        validate(sealed)
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, InvalidToken> {
    if segment.is_empty() {
        return Err(InvalidToken::new("empty segment"));
    }
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| InvalidToken::new("bad encoding"))
}

fn validate(sealed: Sealed) -> Result<SocialFeedTokenPayload, InvalidToken> {
    let Sealed {
        v,
        platform,
        handle,
        bridge_feed_url,
        bridge_login_username,
        bridge_login_password,
    } = sealed;

    if v != VERSION {
        return Err(InvalidToken::new("unsupported payload version"));
    }
    if handle.is_empty() {
        return Err(InvalidToken::new("empty handle"));
    }
    if bridge_feed_url.is_empty() {
        return Err(InvalidToken::new("empty bridge feed url"));
    }
    let credentials = match (bridge_login_username, bridge_login_password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        (None, None) => None,
        _ => return Err(InvalidToken::new("unpaired credentials")),
    };

    Ok(SocialFeedTokenPayload {
        platform,
        handle,
        bridge_feed_url,
        credentials,
    })
}
