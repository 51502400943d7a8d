//! Caller identity and access to the metrics endpoint.
//!
//! Herald doesn't authenticate users itself: it runs behind the reader's
//! authentication layer, which forwards the signed-in user in the
//! [`USER_ID_HEADER`] header. The identity is only used to key creation
//! rate limits, so when it's missing we fall back to the hash of the
//! `Authorization` header, and finally to a shared anonymous bucket.

use std::convert::Infallible;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use clients::herald::v1::USER_ID_HEADER;
use derive_more::{Debug, Display};
use tap::Pipe;

use crate::crypto::SecretHash;

/// Who is asking, for rate limiting purposes.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
pub enum Caller {
    #[display("user:{_0}")]
    User(String),

    /// Identified by the SHA-256 of the `Authorization` header.
    #[display("auth:{_0}")]
    Authorization(SecretHash),

    #[display("anonymous")]
    Anonymous,
}

impl Caller {
    fn from_parts(parts: &Parts) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        if let Some(user) = header(USER_ID_HEADER) {
            return Caller::User(user.to_string());
        }
        if let Some(authorization) = header(AUTHORIZATION.as_str()) {
            return Caller::Authorization(SecretHash::new(authorization));
        }
        Caller::Anonymous
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        Ok(Caller::from_parts(parts))
    }
}

/// Guards the metrics endpoint.
///
/// The configured token is kept only as its hash.
#[derive(Clone, Debug, Default)]
pub struct MetricsGate(Option<SecretHash>);

/// The result of presenting a token to the [`MetricsGate`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum GateDecision {
    /// No token is configured; the endpoint doesn't exist.
    Disabled,
    Denied,
    Allowed,
}

impl MetricsGate {
    pub fn new(token: Option<&str>) -> Self {
        token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(SecretHash::new)
            .pipe(Self)
    }

    /// Check a presented token; surrounding whitespace is ignored on both
    /// sides, matching how the configured token is read.
    pub fn check(&self, presented: Option<&str>) -> GateDecision {
        match (&self.0, presented.map(str::trim)) {
            (None, _) => GateDecision::Disabled,
            (Some(expected), Some(presented)) if expected.matches(presented) => {
                GateDecision::Allowed
            }
            (Some(_), _) => GateDecision::Denied,
        }
    }
}
