//! Shared client library for API types and HTTP clients.
//!
//! This library provides type definitions and HTTP client implementations
//! for the Herald API. Types are always available, while HTTP client code
//! is gated behind the `client` feature.
//!
//! ## Use of `#[non_exhaustive]`
//!
//! We use `#[non_exhaustive]` on structs and enums to prevent users manually
//! constructing the types while still allowing their fields to be `pub` for
//! reading. The intention here is that users must generally construct the types
//! either by:
//! - Using constructors on the types
//! - Using builder methods
//! - Using deserialization
//!
//! We do this because some types in this module may contain invariants that
//! need to be upheld, and it's easier to ensure that all types follow these
//! guidelines in the module than do it piecemeal.

use std::fmt;

use derive_more::Display;
use enum_assoc::Assoc;
use http::header::HeaderValue;

pub mod herald;

/// A secret value (API token, bridge password, metrics token).
///
/// This type wraps a string and ensures it is never accidentally leaked
/// in logs or debug output. To access the actual value, use the
/// `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The latest Herald client version.
#[cfg(feature = "client")]
pub type Herald = herald::v1::Client;

/// Herald v1 client.
#[cfg(feature = "client")]
pub type HeraldV1 = herald::v1::Client;

/// Content types used by the library.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Assoc)]
#[func(pub const fn value(&self) -> HeaderValue)]
#[func(pub const fn to_str(&self) -> &'static str)]
#[display("{}", self.to_str())]
pub enum ContentType {
    #[assoc(to_str = "application/atom+xml")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Atom,

    /// Used for feed bodies when upstream does not declare a type.
    #[assoc(to_str = "application/xml; charset=utf-8")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Xml,

    #[assoc(to_str = "application/json")]
    #[assoc(value = HeaderValue::from_static(self.to_str()))]
    Json,
}

impl ContentType {
    /// The `Accept` value sent when requesting feeds, preferring Atom and RSS.
    pub const FEED_ACCEPT: &str = "application/atom+xml, application/rss+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.1";

    /// Whether a `Content-Type` value plausibly describes a feed document.
    pub fn is_feed(value: &str) -> bool {
        let value = value.to_ascii_lowercase();
        ["xml", "atom", "rss"]
            .iter()
            .any(|marker| value.contains(marker))
    }
}
