//! Herald v1 API types and client.

use std::collections::BTreeMap;

use bon::Builder;
use derive_more::{Debug, Display, From};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::{Client, CreateSocialFeedOutcome, FetchedFeed};

/// Header carrying the caller identity set by the authentication layer.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Header reporting whether a proxied feed was served from cache.
pub const CACHE_STATUS_HEADER: &str = "x-cache";

/// Header used to present the metrics token.
pub const METRICS_TOKEN_HEADER: &str = "x-metrics-token";

/// A social platform supported by the feed proxy.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[display("instagram")]
    Instagram,

    #[display("twitter")]
    Twitter,
}

impl Platform {
    /// Parse a platform name, ignoring case and surrounding whitespace.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "instagram" => Some(Self::Instagram),
            "twitter" => Some(Self::Twitter),
            _ => None,
        }
    }

    /// The lowercase name of the platform.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
        }
    }
}

/// Request to create a proxied feed for a social profile.
///
/// `handle` may be a bare handle (`@jack`), or a profile URL
/// (`https://x.com/jack`).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct CreateSocialFeedRequest {
    pub platform: Platform,

    #[builder(into)]
    pub handle: String,

    /// Login for bridges that need one; sent together with the password.
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_username: Option<String>,

    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[debug(ignore)]
    pub login_password: Option<String>,
}

/// A proxied feed was created.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize, Builder)]
#[non_exhaustive]
pub struct CreateSocialFeedResponse {
    /// The public URL the feed reader should poll.
    #[builder(into)]
    pub feed_url: String,

    /// Opaque key identifying the upstream source.
    #[builder(into)]
    pub source_key: String,

    pub platform: Platform,

    #[builder(into)]
    pub handle: String,

    /// Identifier assigned by the feed reader, when Herald subscribed on the
    /// caller's behalf.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<i64>,
}

/// The body of every error response.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// A scalar value attached to a metric event.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    #[from(ignore)]
    Null,
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<&String> for Scalar {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<u16> for Scalar {
    fn from(value: u16) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u64> for Scalar {
    fn from(value: u64) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

/// A notable occurrence recorded by the service.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct MetricEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,

    pub kind: String,

    #[serde(default)]
    pub details: BTreeMap<String, Scalar>,
}

impl MetricEvent {
    pub fn new(at: OffsetDateTime, kind: impl Into<String>, details: BTreeMap<String, Scalar>) -> Self {
        Self {
            at,
            kind: kind.into(),
            details,
        }
    }
}

/// Point-in-time view of the service counters and recent events.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct MetricsSnapshot {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,

    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,

    pub counters: BTreeMap<String, u64>,

    /// Oldest first.
    pub recent_events: Vec<MetricEvent>,
}

impl MetricsSnapshot {
    pub fn new(
        started_at: OffsetDateTime,
        generated_at: OffsetDateTime,
        counters: BTreeMap<String, u64>,
        recent_events: Vec<MetricEvent>,
    ) -> Self {
        Self {
            started_at,
            generated_at,
            counters,
            recent_events,
        }
    }

    /// Look up a counter by its full key, returning zero when it was never
    /// incremented.
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or_default()
    }
}
