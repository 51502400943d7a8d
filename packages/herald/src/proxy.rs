//! Upstream feed fetching behind the response cache.
//!
//! The handler decides whether a request may reach the upstream at all; this
//! module owns what happens once it may: serving from the response cache,
//! collapsing concurrent fetches for a source into one, and storing
//! successful responses.

use std::time::Duration;

use axum::{body::Bytes, http::StatusCode};
use clients::ContentType;
use derive_more::{Debug, Display, Error};
use reqwest::header;
use tokio::task::JoinError;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    cache::{CacheEntry, CachedFeed, TtlCache},
    coalesce::Coalescer,
    config::Settings,
    social::Credentials,
    source_key::SourceKey,
};

/// Largest upstream feed body accepted, in bytes. Larger feeds are treated as
/// a failed fetch and never cached.
pub const MAX_FEED_SIZE: usize = 5 * 1024 * 1024;

/// The upstream feed could not be fetched.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
pub enum UpstreamError {
    /// The upstream answered with a non-success status.
    #[display("upstream responded with status {status}")]
    Status {
        status: u16,

        /// The upstream's `Retry-After`, passed through verbatim.
        retry_after: Option<String>,
    },

    /// The request didn't complete: connection failure, timeout, or an
    /// unreadable body.
    #[display("upstream request failed: {message}")]
    Transport { message: String },
}

impl UpstreamError {
    /// The status returned to our caller: upstream throttling stays a 429,
    /// everything else is a bad gateway.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UpstreamError::Status { status: 429, .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn retry_after(&self) -> Option<&str> {
        match self {
            UpstreamError::Status { retry_after, .. } => retry_after.as_deref(),
            UpstreamError::Transport { .. } => None,
        }
    }
}

impl From<JoinError> for UpstreamError {
    fn from(err: JoinError) -> Self {
        UpstreamError::Transport {
            message: format!("fetch task failed: {err}"),
        }
    }
}

/// Fetches upstream feeds, caching and coalescing by source key.
///
/// Cheaply cloneable; clones share caches.
#[derive(Clone, Debug)]
pub struct Proxy {
    #[debug(skip)]
    http: reqwest::Client,
    cache: TtlCache<CachedFeed>,
    coalescer: Coalescer<CachedFeed, UpstreamError>,
    timeout: Duration,
}

impl Proxy {
    pub fn new(http: reqwest::Client, settings: &Settings) -> Self {
        Self {
            http,
            cache: TtlCache::new(settings.cache_max_bytes, settings.cache_ttl),
            coalescer: Coalescer::new(),
            timeout: settings.fetch_timeout,
        }
    }

    /// The cached response for the source, if still fresh.
    pub fn cached(&self, source: &SourceKey) -> Option<CacheEntry<CachedFeed>> {
        self.cache.get(source.as_str())
    }

    /// Fetch the feed, sharing the fetch with concurrent callers for the same
    /// source. Successful responses are cached before they're returned.
    #[instrument(skip_all, fields(%source))]
    pub async fn fetch(
        &self,
        source: &SourceKey,
        url: Url,
        credentials: Option<Credentials>,
    ) -> Result<CachedFeed, UpstreamError> {
        let this = self.clone();
        let key = source.clone();
        self.coalescer
            .coalesce(source.as_str(), move || async move {
                let feed = this.fetch_upstream(url, credentials.as_ref()).await?;
                this.cache.set(key.as_str(), feed.clone());
                Ok(feed)
            })
            .await
    }

    async fn fetch_upstream(
        &self,
        url: Url,
        credentials: Option<&Credentials>,
    ) -> Result<CachedFeed, UpstreamError> {
        debug!("proxy.upstream.request");
        let mut request = self
            .http
            .get(url)
            .timeout(self.timeout)
            .header(header::ACCEPT, ContentType::FEED_ACCEPT);
        if let Some(Credentials { username, password }) = credentials {
            request = request.basic_auth(username, Some(password));
        }

        let mut response = request.send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            warn!(%status, ?retry_after, "proxy.upstream.status");
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                retry_after,
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| ContentType::Xml.to_str().to_string());
        let body = read_body(&mut response).await?;
        debug!(bytes = body.len(), %content_type, "proxy.upstream.response");
        Ok(CachedFeed { body, content_type })
    }

    /// Number of sources with a fetch in flight.
    pub fn in_flight(&self) -> usize {
        self.coalescer.in_flight()
    }
}

/// Read the response body, giving up once it passes [`MAX_FEED_SIZE`].
async fn read_body(response: &mut reqwest::Response) -> Result<Bytes, UpstreamError> {
    if response
        .content_length()
        .is_some_and(|length| length > MAX_FEED_SIZE as u64)
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(transport)? {
        if body.len() + chunk.len() > MAX_FEED_SIZE {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Bytes::from(body))
}

fn too_large() -> UpstreamError {
    warn!(limit = MAX_FEED_SIZE, "proxy.upstream.too_large");
    UpstreamError::Transport {
        message: format!("feed larger than {MAX_FEED_SIZE} bytes"),
    }
}

fn transport(err: reqwest::Error) -> UpstreamError {
    let message = if err.is_timeout() {
        String::from("timed out")
    } else {
        err.without_url().to_string()
    };
    UpstreamError::Transport { message }
}
