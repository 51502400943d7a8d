//! Server configuration.
//!
//! Everything is read from command line flags with environment variable
//! fallbacks. Numeric settings are parsed leniently: a value that is unset,
//! unparseable, not finite, or not positive falls back to its default rather
//! than failing startup, since a typo in a tuning knob shouldn't take the
//! service down.

use std::time::Duration;

use bon::Builder;
use clap::Parser;
use color_eyre::{Result, eyre::bail};
use derive_more::Debug;
use tap::Pipe;
use url::Url;

use crate::{bridge::BridgeRanking, metrics::DEFAULT_EVENT_CAPACITY, rate_limit::RateLimit};

pub const DEFAULT_CACHE_TTL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_DISCOVERY_CACHE_TTL_MS: u64 = 6 * 60 * 60 * 1000;
pub const DEFAULT_CACHE_MAX_BYTES: u32 = 64 * 1024 * 1024;
pub const DEFAULT_DISCOVERY_CACHE_MAX_ENTRIES: u32 = 10_000;
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_RATE_LIMIT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_GLOBAL_RATE_LIMIT: u32 = 300;
pub const DEFAULT_SOURCE_RATE_LIMIT: u32 = 30;
pub const DEFAULT_CREATE_RATE_LIMIT: u32 = 10;

#[derive(Parser, Debug)]
pub struct ServeConfig {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Base URL of the RSS-Bridge compatible service
    #[arg(long, env = "HERALD_BRIDGE_BASE_URL")]
    pub bridge_base_url: Url,

    /// Public URL prefix for proxied feeds; the feed token is appended
    #[arg(long, env = "HERALD_PROXY_BASE_URL")]
    pub proxy_base_url: String,

    /// Secret from which the feed token key is derived
    #[arg(long, env = "HERALD_TOKEN_SECRET")]
    #[debug(ignore)]
    pub token_secret: String,

    /// Token required to read metrics; the endpoint is disabled without it
    #[arg(long, env = "HERALD_METRICS_TOKEN")]
    #[debug(ignore)]
    pub metrics_token: Option<String>,

    /// How long proxied feed responses are cached (default 5 minutes)
    #[arg(long, env = "HERALD_CACHE_TTL_MS")]
    pub cache_ttl_ms: Option<String>,

    /// How long discovered bridge feed URLs are cached (default 6 hours)
    #[arg(long, env = "HERALD_DISCOVERY_CACHE_TTL_MS")]
    pub discovery_cache_ttl_ms: Option<String>,

    /// Total size of cached feed bodies in bytes (default 64 MiB)
    #[arg(long, env = "HERALD_CACHE_MAX_BYTES")]
    pub cache_max_bytes: Option<String>,

    /// Number of discovered feed URLs kept (default 10000)
    #[arg(long, env = "HERALD_DISCOVERY_CACHE_MAX_ENTRIES")]
    pub discovery_cache_max_entries: Option<String>,

    /// Timeout for bridge lookups and candidate checks (default 8 seconds)
    #[arg(long, env = "HERALD_DISCOVERY_TIMEOUT_MS")]
    pub discovery_timeout_ms: Option<String>,

    /// Timeout for upstream feed fetches (default 15 seconds)
    #[arg(long, env = "HERALD_FETCH_TIMEOUT_MS")]
    pub fetch_timeout_ms: Option<String>,

    /// Rate limit window (default 1 minute)
    #[arg(long, env = "HERALD_RATE_LIMIT_WINDOW_MS")]
    pub rate_limit_window_ms: Option<String>,

    /// Proxied fetches allowed per window across all sources (default 300)
    #[arg(long, env = "HERALD_GLOBAL_RATE_LIMIT")]
    pub global_rate_limit: Option<String>,

    /// Proxied fetches allowed per window for a single source (default 30)
    #[arg(long, env = "HERALD_SOURCE_RATE_LIMIT")]
    pub source_rate_limit: Option<String>,

    /// Feed creations allowed per window for a single caller (default 10)
    #[arg(long, env = "HERALD_CREATE_RATE_LIMIT")]
    pub create_rate_limit: Option<String>,

    /// Number of recent events kept for the metrics endpoint (default 200)
    #[arg(long, env = "HERALD_RECENT_EVENTS")]
    pub recent_events: Option<String>,

    /// Preferred Twitter bridges, best first
    #[arg(long, env = "HERALD_TWITTER_BRIDGES", value_delimiter = ',')]
    pub twitter_bridges: Vec<String>,

    /// Preferred Instagram bridges, best first
    #[arg(long, env = "HERALD_INSTAGRAM_BRIDGES", value_delimiter = ',')]
    pub instagram_bridges: Vec<String>,

    /// Origins allowed to call the API from a browser
    #[arg(long, env = "HERALD_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    /// Miniflux-compatible feed reader to subscribe created feeds in
    #[arg(long, env = "HERALD_FEED_READER_URL", requires = "feed_reader_token")]
    pub feed_reader_url: Option<Url>,

    /// API token for the feed reader
    #[arg(long, env = "HERALD_FEED_READER_TOKEN")]
    #[debug(ignore)]
    pub feed_reader_token: Option<String>,

    /// Feed reader category for created feeds
    #[arg(long, env = "HERALD_FEED_READER_CATEGORY")]
    pub feed_reader_category: Option<i64>,
}

impl ServeConfig {
    /// Resolve the runtime settings, applying defaults.
    pub fn settings(&self) -> Result<Settings> {
        if self.token_secret.trim().is_empty() {
            bail!("token secret must not be empty");
        }
        if self.proxy_base_url.trim().is_empty() {
            bail!("proxy base URL must not be empty");
        }

        let ranking = BridgeRanking::default().with_overrides(
            non_empty(&self.twitter_bridges),
            non_empty(&self.instagram_bridges),
        );

        Settings::builder()
            .bridge_base_url(self.bridge_base_url.clone())
            .proxy_base_url(self.proxy_base_url.trim())
            .cache_ttl(millis_or(self.cache_ttl_ms.as_deref(), DEFAULT_CACHE_TTL_MS))
            .discovery_cache_ttl(millis_or(
                self.discovery_cache_ttl_ms.as_deref(),
                DEFAULT_DISCOVERY_CACHE_TTL_MS,
            ))
            .cache_max_bytes(u64::from(count_or(
                self.cache_max_bytes.as_deref(),
                DEFAULT_CACHE_MAX_BYTES,
            )))
            .discovery_cache_max_entries(u64::from(count_or(
                self.discovery_cache_max_entries.as_deref(),
                DEFAULT_DISCOVERY_CACHE_MAX_ENTRIES,
            )))
            .discovery_timeout(millis_or(
                self.discovery_timeout_ms.as_deref(),
                DEFAULT_DISCOVERY_TIMEOUT_MS,
            ))
            .fetch_timeout(millis_or(
                self.fetch_timeout_ms.as_deref(),
                DEFAULT_FETCH_TIMEOUT_MS,
            ))
            .rate_limit_window(millis_or(
                self.rate_limit_window_ms.as_deref(),
                DEFAULT_RATE_LIMIT_WINDOW_MS,
            ))
            .global_rate_limit(count_or(
                self.global_rate_limit.as_deref(),
                DEFAULT_GLOBAL_RATE_LIMIT,
            ))
            .source_rate_limit(count_or(
                self.source_rate_limit.as_deref(),
                DEFAULT_SOURCE_RATE_LIMIT,
            ))
            .create_rate_limit(count_or(
                self.create_rate_limit.as_deref(),
                DEFAULT_CREATE_RATE_LIMIT,
            ))
            .recent_events(count_or(
                self.recent_events.as_deref(),
                DEFAULT_EVENT_CAPACITY as u32,
            ) as usize)
            .ranking(ranking)
            .build()
            .pipe(Ok)
    }
}

/// Resolved runtime settings shared with request handlers.
#[derive(Clone, Debug, Builder)]
pub struct Settings {
    pub bridge_base_url: Url,

    #[builder(into)]
    pub proxy_base_url: String,

    #[builder(default = Duration::from_millis(DEFAULT_CACHE_TTL_MS))]
    pub cache_ttl: Duration,

    #[builder(default = Duration::from_millis(DEFAULT_DISCOVERY_CACHE_TTL_MS))]
    pub discovery_cache_ttl: Duration,

    #[builder(default = u64::from(DEFAULT_CACHE_MAX_BYTES))]
    pub cache_max_bytes: u64,

    #[builder(default = u64::from(DEFAULT_DISCOVERY_CACHE_MAX_ENTRIES))]
    pub discovery_cache_max_entries: u64,

    #[builder(default = Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS))]
    pub discovery_timeout: Duration,

    #[builder(default = Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS))]
    pub fetch_timeout: Duration,

    #[builder(default = Duration::from_millis(DEFAULT_RATE_LIMIT_WINDOW_MS))]
    pub rate_limit_window: Duration,

    #[builder(default = DEFAULT_GLOBAL_RATE_LIMIT)]
    pub global_rate_limit: u32,

    #[builder(default = DEFAULT_SOURCE_RATE_LIMIT)]
    pub source_rate_limit: u32,

    #[builder(default = DEFAULT_CREATE_RATE_LIMIT)]
    pub create_rate_limit: u32,

    #[builder(default = DEFAULT_EVENT_CAPACITY)]
    pub recent_events: usize,

    #[builder(default)]
    pub ranking: BridgeRanking,
}

impl Settings {
    pub fn global_limit(&self) -> RateLimit {
        RateLimit::new(self.global_rate_limit, self.rate_limit_window)
    }

    pub fn source_limit(&self) -> RateLimit {
        RateLimit::new(self.source_rate_limit, self.rate_limit_window)
    }

    pub fn create_limit(&self) -> RateLimit {
        RateLimit::new(self.create_rate_limit, self.rate_limit_window)
    }

    /// The public URL of the proxied feed for `token`.
    pub fn proxy_url(&self, token: &str) -> String {
        let base = &self.proxy_base_url;
        if base.ends_with('/') {
            format!("{base}{token}")
        } else {
            format!("{base}/{token}")
        }
    }
}

/// Parse a positive, finite number; anything else is `None`.
fn positive(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|value| value.is_finite() && *value > 0.0)
}

fn millis_or(raw: Option<&str>, default_ms: u64) -> Duration {
    positive(raw)
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
        .filter(|duration| duration.as_millis() > 0)
        .unwrap_or(Duration::from_millis(default_ms))
}

fn count_or(raw: Option<&str>, default: u32) -> u32 {
    positive(raw)
        .map(|value| value.floor().min(f64::from(u32::MAX)) as u32)
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn non_empty(names: &[String]) -> Option<Vec<String>> {
    let names = names
        .iter()
        .map(|name| name.trim())
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect::<Vec<_>>();
    (!names.is_empty()).then_some(names)
}
