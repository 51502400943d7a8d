//! Discovery of bridge feeds for social profiles.
//!
//! The bridge (an RSS-Bridge compatible service) can usually produce a feed
//! for a profile through several implementations, some of which work better
//! than others and some of which are broken at any given time. Discovery asks
//! the bridge which implementations can handle the profile, ranks them, and
//! tries them in order until one actually serves a feed.
//!
//! ## Lookup
//!
//! Each platform has one or more profile URL forms (Twitter profiles are
//! tried as `x.com` and then `twitter.com`). For each form we call
//! `{bridge}/?action=findfeed&format=Atom&url={profile}`, which responds with
//! a JSON array of `{url, bridgeMeta?: {name?}}`. The first form that yields
//! at least one usable candidate wins.
//!
//! Candidate URLs must point back at the configured bridge; anything else is
//! discarded so that a misbehaving bridge can't turn the proxy into an open
//! relay.
//!
//! ## Caching and coalescing
//!
//! Successful discoveries are cached per source key for the discovery cache
//! TTL, and concurrent discoveries for the same source share a single run.

use std::{sync::Arc, time::Duration};

use clients::{ContentType, herald::v1::Platform};
use derive_more::{Debug, Display, Error};
use reqwest::{StatusCode, header};
use serde::Deserialize;
use tokio::task::JoinError;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    cache::TtlCache,
    coalesce::Coalescer,
    config::Settings,
    metrics::Recorder,
    social::{Credentials, NormalizedSocialInput},
    source_key::SourceKey,
};

/// Marker the bridge uses when no implementation can handle a URL.
const NO_BRIDGE_FOUND: &str = "no bridge found";

/// Preferred bridge implementations per platform, best first.
///
/// Implementations not listed are tried after all listed ones, in the order
/// the bridge returned them.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct BridgeRanking {
    twitter: Vec<String>,
    instagram: Vec<String>,
}

impl Default for BridgeRanking {
    fn default() -> Self {
        Self::new(
            [
                "TwitterV2Bridge",
                "TwitterBridge",
                "NitterBridge",
                "FarsideNitterBridge",
            ],
            ["InstagramBridge", "PicukiBridge"],
        )
    }
}

impl BridgeRanking {
    pub fn new(
        twitter: impl IntoIterator<Item = impl Into<String>>,
        instagram: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            twitter: twitter.into_iter().map(Into::into).collect(),
            instagram: instagram.into_iter().map(Into::into).collect(),
        }
    }

    /// Replace the order for the platforms given.
    pub fn with_overrides(
        mut self,
        twitter: Option<Vec<String>>,
        instagram: Option<Vec<String>>,
    ) -> Self {
        if let Some(twitter) = twitter {
            self.twitter = twitter;
        }
        if let Some(instagram) = instagram {
            self.instagram = instagram;
        }
        self
    }

    pub fn order(&self, platform: Platform) -> &[String] {
        match platform {
            Platform::Twitter => &self.twitter,
            Platform::Instagram => &self.instagram,
        }
    }

    /// Position of the implementation in the ranking; unranked sorts last.
    pub fn rank(&self, platform: Platform, bridge: Option<&str>) -> usize {
        bridge
            .and_then(|bridge| {
                self.order(platform)
                    .iter()
                    .position(|ranked| ranked.eq_ignore_ascii_case(bridge))
            })
            .unwrap_or(usize::MAX)
    }
}

/// Discovery found no working feed.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
pub enum DiscoveryError {
    /// The bridge has no implementation that handles the profile.
    #[display("no bridge available: {}", errors.join("; "))]
    NoBridgeAvailable { errors: Vec<String> },

    /// Candidates may exist but none could be reached or validated.
    #[display("discovery failed: {}", errors.join("; "))]
    DiscoveryFailed { errors: Vec<String> },
}

impl DiscoveryError {
    pub fn errors(&self) -> &[String] {
        match self {
            DiscoveryError::NoBridgeAvailable { errors } => errors,
            DiscoveryError::DiscoveryFailed { errors } => errors,
        }
    }
}

impl From<JoinError> for DiscoveryError {
    fn from(err: JoinError) -> Self {
        DiscoveryError::DiscoveryFailed {
            errors: vec![format!("discovery task failed: {err}")],
        }
    }
}

/// One entry of a `findfeed` response.
#[derive(Clone, Debug, Deserialize)]
struct FoundFeed {
    url: String,

    #[serde(default, rename = "bridgeMeta")]
    bridge_meta: Option<BridgeMeta>,
}

#[derive(Clone, Debug, Deserialize)]
struct BridgeMeta {
    #[serde(default)]
    name: Option<String>,
}

/// A validated feed URL offered by the bridge.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Candidate {
    pub url: Url,

    /// The implementation serving the feed, if known.
    pub bridge: Option<String>,
}

#[derive(Debug)]
enum LookupError {
    NoHandler(String),
    Failed(String),
}

/// Finds working bridge feeds for social profiles.
///
/// Cheaply cloneable; clones share caches.
#[derive(Clone, Debug)]
pub struct Discovery {
    #[debug(skip)]
    http: reqwest::Client,

    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    ranking: Arc<BridgeRanking>,
    cache: TtlCache<Url>,
    timeout: Duration,
    coalescer: Coalescer<Url, DiscoveryError>,
    metrics: Recorder,
}

impl Discovery {
    pub fn new(http: reqwest::Client, settings: &Settings, metrics: Recorder) -> Self {
        Self {
            http,
            base: Arc::new(settings.bridge_base_url.clone()),
            ranking: Arc::new(settings.ranking.clone()),
            cache: TtlCache::new(
                settings.discovery_cache_max_entries,
                settings.discovery_cache_ttl,
            ),
            timeout: settings.discovery_timeout,
            coalescer: Coalescer::new(),
            metrics,
        }
    }

    /// The configured bridge base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Find a working feed URL for the profile.
    #[instrument(skip_all, fields(platform = %input.platform, handle = %input.handle))]
    pub async fn discover(&self, input: &NormalizedSocialInput) -> Result<Url, DiscoveryError> {
        let key = SourceKey::from(input);
        if let Some(entry) = self.cache.get(key.as_str()) {
            info!(source = %key, "bridge.discovery.cache_hit");
            self.metrics
                .increment("bridge.discovery.cache", &[("result", "hit")]);
            return Ok(entry.value);
        }
        self.metrics
            .increment("bridge.discovery.cache", &[("result", "miss")]);

        let this = self.clone();
        let input = input.clone();
        let source = key.clone();
        self.coalescer
            .coalesce(key.as_str(), move || this.discover_uncached(input, source))
            .await
    }

    async fn discover_uncached(
        self,
        input: NormalizedSocialInput,
        key: SourceKey,
    ) -> Result<Url, DiscoveryError> {
        let credentials = input.credentials.as_ref();
        let mut errors = Vec::new();
        let mut lookups = 0;
        let mut no_handler = 0;
        let mut candidates = Vec::new();

        for profile in profile_urls(input.platform, &input.handle) {
            lookups += 1;
            match self.lookup(&profile, credentials).await {
                Ok(found) => {
                    self.metrics
                        .increment("bridge.lookup", &[("outcome", "found")]);
                    for feed in found {
                        match self.candidate(feed) {
                            Ok(candidate) => candidates.push(candidate),
                            Err(error) => errors.push(error),
                        }
                    }
                    if !candidates.is_empty() {
                        break;
                    }
                }
                Err(LookupError::NoHandler(error)) => {
                    self.metrics
                        .increment("bridge.lookup", &[("outcome", "no_handler")]);
                    no_handler += 1;
                    errors.push(error);
                }
                Err(LookupError::Failed(error)) => {
                    self.metrics
                        .increment("bridge.lookup", &[("outcome", "error")]);
                    errors.push(error);
                }
            }
        }

        if candidates.is_empty() {
            let error = if no_handler == lookups {
                DiscoveryError::NoBridgeAvailable { errors }
            } else {
                DiscoveryError::DiscoveryFailed { errors }
            };
            warn!(source = %key, %error, "bridge.discovery.no_candidates");
            return Err(error);
        }

        candidates.sort_by_key(|candidate| {
            self.ranking
                .rank(input.platform, candidate.bridge.as_deref())
        });
        debug!(
            source = %key,
            candidates = ?candidates.iter().map(|c| c.bridge.as_deref()).collect::<Vec<_>>(),
            "bridge.discovery.ranked"
        );

        for candidate in candidates {
            match self.verify(&candidate, credentials).await {
                Ok(()) => {
                    self.metrics.increment("bridge.verify", &[("outcome", "ok")]);
                    info!(source = %key, bridge = ?candidate.bridge, "bridge.discovery.success");
                    self.cache.set(key.as_str(), candidate.url.clone());
                    return Ok(candidate.url);
                }
                Err(error) => {
                    self.metrics
                        .increment("bridge.verify", &[("outcome", "error")]);
                    debug!(source = %key, %error, "bridge.verify.error");
                    errors.push(error);
                }
            }
        }

        let error = DiscoveryError::DiscoveryFailed { errors };
        warn!(source = %key, %error, "bridge.discovery.failed");
        Err(error)
    }

    async fn lookup(
        &self,
        profile: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<FoundFeed>, LookupError> {
        let url = lookup_url(&self.base, profile);
        let request = self
            .http
            .get(url)
            .timeout(self.timeout)
            .header(header::ACCEPT, ContentType::Json.value());
        let response = with_credentials(request, credentials)
            .send()
            .await
            .map_err(|err| LookupError::Failed(format!("lookup {profile}: {}", describe(err))))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| LookupError::Failed(format!("lookup {profile}: {}", describe(err))))?;
        let no_handler = body.to_ascii_lowercase().contains(NO_BRIDGE_FOUND);

        if status == StatusCode::NOT_FOUND || (!status.is_success() && no_handler) {
            return Err(LookupError::NoHandler(format!(
                "lookup {profile}: no bridge found"
            )));
        }
        if !status.is_success() {
            return Err(LookupError::Failed(format!(
                "lookup {profile}: status {status}"
            )));
        }

        let found = match serde_json::from_str::<Vec<FoundFeed>>(&body) {
            Ok(found) => found,
            Err(_) if no_handler => {
                return Err(LookupError::NoHandler(format!(
                    "lookup {profile}: no bridge found"
                )));
            }
            Err(err) => {
                return Err(LookupError::Failed(format!(
                    "lookup {profile}: unparseable response: {err}"
                )));
            }
        };
        if found.is_empty() {
            return Err(LookupError::Failed(format!(
                "lookup {profile}: no feeds returned"
            )));
        }
        Ok(found)
    }

    fn candidate(&self, feed: FoundFeed) -> Result<Candidate, String> {
        let url = Url::parse(&feed.url).map_err(|err| format!("candidate {}: {err}", feed.url))?;
        if !belongs_to_bridge(&self.base, &url) {
            return Err(format!("candidate {url}: not on the configured bridge"));
        }
        let bridge = url
            .query_pairs()
            .find(|(name, _)| name == "bridge")
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
            .or_else(|| feed.bridge_meta.and_then(|meta| meta.name));
        Ok(Candidate { url, bridge })
    }

    async fn verify(
        &self,
        candidate: &Candidate,
        credentials: Option<&Credentials>,
    ) -> Result<(), String> {
        let name = candidate.bridge.as_deref().unwrap_or("unknown bridge");
        let request = self
            .http
            .get(candidate.url.clone())
            .timeout(self.timeout)
            .header(header::ACCEPT, ContentType::FEED_ACCEPT);
        let response = with_credentials(request, credentials)
            .send()
            .await
            .map_err(|err| format!("verify {name}: {}", describe(err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("verify {name}: status {status}"));
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !ContentType::is_feed(content_type) {
            return Err(format!("verify {name}: unexpected content type {content_type:?}"));
        }
        Ok(())
    }
}

/// Profile URLs to look up, in order of preference.
pub fn profile_urls(platform: Platform, handle: &str) -> Vec<String> {
    match platform {
        Platform::Instagram => vec![format!("https://www.instagram.com/{handle}/")],
        Platform::Twitter => vec![
            format!("https://x.com/{handle}"),
            format!("https://twitter.com/{handle}"),
        ],
    }
}

/// The `findfeed` URL for a profile.
pub fn lookup_url(base: &Url, profile: &str) -> Url {
    let mut url = base.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    url.query_pairs_mut()
        .append_pair("action", "findfeed")
        .append_pair("format", "Atom")
        .append_pair("url", profile);
    url
}

/// Whether `candidate` is served by the bridge at `base`: same scheme, host
/// and port, under the base path.
pub fn belongs_to_bridge(base: &Url, candidate: &Url) -> bool {
    if candidate.scheme() != base.scheme()
        || candidate.host_str() != base.host_str()
        || candidate.port_or_known_default() != base.port_or_known_default()
    {
        return false;
    }

    let prefix = base.path().trim_end_matches('/');
    let path = candidate.path();
    path == prefix || path.starts_with(&format!("{prefix}/"))
}

fn with_credentials(
    request: reqwest::RequestBuilder,
    credentials: Option<&Credentials>,
) -> reqwest::RequestBuilder {
    match credentials {
        Some(Credentials { username, password }) => request.basic_auth(username, Some(password)),
        None => request,
    }
}

fn describe(err: reqwest::Error) -> String {
    if err.is_timeout() {
        String::from("timed out")
    } else {
        err.without_url().to_string()
    }
}
