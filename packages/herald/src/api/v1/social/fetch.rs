use aerosol::axum::Dep;
use axum::{
    Json,
    extract::Path,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use clients::{
    ContentType,
    herald::v1::{CACHE_STATUS_HEADER, ErrorResponse, Scalar},
};
use tracing::{info, warn};
use url::Url;

use crate::{
    bridge::belongs_to_bridge,
    cache::CachedFeed,
    config::Settings,
    metrics::Recorder,
    proxy::{Proxy, UpstreamError},
    rate_limit::{self, PROXY_GLOBAL, RateLimiter},
    source_key::SourceKey,
    token::TokenCodec,
};

/// Serve the social feed sealed in `token`.
///
/// This endpoint is public: feed readers poll it without credentials, so the
/// token is the only thing standing between callers and the upstream. Tokens
/// that fail to decode, or that point anywhere but the configured bridge, are
/// rejected before any other work happens.
///
/// The global rate limit is applied before the per-source one, and both
/// before the cache, so a flood of polls costs at most a map lookup each.
#[tracing::instrument(skip_all)]
pub async fn handle(
    Dep(settings): Dep<Settings>,
    Dep(codec): Dep<TokenCodec>,
    Dep(limiter): Dep<RateLimiter>,
    Dep(proxy): Dep<Proxy>,
    Dep(metrics): Dep<Recorder>,
    Path(token): Path<String>,
) -> FetchResponse {
    let payload = match codec.decode(&token) {
        Ok(payload) => payload,
        Err(err) => {
            info!(reason = err.reason, "social.proxy.invalid_token");
            metrics.increment("social.proxy", &[("outcome", "invalid_token")]);
            metrics.record("social.proxy.invalid_token", [("reason", Scalar::from(err.reason))]);
            return FetchResponse::InvalidToken;
        }
    };

    let source = SourceKey::new(
        payload.platform,
        &payload.handle,
        payload.credentials.as_ref(),
    );
    let upstream = match Url::parse(&payload.bridge_feed_url) {
        Ok(url) if belongs_to_bridge(&settings.bridge_base_url, &url) => url,
        _ => {
            warn!(%source, "social.proxy.invalid_origin");
            metrics.increment("social.proxy", &[("outcome", "invalid_origin")]);
            metrics.record(
                "social.proxy.invalid_origin",
                [("source", Scalar::from(source.as_str()))],
            );
            return FetchResponse::InvalidOrigin;
        }
    };

    let global = limiter.check(PROXY_GLOBAL, settings.global_limit());
    if !global.allowed {
        warn!(%source, retry_after = global.retry_after_secs, "social.proxy.rate_limited_global");
        metrics.increment("social.proxy", &[("outcome", "rate_limited_global")]);
        metrics.record(
            "social.proxy.rate_limited",
            [
                ("scope", Scalar::from("global")),
                ("source", Scalar::from(source.as_str())),
                ("retry_after", Scalar::from(global.retry_after_secs)),
            ],
        );
        return FetchResponse::RateLimited {
            retry_after: global.retry_after_secs,
        };
    }

    let per_source = limiter.check(&rate_limit::source_scope(&source), settings.source_limit());
    if !per_source.allowed {
        warn!(%source, retry_after = per_source.retry_after_secs, "social.proxy.rate_limited_source");
        metrics.increment("social.proxy", &[("outcome", "rate_limited_source")]);
        metrics.record(
            "social.proxy.rate_limited",
            [
                ("scope", Scalar::from("source")),
                ("source", Scalar::from(source.as_str())),
                ("retry_after", Scalar::from(per_source.retry_after_secs)),
            ],
        );
        return FetchResponse::RateLimited {
            retry_after: per_source.retry_after_secs,
        };
    }

    if let Some(entry) = proxy.cached(&source) {
        let age = entry.age_secs();
        info!(%source, age, "social.proxy.cache_hit");
        metrics.increment("social.proxy", &[("outcome", "hit")]);
        return FetchResponse::Feed {
            feed: entry.value,
            cache: CacheStatus::Hit,
            age: Some(age),
        };
    }

    info!(%source, "social.proxy.cache_miss");
    metrics.increment("social.proxy", &[("outcome", "miss")]);
    match proxy.fetch(&source, upstream, payload.credentials).await {
        Ok(feed) => {
            info!(%source, bytes = feed.body.len(), "social.proxy.fetched");
            FetchResponse::Feed {
                feed,
                cache: CacheStatus::Miss,
                age: None,
            }
        }
        Err(err) => {
            warn!(%source, error = %err, "social.proxy.upstream_error");
            metrics.increment("social.proxy", &[("outcome", "upstream_error")]);
            metrics.record(
                "social.proxy.upstream_error",
                [
                    ("source", Scalar::from(source.as_str())),
                    ("status", Scalar::from(err.status_code().as_u16())),
                    ("error", Scalar::from(err.to_string())),
                ],
            );
            FetchResponse::Upstream(err)
        }
    }
}

/// Whether a feed was served from the response cache.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

#[derive(Debug)]
pub enum FetchResponse {
    Feed {
        feed: CachedFeed,
        cache: CacheStatus,

        /// Seconds since the cached copy was fetched.
        age: Option<u64>,
    },
    InvalidToken,
    InvalidOrigin,
    RateLimited {
        retry_after: u64,
    },
    Upstream(UpstreamError),
}

impl IntoResponse for FetchResponse {
    fn into_response(self) -> Response {
        match self {
            FetchResponse::Feed { feed, cache, age } => {
                let content_type = HeaderValue::from_str(&feed.content_type)
                    .unwrap_or_else(|_| ContentType::Xml.value());
                let mut response = (StatusCode::OK, feed.body).into_response();
                let headers = response.headers_mut();
                headers.insert(header::CONTENT_TYPE, content_type);
                headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(cache.as_str()));
                if let Some(age) = age {
                    headers.insert(header::AGE, HeaderValue::from(age));
                }
                response
            }
            FetchResponse::InvalidToken => {
                error_response(StatusCode::BAD_REQUEST, "invalid feed token")
            }
            FetchResponse::InvalidOrigin => {
                error_response(StatusCode::BAD_REQUEST, "feed token points outside the bridge")
            }
            FetchResponse::RateLimited { retry_after } => {
                let mut response =
                    error_response(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            FetchResponse::Upstream(err) => {
                let mut response = error_response(err.status_code(), "upstream feed unavailable");
                if let Some(retry_after) = err
                    .retry_after()
                    .and_then(|value| HeaderValue::from_str(value).ok())
                {
                    response
                        .headers_mut()
                        .insert(header::RETRY_AFTER, retry_after);
                }
                response
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorResponse::new(message))).into_response()
}
