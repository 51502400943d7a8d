use aerosol::axum::Dep;
use axum::{
    Json,
    body::Bytes,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use clients::herald::v1::{CreateSocialFeedResponse, ErrorResponse, Scalar};
use color_eyre::eyre::Report;
use tap::Pipe;
use tracing::{error, info, warn};

use crate::{
    auth::Caller,
    bridge::{Discovery, DiscoveryError},
    config::Settings,
    feed_reader::FeedReader,
    metrics::Recorder,
    rate_limit::{self, RateLimiter},
    social::{self, InvalidInput, RawSocialInput},
    source_key::SourceKey,
    token::{SocialFeedTokenPayload, TokenCodec},
};

/// Create a proxied feed for a social profile.
///
/// Stages run strictly in order, each gating the next: the caller's creation
/// rate limit, input normalization, bridge discovery, token encoding, and
/// finally (when a feed reader is configured) subscribing the proxy URL.
///
/// The body is parsed after the rate limit so that malformed requests still
/// count against the caller.
#[tracing::instrument(skip_all, fields(%caller))]
pub async fn handle(
    Dep(settings): Dep<Settings>,
    Dep(codec): Dep<TokenCodec>,
    Dep(limiter): Dep<RateLimiter>,
    Dep(discovery): Dep<Discovery>,
    Dep(metrics): Dep<Recorder>,
    Dep(feed_reader): Dep<Option<FeedReader>>,
    caller: Caller,
    body: Bytes,
) -> CreateResponse {
    let stage = |stage: &str, outcome: &str| {
        metrics.increment("social.create", &[("stage", stage), ("outcome", outcome)]);
    };

    stage("rate_limit", "attempt");
    let decision = limiter.check(&rate_limit::create_scope(&caller), settings.create_limit());
    if !decision.allowed {
        warn!(retry_after = decision.retry_after_secs, "social.create.rate_limited");
        stage("rate_limit", "error");
        metrics.record(
            "social.create.rate_limited",
            [
                ("caller", Scalar::from(caller.to_string())),
                ("retry_after", Scalar::from(decision.retry_after_secs)),
            ],
        );
        return CreateResponse::RateLimited {
            retry_after: decision.retry_after_secs,
        };
    }
    stage("rate_limit", "success");

    stage("normalize", "attempt");
    let input = match parse_body(&body).and_then(social::normalize) {
        Ok(input) => input,
        Err(err) => {
            info!(reason = %err.reason, "social.create.invalid_input");
            stage("normalize", "error");
            metrics.record(
                "social.create.invalid_input",
                [("reason", Scalar::from(err.reason.as_str()))],
            );
            return CreateResponse::InvalidInput(err);
        }
    };
    stage("normalize", "success");

    let source = SourceKey::from(&input);
    stage("discover", "attempt");
    let bridge_feed_url = match discovery.discover(&input).await {
        Ok(url) => url,
        Err(err) => {
            warn!(%source, error = %err, "social.create.discovery_failed");
            stage("discover", "error");
            metrics.record(
                "social.create.discovery_failed",
                [
                    ("source", Scalar::from(source.as_str())),
                    ("kind", Scalar::from(discovery_kind(&err))),
                    ("error_count", Scalar::from(err.errors().len())),
                    ("errors", Scalar::from(err.errors().join("; "))),
                ],
            );
            return CreateResponse::Discovery(err);
        }
    };
    stage("discover", "success");

    stage("encode", "attempt");
    let payload = SocialFeedTokenPayload {
        platform: input.platform,
        handle: input.handle.clone(),
        bridge_feed_url: bridge_feed_url.to_string(),
        credentials: input.credentials,
    };
    let token = match codec.encode(&payload) {
        Ok(token) => token,
        Err(err) => {
            error!(%source, error = ?err, "social.create.encode_failed");
            stage("encode", "error");
            metrics.record(
                "social.create.encode_failed",
                [("source", Scalar::from(source.as_str()))],
            );
            return CreateResponse::Error(err);
        }
    };
    stage("encode", "success");
    let feed_url = settings.proxy_url(&token);

    let feed_id = match &feed_reader {
        None => None,
        Some(reader) => {
            stage("subscribe", "attempt");
            match reader.subscribe(&feed_url).await {
                Ok(feed_id) => {
                    stage("subscribe", "success");
                    Some(feed_id)
                }
                Err(err) => {
                    error!(%source, error = ?err, "social.create.subscribe_failed");
                    stage("subscribe", "error");
                    metrics.record(
                        "social.create.subscribe_failed",
                        [("source", Scalar::from(source.as_str()))],
                    );
                    return CreateResponse::SubscribeFailed;
                }
            }
        }
    };

    info!(%source, ?feed_id, "social.create.success");
    metrics.record(
        "social.create.success",
        [
            ("source", Scalar::from(source.as_str())),
            ("platform", Scalar::from(input.platform.as_str())),
            ("handle", Scalar::from(input.handle.as_str())),
        ],
    );
    CreateSocialFeedResponse::builder()
        .feed_url(feed_url)
        .source_key(source.as_str())
        .platform(input.platform)
        .handle(input.handle)
        .maybe_feed_id(feed_id)
        .build()
        .pipe(CreateResponse::Created)
}

fn parse_body(body: &[u8]) -> Result<RawSocialInput, InvalidInput> {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .filter(serde_json::Value::is_object)
        .and_then(|value| serde_json::from_value(value).ok())
        .ok_or_else(|| InvalidInput {
            reason: String::from("request body must be a JSON object"),
        })
}

fn discovery_kind(err: &DiscoveryError) -> &'static str {
    match err {
        DiscoveryError::NoBridgeAvailable { .. } => "no_bridge_available",
        DiscoveryError::DiscoveryFailed { .. } => "discovery_failed",
    }
}

#[derive(Debug)]
pub enum CreateResponse {
    Created(CreateSocialFeedResponse),
    InvalidInput(InvalidInput),
    RateLimited { retry_after: u64 },
    Discovery(DiscoveryError),
    SubscribeFailed,
    Error(Report),
}

impl IntoResponse for CreateResponse {
    fn into_response(self) -> Response {
        match self {
            CreateResponse::Created(body) => (StatusCode::CREATED, Json(body)).into_response(),
            CreateResponse::InvalidInput(err) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(err.reason))).into_response()
            }
            CreateResponse::RateLimited { retry_after } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(ErrorResponse::new("too many feed creation requests")),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                response
            }
            // Lookup and verification details stay in the metrics events.
            CreateResponse::Discovery(DiscoveryError::NoBridgeAvailable { .. }) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(
                    "no bridge can produce a feed for this profile",
                )),
            )
                .into_response(),
            CreateResponse::Discovery(DiscoveryError::DiscoveryFailed { .. }) => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new(
                    "could not find a working feed for this profile",
                )),
            )
                .into_response(),
            CreateResponse::SubscribeFailed => (
                StatusCode::BAD_GATEWAY,
                Json(ErrorResponse::new("could not subscribe to the feed")),
            )
                .into_response(),
            CreateResponse::Error(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{error:?}")).into_response()
            }
        }
    }
}
