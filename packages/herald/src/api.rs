//! API endpoint handlers for the service.
//!
//! ## Dependency injection
//!
//! We use [`aerosol`][^1] to manage dependencies and inject them into handlers.
//! Reference [`State`] for the list of dependencies; note that when providing
//! dependencies that are in this required list you need to provide them in
//! reverse order of the list. [`state`] does this for you.
//!
//! Items that are in the list can be extracted in handlers using the
//! [`Dep`](aerosol::axum::Dep) extractor.
//!
//! [^1]: https://docs.rs/aerosol
//!
//! ## Response types
//!
//! Handlers return a response type that implements
//! [`IntoResponse`](axum::response::IntoResponse)[^2] instead of a generic
//! response, which documents every outcome of the endpoint in one place and
//! makes backwards-incompatible changes to the API easier to spot.
//!
//! [^2]: https://docs.rs/axum/latest/axum/response/trait.IntoResponse.html

use std::time::{Duration, Instant};

use aerosol::Aero;
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use color_eyre::{Result, eyre::Context};
use tap::Pipe;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    timeout::TimeoutLayer,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    auth::MetricsGate, bridge::Discovery, config::Settings, feed_reader::FeedReader,
    metrics::Recorder, proxy::Proxy, rate_limit::RateLimiter, token::TokenCodec,
};

pub mod v1;

/// Feed creation may run several bridge lookups and candidate checks back to back,
/// each bounded by the discovery timeout; this only guards against requests
/// that hang outright.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Request bodies are small JSON documents.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// User agent for requests to the bridge and the feed reader.
const USER_AGENT: &str = concat!("herald/", env!("CARGO_PKG_VERSION"));

pub type State = Aero![
    Settings,
    TokenCodec,
    RateLimiter,
    Proxy,
    Discovery,
    Recorder,
    MetricsGate,
    Option<FeedReader>,
];

/// The HTTP client used for outbound requests.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("build http client")
}

/// Assemble the handler dependencies for the given settings.
pub fn state(
    settings: Settings,
    codec: TokenCodec,
    gate: MetricsGate,
    feed_reader: Option<FeedReader>,
) -> Result<State> {
    let http = http_client()?;
    let metrics = Recorder::new(settings.recent_events);
    let discovery = Discovery::new(http.clone(), &settings, metrics.clone());
    let proxy = Proxy::new(http, &settings);
    let limiter = RateLimiter::new();

    Aero::new()
        .with(feed_reader)
        .with(gate)
        .with(metrics)
        .with(discovery)
        .with(proxy)
        .with(limiter)
        .with(codec)
        .with(settings)
        .pipe(Ok)
}

pub fn router(state: State, allowed_origins: Vec<HeaderValue>) -> Router {
    let middleware = ServiceBuilder::new()
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            REQUEST_TIMEOUT,
        ));

    // Feed fetches are made by the feed reader's server, not browsers; only
    // the reader's own frontend needs cross-origin access.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::HEAD, Method::POST])
        .allow_headers(Any);

    Router::new()
        .nest("/api/v1", v1::router())
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(middleware)
        .layer(cors)
        .layer(axum::middleware::from_fn(trace_request))
        .with_state(state)
}

async fn trace_request(request: Request, next: Next) -> Response {
    const REQUEST_ID_HEADER: &str = "x-request-id";
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|id| id.to_str().map(|id| id.to_string()).ok())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let start = Instant::now();
    // Feed URLs carry tokens; log the route shape rather than the token.
    let path = redact_path(request.uri().path());
    let method = request.method().to_string();

    let span = tracing::info_span!("http.request", %id, %path, %method);
    async move {
        let mut response = next.run(request).await;
        let status = response.status();
        let duration = start.elapsed();
        tracing::info!(%id, %path, %method, %status, ?duration, "http.request.response");

        if let Ok(id) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        response
    }
    .instrument(span)
    .await
}

fn redact_path(path: &str) -> String {
    const FEED_PREFIX: &str = "/api/v1/social/feed/";
    match path.strip_prefix(FEED_PREFIX) {
        Some(token) if !token.is_empty() => format!("{FEED_PREFIX}{{token}}"),
        _ => path.to_string(),
    }
}
