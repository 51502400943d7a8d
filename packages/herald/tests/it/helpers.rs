//! Global test helpers for Herald integration tests.
//!
//! This module provides a fake bridge to stand in for the upstream feed
//! bridge, and a fixture that spawns a Herald server pointed at it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use clients::{ContentType, Herald, Token};
use color_eyre::{Result, eyre::Context};
use herald::{
    api, auth::MetricsGate, config::Settings, feed_reader::FeedReader, token::TokenCodec,
};
use serde_json::{Value, json};
use tap::Pipe;
use url::Url;

pub const TOKEN_SECRET: &str = "integration-token-secret";
pub const METRICS_TOKEN: &str = "integration-metrics-token";

pub const ATOM: &str = ContentType::Atom.to_str();

/// How the fake bridge answers a `findfeed` lookup.
#[derive(Clone, Debug)]
pub enum Lookup {
    /// Offer feeds for the named bridge implementations, served by the fake.
    Bridges(Vec<&'static str>),

    /// Answer with the given JSON body verbatim.
    Raw(Value),

    /// The bridge has no implementation for the URL.
    NoBridge,

    /// Fail with the given status.
    Status(u16),
}

/// How the fake bridge serves a feed.
#[derive(Clone, Debug)]
pub struct FeedReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
    pub delay: Duration,
    pub retry_after: Option<&'static str>,
}

impl FeedReply {
    pub fn atom(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: ATOM,
            body: body.into(),
            delay: Duration::ZERO,
            retry_after: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: String::from("nope"),
            delay: Duration::ZERO,
            retry_after: None,
        }
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }

    pub fn with_content_type(self, content_type: &'static str) -> Self {
        Self {
            content_type,
            ..self
        }
    }

    pub fn with_retry_after(self, retry_after: &'static str) -> Self {
        Self {
            retry_after: Some(retry_after),
            ..self
        }
    }
}

#[derive(Default)]
struct FakeState {
    base: Mutex<Option<Url>>,
    lookups: Mutex<HashMap<String, Lookup>>,
    feeds: Mutex<HashMap<String, FeedReply>>,
    lookup_calls: Mutex<Vec<String>>,
    feed_calls: Mutex<Vec<String>>,
    authorizations: Mutex<Vec<Option<String>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An in-process stand-in for the feed bridge.
///
/// Lookups answer from the table configured with [`FakeBridge::lookup`];
/// feeds are served at `?action=display&bridge={name}` from the table
/// configured with [`FakeBridge::feed`]. Every request is recorded.
#[derive(Clone)]
pub struct FakeBridge {
    pub base: Url,
    state: Arc<FakeState>,
}

impl FakeBridge {
    pub async fn spawn() -> Result<Self> {
        let state = Arc::new(FakeState::default());
        let router = Router::new()
            .route("/", get(serve))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind fake bridge")?;
        let local_addr = listener.local_addr().context("get local addr")?;
        let base = Url::parse(&format!("http://{local_addr}/")).context("parse base URL")?;
        *lock(&state.base) = Some(base.clone());

        tokio::task::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("fake bridge failed");
        });

        Ok(Self { base, state })
    }

    pub fn lookup(&self, profile: &str, reply: Lookup) {
        lock(&self.state.lookups).insert(profile.to_string(), reply);
    }

    pub fn feed(&self, bridge: &str, reply: FeedReply) {
        lock(&self.state.feeds).insert(bridge.to_string(), reply);
    }

    /// The URL at which the fake serves the named bridge's feed.
    pub fn feed_url(&self, bridge: &str) -> String {
        feed_url(&self.base, bridge)
    }

    /// Profile URLs looked up so far, in order.
    pub fn lookup_calls(&self) -> Vec<String> {
        lock(&self.state.lookup_calls).clone()
    }

    /// Bridge names whose feeds were requested so far, in order.
    pub fn feed_calls(&self) -> Vec<String> {
        lock(&self.state.feed_calls).clone()
    }

    /// The `Authorization` header of every request so far.
    pub fn authorizations(&self) -> Vec<Option<String>> {
        lock(&self.state.authorizations).clone()
    }
}

fn feed_url(base: &Url, bridge: &str) -> String {
    format!("{base}?action=display&bridge={bridge}&format=Atom")
}

async fn serve(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    lock(&state.authorizations).push(authorization);

    match query.get("action").map(String::as_str) {
        Some("findfeed") => {
            let profile = query.get("url").cloned().unwrap_or_default();
            lock(&state.lookup_calls).push(profile.clone());
            let reply = lock(&state.lookups).get(&profile).cloned();
            let base = lock(&state.base).clone().expect("fake bridge base");
            match reply.unwrap_or(Lookup::NoBridge) {
                Lookup::Bridges(names) => names
                    .into_iter()
                    .map(|name| json!({"url": feed_url(&base, name), "bridgeMeta": {"name": name}}))
                    .collect::<Vec<_>>()
                    .pipe(Json)
                    .into_response(),
                Lookup::Raw(body) => Json(body).into_response(),
                Lookup::NoBridge => (StatusCode::NOT_FOUND, "No bridge found for given URL")
                    .into_response(),
                Lookup::Status(status) => status_code(status).into_response(),
            }
        }
        Some("display") => {
            let bridge = query.get("bridge").cloned().unwrap_or_default();
            lock(&state.feed_calls).push(bridge.clone());
            let reply = lock(&state.feeds)
                .get(&bridge)
                .cloned()
                .unwrap_or_else(|| FeedReply::status(404));
            tokio::time::sleep(reply.delay).await;

            let mut response = (status_code(reply.status), reply.body).into_response();
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(reply.content_type),
            );
            if let Some(retry_after) = reply.retry_after {
                headers.insert(header::RETRY_AFTER, HeaderValue::from_static(retry_after));
            }
            response
        }
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

fn status_code(status: u16) -> StatusCode {
    StatusCode::from_u16(status).expect("valid status code")
}

/// Test fixture containing a spawned Herald server and its fake bridge.
pub struct TestFixture {
    /// Base URL of the server.
    pub base_url: Url,

    /// An anonymous client.
    pub client: Herald,

    pub bridge: FakeBridge,

    pub metrics_token: Token,

    /// A codec using the server's secret, for minting tokens directly.
    pub codec: TokenCodec,
}

impl TestFixture {
    /// Spawn a server with default settings.
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(|settings| settings).await
    }

    /// Spawn a server, adjusting its settings first.
    pub async fn spawn_with(configure: impl FnOnce(Settings) -> Settings) -> Result<Self> {
        Self::spawn_with_reader(configure, None).await
    }

    /// Spawn a server that subscribes created feeds in `feed_reader`.
    pub async fn spawn_with_reader(
        configure: impl FnOnce(Settings) -> Settings,
        feed_reader: Option<FeedReader>,
    ) -> Result<Self> {
        let bridge = FakeBridge::spawn().await?;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("bind test server")?;
        let local_addr = listener.local_addr().context("get local addr")?;
        let base_url = Url::parse(&format!("http://{local_addr}/")).context("parse base URL")?;

        let settings = Settings::builder()
            .bridge_base_url(bridge.base.clone())
            .proxy_base_url(format!("{base_url}api/v1/social/feed/"))
            .discovery_timeout(Duration::from_secs(2))
            .fetch_timeout(Duration::from_secs(2))
            .build()
            .pipe(configure);
        let codec = TokenCodec::new(TOKEN_SECRET).context("create codec")?;
        let state = api::state(
            settings,
            codec.clone(),
            MetricsGate::new(Some(METRICS_TOKEN)),
            feed_reader,
        )?;
        // Tests don't need CORS (not browser-based).
        let router = api::router(state, vec![]);

        // TODO: This leaves the server running after the test, which isn't the
        // end of the world (it's shut down when the process ends) but isn't
        // ideal.
        tokio::task::spawn(async move {
            axum::serve(listener, router)
                .await
                .expect("test server failed");
        });

        let client = Herald::new(base_url.clone())?;
        Ok(Self {
            base_url,
            client,
            bridge,
            metrics_token: Token::from(METRICS_TOKEN),
            codec,
        })
    }

    /// A client identifying as `user`.
    pub fn client_for(&self, user: &str) -> Herald {
        self.client.clone().with_user(user)
    }
}
