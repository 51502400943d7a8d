//! HTTP client for the Herald v1 API.

use std::sync::Arc;

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use reqwest::{Response, StatusCode, header};
use tracing::instrument;
use url::Url;

use super::{
    CACHE_STATUS_HEADER, CreateSocialFeedRequest, CreateSocialFeedResponse, ErrorResponse,
    METRICS_TOKEN_HEADER, MetricsSnapshot, USER_ID_HEADER,
};
use crate::Token;

/// Client for the Herald API.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{base}")]
pub struct Client {
    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    #[debug(skip)]
    http: reqwest::Client,

    token: Option<Token>,
    user: Option<String>,
}

impl Client {
    /// Create a new anonymous client with the given base URL.
    pub fn new(base: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .build()
            .context("build http client")?;

        Ok(Self {
            base: Arc::new(base),
            http,
            token: None,
            user: None,
        })
    }

    /// Authenticate requests with the given bearer token.
    pub fn with_token(mut self, token: impl Into<Token>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Identify requests as coming from the given user, as an authenticating
    /// reverse proxy would.
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// The base URL of the service.
    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Check that the service is reachable.
    #[instrument(skip(self))]
    pub async fn ping(&self) -> Result<()> {
        let url = self.base.join("api/v1/health")?;
        let response = self.http.get(url).send().await.context("request")?;
        match response.status() {
            StatusCode::OK => Ok(()),
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Create a proxied feed for a social profile.
    ///
    /// Rejections by the service (invalid input, rate limits, discovery
    /// failures) are returned as [`CreateSocialFeedOutcome::Rejected`]; only
    /// transport failures and unexpected responses are errors.
    #[instrument(skip(self))]
    pub async fn create_social_feed(
        &self,
        body: &CreateSocialFeedRequest,
    ) -> Result<CreateSocialFeedOutcome> {
        let url = self.base.join("api/v1/social/feeds")?;
        let mut request = self.http.post(url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }
        if let Some(user) = &self.user {
            request = request.header(USER_ID_HEADER, user);
        }
        let response = request.send().await.context("send")?;

        match response.status() {
            StatusCode::CREATED => response
                .json::<CreateSocialFeedResponse>()
                .await
                .context("parse JSON response")
                .map(CreateSocialFeedOutcome::Created),
            status if status.is_client_error() || status.is_server_error() => {
                let retry_after = retry_after(&response);
                let error = response
                    .json::<ErrorResponse>()
                    .await
                    .context("parse error response")?;
                Ok(CreateSocialFeedOutcome::Rejected {
                    status: status.as_u16(),
                    retry_after,
                    error,
                })
            }
            status => Err(unexpected_status(status, response).await),
        }
    }

    /// Fetch a proxied feed by its full URL, as a feed reader would.
    ///
    /// Any status is returned as-is so that callers can inspect cache and
    /// rate-limit headers.
    #[instrument(skip(self))]
    pub async fn fetch_feed(&self, feed_url: &str) -> Result<FetchedFeed> {
        let url = Url::parse(feed_url).context("parse feed URL")?;
        let response = self.http.get(url).send().await.context("send")?;
        FetchedFeed::read(response).await
    }

    /// Fetch a proxied feed by its token.
    #[instrument(skip_all)]
    pub async fn fetch_feed_token(&self, token: &str) -> Result<FetchedFeed> {
        let url = self.base.join(&format!("api/v1/social/feed/{token}"))?;
        let response = self.http.get(url).send().await.context("send")?;
        FetchedFeed::read(response).await
    }

    /// Read the metrics snapshot.
    ///
    /// Returns `None` when the service has no metrics token configured.
    #[instrument(skip_all)]
    pub async fn metrics(&self, token: &Token) -> Result<Option<MetricsSnapshot>> {
        let url = self.base.join("api/v1/social/metrics")?;
        let response = self
            .http
            .get(url)
            .header(METRICS_TOKEN_HEADER, token.expose())
            .send()
            .await
            .context("send")?;

        match response.status() {
            StatusCode::OK => response
                .json::<MetricsSnapshot>()
                .await
                .context("parse JSON response")
                .map(Some),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(unexpected_status(status, response).await),
        }
    }
}

/// The result of [`Client::create_social_feed`].
#[derive(Clone, Debug)]
pub enum CreateSocialFeedOutcome {
    Created(CreateSocialFeedResponse),
    Rejected {
        status: u16,
        retry_after: Option<u64>,
        error: ErrorResponse,
    },
}

impl CreateSocialFeedOutcome {
    /// Unwrap the created feed, turning a rejection into an error.
    pub fn created(self) -> Result<CreateSocialFeedResponse> {
        match self {
            CreateSocialFeedOutcome::Created(feed) => Ok(feed),
            CreateSocialFeedOutcome::Rejected { status, error, .. } => {
                Err(eyre!("feed creation rejected: {status}"))
                    .with_section(|| error.error.header("Error:"))
            }
        }
    }
}

/// A proxied feed response.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct FetchedFeed {
    pub status: u16,
    pub content_type: Option<String>,

    /// `HIT` or `MISS` when the feed was served.
    pub cache: Option<String>,

    /// Seconds since the cached copy was fetched.
    pub age: Option<u64>,

    pub retry_after: Option<u64>,

    #[debug("{} bytes", body.len())]
    pub body: String,
}

impl FetchedFeed {
    async fn read(response: Response) -> Result<Self> {
        let status = response.status().as_u16();
        let content_type = header_str(&response, header::CONTENT_TYPE.as_str());
        let cache = header_str(&response, CACHE_STATUS_HEADER);
        let age = header_str(&response, header::AGE.as_str()).and_then(|v| v.parse().ok());
        let retry_after = retry_after(&response);
        let body = response.text().await.context("read body")?;
        Ok(Self {
            status,
            content_type,
            cache,
            age,
            retry_after,
            body,
        })
    }
}

async fn unexpected_status(status: StatusCode, response: Response) -> color_eyre::Report {
    let url = response.url().to_string();
    let request_id = request_id(&response);
    let body = response.text().await.unwrap_or_default();
    eyre!("unexpected status code: {status}")
        .with_section(|| url.header("Url:"))
        .with_section(|| body.header("Body:"))
        .with_section(|| request_id.header("Request ID:"))
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn retry_after(response: &Response) -> Option<u64> {
    header_str(response, header::RETRY_AFTER.as_str()).and_then(|v| v.parse().ok())
}

fn request_id(response: &Response) -> String {
    header_str(response, "x-request-id").unwrap_or_else(|| String::from("<not set>"))
}
