//! Subscribing proxied feeds in the feed reader.
//!
//! The reader is a Miniflux-compatible service: feeds are created with
//! `POST /v1/feeds` authenticated by an `X-Auth-Token` header.

use std::sync::Arc;

use clients::Token;
use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use url::Url;

const AUTH_HEADER: &str = "x-auth-token";

#[derive(Serialize)]
struct CreateFeed<'a> {
    feed_url: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    category_id: Option<i64>,
}

#[derive(Deserialize)]
struct CreatedFeed {
    feed_id: i64,
}

/// Client for the feed reader's feed API.
#[derive(Clone, Debug)]
pub struct FeedReader {
    #[debug(skip)]
    http: reqwest::Client,

    #[debug("{:?}", base.as_str())]
    base: Arc<Url>,

    token: Token,
    category: Option<i64>,
}

impl FeedReader {
    pub fn new(
        http: reqwest::Client,
        mut base: Url,
        token: impl Into<Token>,
        category: Option<i64>,
    ) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            http,
            base: Arc::new(base),
            token: token.into(),
            category,
        }
    }

    /// Subscribe to `feed_url`, returning the reader's feed ID.
    #[instrument(skip_all)]
    pub async fn subscribe(&self, feed_url: &str) -> Result<i64> {
        let url = self.base.join("v1/feeds").context("build feeds url")?;
        let response = self
            .http
            .post(url.clone())
            .header(AUTH_HEADER, self.token.expose())
            .json(&CreateFeed {
                feed_url,
                category_id: self.category,
            })
            .send()
            .await
            .with_context(|| format!("send request to {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!("feed reader responded with {status}")
                .section(url.to_string().header("Url:"))
                .section(body.header("Body:")));
        }

        let created = response
            .json::<CreatedFeed>()
            .await
            .context("parse feed reader response")?;
        info!(feed_id = created.feed_id, "feed_reader.subscribe.success");
        Ok(created.feed_id)
    }
}
