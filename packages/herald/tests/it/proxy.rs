use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use clients::herald::v1::Platform;
use color_eyre::Result;
use herald::{
    api,
    config::Settings,
    proxy::{MAX_FEED_SIZE, Proxy},
    social::Credentials,
    source_key::SourceKey,
    token::SocialFeedTokenPayload,
};
use pretty_assertions::assert_eq as pretty_assert_eq;
use url::Url;

use crate::{ATOM, FakeBridge, FeedReply, TestFixture};

const FEED: &str = r#"<?xml version="1.0"?><feed xmlns="http://www.w3.org/2005/Atom"><title>jack</title></feed>"#;

fn token(fixture: &TestFixture, handle: &str, bridge: &str) -> Result<String> {
    token_with(fixture, handle, fixture.bridge.feed_url(bridge), None)
}

fn token_with(
    fixture: &TestFixture,
    handle: &str,
    bridge_feed_url: String,
    credentials: Option<Credentials>,
) -> Result<String> {
    fixture.codec.encode(&SocialFeedTokenPayload {
        platform: Platform::Twitter,
        handle: handle.to_string(),
        bridge_feed_url,
        credentials,
    })
}

#[test_log::test(tokio::test)]
async fn serves_then_caches() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::atom(FEED));
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    let first = fixture.client.fetch_feed_token(&token).await?;
    pretty_assert_eq!(first.status, 200);
    pretty_assert_eq!(first.body, FEED);
    pretty_assert_eq!(first.content_type.as_deref(), Some(ATOM));
    pretty_assert_eq!(first.cache.as_deref(), Some("MISS"));
    pretty_assert_eq!(first.age, None);

    let second = fixture.client.fetch_feed_token(&token).await?;
    pretty_assert_eq!(second.status, 200);
    pretty_assert_eq!(second.body, FEED);
    pretty_assert_eq!(second.cache.as_deref(), Some("HIT"));
    assert!(second.age.is_some());

    pretty_assert_eq!(fixture.bridge.feed_calls().len(), 1);

    let metrics = fixture
        .client
        .metrics(&fixture.metrics_token)
        .await?
        .expect("metrics enabled");
    pretty_assert_eq!(metrics.counter("social.proxy{outcome=miss}"), 1);
    pretty_assert_eq!(metrics.counter("social.proxy{outcome=hit}"), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn refetches_after_expiry() -> Result<()> {
    let fixture = TestFixture::spawn_with(|settings| Settings {
        cache_ttl: Duration::from_millis(200),
        ..settings
    })
    .await?;
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::atom(FEED));
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    fixture.client.fetch_feed_token(&token).await?;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let again = fixture.client.fetch_feed_token(&token).await?;

    pretty_assert_eq!(again.cache.as_deref(), Some("MISS"));
    pretty_assert_eq!(fixture.bridge.feed_calls().len(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn concurrent_fetches_share_one_upstream_call() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture.bridge.feed(
        "TwitterV2Bridge",
        FeedReply::atom(FEED).with_delay(Duration::from_millis(500)),
    );
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    let (first, second) = tokio::join!(
        fixture.client.fetch_feed_token(&token),
        fixture.client.fetch_feed_token(&token),
    );
    let (first, second) = (first?, second?);

    pretty_assert_eq!(first.status, 200);
    pretty_assert_eq!(second.status, 200);
    pretty_assert_eq!(first.body, second.body);
    pretty_assert_eq!(first.content_type, second.content_type);
    pretty_assert_eq!(fixture.bridge.feed_calls().len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rejects_foreign_origin_without_network() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    let token = token_with(
        &fixture,
        "jack",
        String::from("http://evil.test/?action=display&bridge=TwitterV2Bridge"),
        None,
    )?;

    let response = fixture.client.fetch_feed_token(&token).await?;

    pretty_assert_eq!(response.status, 400);
    assert!(fixture.bridge.feed_calls().is_empty());
    assert!(fixture.bridge.authorizations().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rejects_tampered_token() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::atom(FEED));
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    // Flip a character inside the ciphertext segment.
    let mut segments = token.split('.').map(String::from).collect::<Vec<_>>();
    let ciphertext = &mut segments[2];
    let flipped = if ciphertext.starts_with('A') { "B" } else { "A" };
    ciphertext.replace_range(0..1, flipped);
    let tampered = segments.join(".");

    let response = fixture.client.fetch_feed_token(&tampered).await?;

    pretty_assert_eq!(response.status, 400);
    assert!(fixture.bridge.feed_calls().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn forwards_upstream_throttling() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture.bridge.feed(
        "TwitterV2Bridge",
        FeedReply::status(429).with_retry_after("30"),
    );
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    let response = fixture.client.fetch_feed_token(&token).await?;

    pretty_assert_eq!(response.status, 429);
    pretty_assert_eq!(response.retry_after, Some(30));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn upstream_failures_are_bad_gateway() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::status(503));
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    let response = fixture.client.fetch_feed_token(&token).await?;
    pretty_assert_eq!(response.status, 502);
    pretty_assert_eq!(response.retry_after, None);

    // Failures aren't cached.
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::atom(FEED));
    let retry = fixture.client.fetch_feed_token(&token).await?;
    pretty_assert_eq!(retry.status, 200);

    let metrics = fixture
        .client
        .metrics(&fixture.metrics_token)
        .await?
        .expect("metrics enabled");
    pretty_assert_eq!(metrics.counter("social.proxy{outcome=upstream_error}"), 1);
    assert!(
        metrics
            .recent_events
            .iter()
            .any(|event| event.kind == "social.proxy.upstream_error")
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn oversized_feeds_are_bad_gateway() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture.bridge.feed(
        "TwitterV2Bridge",
        FeedReply::atom("x".repeat(MAX_FEED_SIZE + 1)),
    );
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    let response = fixture.client.fetch_feed_token(&token).await?;
    pretty_assert_eq!(response.status, 502);

    // Nothing was cached, so the next request goes upstream again.
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::atom(FEED));
    let retry = fixture.client.fetch_feed_token(&token).await?;
    pretty_assert_eq!(retry.status, 200);
    pretty_assert_eq!(retry.cache.as_deref(), Some("MISS"));
    pretty_assert_eq!(fixture.bridge.feed_calls().len(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn abandoned_fetch_still_caches() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.feed(
        "TwitterV2Bridge",
        FeedReply::atom(FEED).with_delay(Duration::from_millis(300)),
    );
    let settings = Settings::builder()
        .bridge_base_url(bridge.base.clone())
        .proxy_base_url("http://herald.test/api/v1/social/feed/")
        .fetch_timeout(Duration::from_secs(1))
        .build();
    let proxy = Proxy::new(api::http_client()?, &settings);
    let source = SourceKey::new(Platform::Twitter, "jack", None);
    let url = Url::parse(&bridge.feed_url("TwitterV2Bridge"))?;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        proxy.fetch(&source, url, None),
    )
    .await;
    assert!(abandoned.is_err(), "caller gave up before the fetch settled");

    tokio::time::sleep(Duration::from_secs(2)).await;
    pretty_assert_eq!(proxy.in_flight(), 0);
    let cached = proxy.cached(&source).expect("abandoned fetch was cached");
    pretty_assert_eq!(cached.value.body, FEED);
    pretty_assert_eq!(bridge.feed_calls().len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn source_rate_limit_applies_before_cache() -> Result<()> {
    let fixture = TestFixture::spawn_with(|settings| Settings {
        source_rate_limit: 2,
        ..settings
    })
    .await?;
    fixture
        .bridge
        .feed("TwitterV2Bridge", FeedReply::atom(FEED));
    let token = token(&fixture, "jack", "TwitterV2Bridge")?;

    for _ in 0..2 {
        pretty_assert_eq!(fixture.client.fetch_feed_token(&token).await?.status, 200);
    }
    let limited = fixture.client.fetch_feed_token(&token).await?;

    pretty_assert_eq!(limited.status, 429);
    assert!(limited.retry_after.is_some_and(|secs| secs >= 1));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn sends_credentials_upstream() -> Result<()> {
    let fixture = TestFixture::spawn().await?;
    fixture
        .bridge
        .feed("InstagramBridge", FeedReply::atom(FEED));
    let token = token_with(
        &fixture,
        "someone",
        fixture.bridge.feed_url("InstagramBridge"),
        Some(Credentials {
            username: String::from("me"),
            password: String::from("hunter2"),
        }),
    )?;

    let response = fixture.client.fetch_feed_token(&token).await?;

    pretty_assert_eq!(response.status, 200);
    pretty_assert_eq!(
        fixture.bridge.authorizations(),
        vec![Some(format!("Basic {}", STANDARD.encode("me:hunter2")))]
    );
    Ok(())
}
