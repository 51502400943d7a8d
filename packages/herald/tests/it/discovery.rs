use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use clients::herald::v1::Platform;
use color_eyre::Result;
use herald::{
    api,
    bridge::{Discovery, DiscoveryError},
    config::Settings,
    metrics::Recorder,
    social::{Credentials, NormalizedSocialInput},
};
use pretty_assertions::assert_eq as pretty_assert_eq;
use serde_json::json;

use crate::{FakeBridge, FeedReply, Lookup};

const X_JACK: &str = "https://x.com/jack";
const TWITTER_JACK: &str = "https://twitter.com/jack";
const INSTAGRAM_SOMEONE: &str = "https://www.instagram.com/someone/";

fn discovery(bridge: &FakeBridge, configure: impl FnOnce(Settings) -> Settings) -> Result<(Discovery, Recorder)> {
    let settings = configure(
        Settings::builder()
            .bridge_base_url(bridge.base.clone())
            .proxy_base_url("http://herald.test/api/v1/social/feed/")
            .discovery_timeout(Duration::from_secs(2))
            .build(),
    );
    let metrics = Recorder::default();
    let discovery = Discovery::new(api::http_client()?, &settings, metrics.clone());
    Ok((discovery, metrics))
}

fn twitter(handle: &str) -> NormalizedSocialInput {
    NormalizedSocialInput {
        platform: Platform::Twitter,
        handle: handle.to_string(),
        credentials: None,
    }
}

fn instagram(handle: &str) -> NormalizedSocialInput {
    NormalizedSocialInput {
        platform: Platform::Instagram,
        handle: handle.to_string(),
        credentials: None,
    }
}

#[test_log::test(tokio::test)]
async fn verifies_in_rank_order_and_caches() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Bridges(vec!["NitterBridge", "TwitterV2Bridge"]));
    bridge.feed("TwitterV2Bridge", FeedReply::status(500));
    bridge.feed("NitterBridge", FeedReply::atom("<feed/>"));
    let (discovery, metrics) = discovery(&bridge, |settings| settings)?;

    let url = discovery.discover(&twitter("jack")).await?;
    pretty_assert_eq!(url.as_str(), bridge.feed_url("NitterBridge"));
    pretty_assert_eq!(
        bridge.feed_calls(),
        vec![String::from("TwitterV2Bridge"), String::from("NitterBridge")]
    );

    let cached = discovery.discover(&twitter("jack")).await?;
    pretty_assert_eq!(cached, url);
    pretty_assert_eq!(bridge.lookup_calls(), vec![String::from(X_JACK)]);
    pretty_assert_eq!(bridge.feed_calls().len(), 2);

    pretty_assert_eq!(metrics.counter("bridge.discovery.cache", &[("result", "miss")]), 1);
    pretty_assert_eq!(metrics.counter("bridge.discovery.cache", &[("result", "hit")]), 1);
    pretty_assert_eq!(metrics.counter("bridge.verify", &[("outcome", "error")]), 1);
    pretty_assert_eq!(metrics.counter("bridge.verify", &[("outcome", "ok")]), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn falls_back_to_legacy_twitter_domain() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(TWITTER_JACK, Lookup::Bridges(vec!["TwitterBridge"]));
    bridge.feed("TwitterBridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let url = discovery.discover(&twitter("jack")).await?;

    pretty_assert_eq!(url.as_str(), bridge.feed_url("TwitterBridge"));
    pretty_assert_eq!(
        bridge.lookup_calls(),
        vec![String::from(X_JACK), String::from(TWITTER_JACK)]
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn stops_at_first_form_with_candidates() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Bridges(vec!["TwitterV2Bridge"]));
    bridge.lookup(TWITTER_JACK, Lookup::Bridges(vec!["TwitterBridge"]));
    bridge.feed("TwitterV2Bridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    discovery.discover(&twitter("jack")).await?;

    pretty_assert_eq!(bridge.lookup_calls(), vec![String::from(X_JACK)]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn reports_no_bridge_available() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    let (discovery, metrics) = discovery(&bridge, |settings| settings)?;

    let err = discovery
        .discover(&twitter("jack"))
        .await
        .expect_err("no bridge handles the profile");

    assert!(matches!(err, DiscoveryError::NoBridgeAvailable { .. }), "{err:?}");
    pretty_assert_eq!(err.errors().len(), 2);
    pretty_assert_eq!(metrics.counter("bridge.lookup", &[("outcome", "no_handler")]), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn lookup_errors_are_discovery_failures() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Status(500));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let err = discovery
        .discover(&twitter("jack"))
        .await
        .expect_err("lookup fails");

    assert!(matches!(err, DiscoveryError::DiscoveryFailed { .. }), "{err:?}");
    pretty_assert_eq!(err.errors().len(), 2);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn empty_lookup_is_a_failure() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(INSTAGRAM_SOMEONE, Lookup::Raw(json!([])));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let err = discovery
        .discover(&instagram("someone"))
        .await
        .expect_err("no candidates");

    assert!(matches!(err, DiscoveryError::DiscoveryFailed { .. }), "{err:?}");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn discards_candidates_outside_the_bridge() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(
        INSTAGRAM_SOMEONE,
        Lookup::Raw(json!([
            {"url": "http://evil.test/?action=display&bridge=InstagramBridge"},
        ])),
    );
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let err = discovery
        .discover(&instagram("someone"))
        .await
        .expect_err("foreign candidate is discarded");

    assert!(matches!(err, DiscoveryError::DiscoveryFailed { .. }), "{err:?}");
    assert!(bridge.feed_calls().is_empty());
    Ok(())
}

#[test_log::test(tokio::test)]
async fn rejects_non_feed_content() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(
        INSTAGRAM_SOMEONE,
        Lookup::Bridges(vec!["PicukiBridge", "InstagramBridge"]),
    );
    bridge.feed(
        "InstagramBridge",
        FeedReply::atom("<html/>").with_content_type("text/html"),
    );
    bridge.feed("PicukiBridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let url = discovery.discover(&instagram("someone")).await?;

    pretty_assert_eq!(url.as_str(), bridge.feed_url("PicukiBridge"));
    pretty_assert_eq!(
        bridge.feed_calls(),
        vec![String::from("InstagramBridge"), String::from("PicukiBridge")]
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn slow_candidates_time_out() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Bridges(vec!["TwitterV2Bridge", "NitterBridge"]));
    bridge.feed(
        "TwitterV2Bridge",
        FeedReply::atom("<feed/>").with_delay(Duration::from_secs(2)),
    );
    bridge.feed("NitterBridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| Settings {
        discovery_timeout: Duration::from_millis(200),
        ..settings
    })?;

    let url = discovery.discover(&twitter("jack")).await?;

    pretty_assert_eq!(url.as_str(), bridge.feed_url("NitterBridge"));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn ranking_can_be_overridden() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Bridges(vec!["TwitterV2Bridge", "NitterBridge"]));
    bridge.feed("TwitterV2Bridge", FeedReply::atom("<feed/>"));
    bridge.feed("NitterBridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| Settings {
        ranking: settings
            .ranking
            .with_overrides(Some(vec![String::from("NitterBridge")]), None),
        ..settings
    })?;

    let url = discovery.discover(&twitter("jack")).await?;

    pretty_assert_eq!(url.as_str(), bridge.feed_url("NitterBridge"));
    pretty_assert_eq!(bridge.feed_calls(), vec![String::from("NitterBridge")]);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn concurrent_discoveries_share_one_run() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Bridges(vec!["TwitterV2Bridge"]));
    bridge.feed(
        "TwitterV2Bridge",
        FeedReply::atom("<feed/>").with_delay(Duration::from_millis(300)),
    );
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let input = twitter("jack");
    let (first, second) = tokio::join!(discovery.discover(&input), discovery.discover(&input));

    pretty_assert_eq!(first?, second?);
    pretty_assert_eq!(bridge.lookup_calls().len(), 1);
    pretty_assert_eq!(bridge.feed_calls().len(), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn abandoned_discovery_still_completes() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(X_JACK, Lookup::Bridges(vec!["TwitterV2Bridge"]));
    bridge.feed(
        "TwitterV2Bridge",
        FeedReply::atom("<feed/>").with_delay(Duration::from_millis(300)),
    );
    let (discovery, metrics) = discovery(&bridge, |settings| settings)?;
    let input = twitter("jack");

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), discovery.discover(&input)).await;
    assert!(abandoned.is_err(), "caller gave up before discovery settled");

    tokio::time::sleep(Duration::from_secs(1)).await;
    let url = discovery.discover(&input).await?;

    pretty_assert_eq!(url.as_str(), bridge.feed_url("TwitterV2Bridge"));
    pretty_assert_eq!(bridge.lookup_calls().len(), 1);
    pretty_assert_eq!(bridge.feed_calls().len(), 1);
    pretty_assert_eq!(metrics.counter("bridge.discovery.cache", &[("result", "hit")]), 1);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn sends_credentials_to_the_bridge() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(INSTAGRAM_SOMEONE, Lookup::Bridges(vec!["InstagramBridge"]));
    bridge.feed("InstagramBridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    let input = NormalizedSocialInput {
        credentials: Some(Credentials {
            username: String::from("me"),
            password: String::from("hunter2"),
        }),
        ..instagram("someone")
    };
    discovery.discover(&input).await?;

    let expected = format!("Basic {}", STANDARD.encode("me:hunter2"));
    let authorizations = bridge.authorizations();
    pretty_assert_eq!(authorizations.len(), 2);
    assert!(
        authorizations
            .iter()
            .all(|authorization| authorization.as_deref() == Some(expected.as_str()))
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn credentials_partition_the_cache() -> Result<()> {
    let bridge = FakeBridge::spawn().await?;
    bridge.lookup(INSTAGRAM_SOMEONE, Lookup::Bridges(vec!["InstagramBridge"]));
    bridge.feed("InstagramBridge", FeedReply::atom("<feed/>"));
    let (discovery, _) = discovery(&bridge, |settings| settings)?;

    discovery.discover(&instagram("someone")).await?;
    let with_login = NormalizedSocialInput {
        credentials: Some(Credentials {
            username: String::from("me"),
            password: String::from("hunter2"),
        }),
        ..instagram("someone")
    };
    discovery.discover(&with_login).await?;

    pretty_assert_eq!(bridge.lookup_calls().len(), 2);
    Ok(())
}
