//! Normalization of user-supplied social profile references.
//!
//! Users paste all sorts of things into the "add a profile" form: bare
//! handles, handles with a leading `@`, full profile URLs, and URLs without a
//! scheme. Everything is reduced to a lowercase handle that matches the
//! platform's handle rules before anything else touches it.

use clients::herald::v1::Platform;
use derive_more::{Debug, Display, Error};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

/// Path segments on platform hosts that are never profile handles.
const INSTAGRAM_RESERVED: &[&str] = &[
    "explore", "accounts", "settings", "p", "reel", "reels", "stories", "direct", "tv",
];
const TWITTER_RESERVED: &[&str] = &[
    "search",
    "i",
    "home",
    "explore",
    "settings",
    "notifications",
    "messages",
    "intent",
    "share",
    "hashtag",
    "login",
    "signup",
    "compose",
];

/// The unvalidated body of a feed creation request.
///
/// Fields are kept as raw JSON so that type mismatches surface as
/// [`InvalidInput`] with a useful reason instead of a generic parse error.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct RawSocialInput {
    #[serde(default)]
    pub platform: Option<Value>,

    #[serde(default)]
    pub handle: Option<Value>,

    #[serde(default)]
    pub login_username: Option<Value>,

    #[serde(default)]
    #[debug(ignore)]
    pub login_password: Option<Value>,
}

/// Login credentials passed through to the bridge.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Credentials {
    pub username: String,

    #[debug(ignore)]
    pub password: String,
}

/// A validated social profile reference.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NormalizedSocialInput {
    pub platform: Platform,

    /// Lowercase, without a leading `@`.
    pub handle: String,

    pub credentials: Option<Credentials>,
}

/// The request could not be turned into a [`NormalizedSocialInput`].
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("invalid input: {reason}")]
pub struct InvalidInput {
    pub reason: String,
}

impl InvalidInput {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Validate and normalize a raw feed creation request.
pub fn normalize(raw: RawSocialInput) -> Result<NormalizedSocialInput, InvalidInput> {
    let platform = match raw.platform {
        Some(Value::String(name)) => Platform::parse(&name)
            .ok_or_else(|| InvalidInput::new("platform must be instagram or twitter"))?,
        Some(Value::Null) | None => return Err(InvalidInput::new("platform is required")),
        Some(_) => return Err(InvalidInput::new("platform must be a string")),
    };

    let handle = match raw.handle {
        Some(Value::String(handle)) => handle,
        Some(Value::Null) | None => return Err(InvalidInput::new("handle is required")),
        Some(_) => return Err(InvalidInput::new("handle must be a string")),
    };
    let handle = handle.trim();
    if handle.is_empty() {
        return Err(InvalidInput::new("handle is required"));
    }

    let handle = match profile_url(handle) {
        Some(url) => handle_from_url(platform, &url)?,
        None => handle.to_string(),
    };
    let handle = handle.trim_start_matches('@').to_ascii_lowercase();
    if !is_valid_handle(platform, &handle) {
        return Err(InvalidInput::new(format!("not a valid {platform} handle")));
    }

    let username = optional_string(raw.login_username, "login_username")?
        .map(|username| username.trim().to_string());
    let password = optional_string(raw.login_password, "login_password")?;
    let credentials = match (username, password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        (None, None) => None,
        _ => {
            return Err(InvalidInput::new(
                "login_username and login_password must be provided together",
            ));
        }
    };

    Ok(NormalizedSocialInput {
        platform,
        handle,
        credentials,
    })
}

/// Whether `handle` satisfies the platform's handle rules.
pub fn is_valid_handle(platform: Platform, handle: &str) -> bool {
    match platform {
        Platform::Instagram => lazy_regex::regex_is_match!(r"^[a-zA-Z0-9._]{1,30}$", handle),
        Platform::Twitter => lazy_regex::regex_is_match!(r"^[a-zA-Z0-9_]{1,15}$", handle),
    }
}

/// Blank strings count as absent.
fn optional_string(value: Option<Value>, field: &str) -> Result<Option<String>, InvalidInput> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) if value.trim().is_empty() => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(InvalidInput::new(format!("{field} must be a string"))),
    }
}

/// Interpret the input as a profile URL if it looks like one.
///
/// Absolute and protocol-relative URLs always qualify; scheme-less input
/// qualifies when it starts with a known platform host.
fn profile_url(input: &str) -> Option<Url> {
    let lower = input.to_ascii_lowercase();
    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        input.to_string()
    } else if lower.starts_with("//") {
        format!("https:{input}")
    } else {
        let host = lower.split('/').next().unwrap_or_default();
        if lower.contains('/') && platform_for_host(host).is_some() {
            format!("https://{input}")
        } else {
            return None;
        }
    };
    // Unparseable URLs fall through to handle validation, which rejects them.
    Url::parse(&candidate).ok()
}

fn handle_from_url(platform: Platform, url: &Url) -> Result<String, InvalidInput> {
    let host = url
        .host_str()
        .ok_or_else(|| InvalidInput::new("profile URL has no host"))?;
    if platform_for_host(host) != Some(platform) {
        return Err(InvalidInput::new(format!("not a {platform} profile URL")));
    }

    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.find(|segment| !segment.is_empty()))
        .ok_or_else(|| InvalidInput::new("profile URL has no handle"))?;

    let reserved = match platform {
        Platform::Instagram => INSTAGRAM_RESERVED,
        Platform::Twitter => TWITTER_RESERVED,
    };
    if reserved
        .iter()
        .any(|reserved| segment.eq_ignore_ascii_case(reserved))
    {
        return Err(InvalidInput::new(format!(
            "profile URL does not point at a {platform} profile"
        )));
    }

    Ok(segment.to_string())
}

fn platform_for_host(host: &str) -> Option<Platform> {
    let host = host.to_ascii_lowercase();
    let host = ["www.", "mobile.", "m."]
        .iter()
        .find_map(|prefix| host.strip_prefix(prefix))
        .unwrap_or(host.as_str());
    match host {
        "instagram.com" => Some(Platform::Instagram),
        "twitter.com" | "x.com" => Some(Platform::Twitter),
        _ => None,
    }
}
