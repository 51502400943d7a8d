//! Social profile feeds.
//!
//! Creating a feed discovers a working bridge feed for the profile and hands
//! back a proxy URL with the routing details sealed into a token. The feed
//! reader then polls the proxy URL like any other feed.

use axum::{
    Router,
    routing::{get, post},
};

use crate::api::State;

pub mod create;
pub mod fetch;
pub mod metrics;

pub fn router() -> Router<State> {
    Router::new()
        .route("/feeds", post(create::handle))
        .route("/feed/{token}", get(fetch::handle))
        .route("/metrics", get(metrics::handle))
}
