use axum::{Router, routing::get};

use crate::api::State;

pub mod health;
pub mod social;

pub fn router() -> Router<State> {
    Router::new()
        .route("/health", get(health::handle))
        .nest("/social", social::router())
}
