use axum::{http::StatusCode, response::IntoResponse};
use tracing::info;

/// Health check endpoint.
///
/// Herald keeps no external state of its own, so being able to answer is all
/// there is to check. Bridge availability is reported through the metrics
/// endpoint instead, since a bridge outage shouldn't get the proxy restarted.
#[tracing::instrument]
pub async fn handle() -> PingResponse {
    info!("health.ping.success");
    PingResponse::Success
}

#[derive(Debug)]
pub enum PingResponse {
    Success,
}

impl IntoResponse for PingResponse {
    fn into_response(self) -> axum::response::Response {
        match self {
            PingResponse::Success => StatusCode::OK.into_response(),
        }
    }
}
