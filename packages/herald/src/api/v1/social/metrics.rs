use aerosol::axum::Dep;
use axum::{
    Json,
    extract::Query,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use clients::herald::v1::{ErrorResponse, METRICS_TOKEN_HEADER, MetricsSnapshot};
use derive_more::Debug;
use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    auth::{GateDecision, MetricsGate},
    metrics::Recorder,
};

#[derive(Debug, Default, Deserialize)]
pub struct MetricsQuery {
    #[debug(ignore)]
    token: Option<String>,
}

/// Counters and recent events.
///
/// Gated by the metrics token, presented in the [`METRICS_TOKEN_HEADER`]
/// header or the `token` query parameter. Without a configured token the
/// endpoint doesn't exist.
#[tracing::instrument(skip_all)]
pub async fn handle(
    Dep(gate): Dep<MetricsGate>,
    Dep(metrics): Dep<Recorder>,
    headers: HeaderMap,
    Query(query): Query<MetricsQuery>,
) -> MetricsResponse {
    let presented = headers
        .get(METRICS_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .or(query.token.as_deref());

    match gate.check(presented) {
        GateDecision::Disabled => MetricsResponse::NotFound,
        GateDecision::Denied => {
            warn!("social.metrics.denied");
            MetricsResponse::Unauthorized
        }
        GateDecision::Allowed => {
            info!("social.metrics.success");
            MetricsResponse::Success(metrics.snapshot())
        }
    }
}

#[derive(Debug)]
pub enum MetricsResponse {
    Success(MetricsSnapshot),
    NotFound,
    Unauthorized,
}

impl IntoResponse for MetricsResponse {
    fn into_response(self) -> Response {
        match self {
            MetricsResponse::Success(snapshot) => {
                let mut response = Json(snapshot).into_response();
                response
                    .headers_mut()
                    .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
                response
            }
            MetricsResponse::NotFound => StatusCode::NOT_FOUND.into_response(),
            MetricsResponse::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("invalid metrics token")),
            )
                .into_response(),
        }
    }
}
