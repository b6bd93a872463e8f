use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use http::{HeaderName, HeaderValue, StatusCode, header};
use serde_json::json;

use crate::limiter::{Decision, Limiter};

#[derive(Clone)]
pub struct AppState {
    limiter: Arc<dyn Limiter>,
}

pub fn router(limiter: Arc<dyn Limiter>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/check/{client_id}", post(check))
        .route("/v1/reset/{client_id}", post(reset))
        .route("/v1/status/{client_id}", get(status))
        .with_state(AppState { limiter })
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn check(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    let decision = state.limiter.check(&client_id).await;
    let code = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (code, Json(&decision)).into_response();
    apply_rate_limit_headers(&mut response, &decision);
    response
}

async fn reset(State(state): State<AppState>, Path(client_id): Path<String>) -> StatusCode {
    state.limiter.reset(&client_id).await;
    StatusCode::NO_CONTENT
}

async fn status(State(state): State<AppState>, Path(client_id): Path<String>) -> Response {
    Json(state.limiter.status(&client_id).await).into_response()
}

fn apply_rate_limit_headers(response: &mut Response, decision: &Decision) {
    let headers = response.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset_at.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), value);
    }

    if let Some(retry_after) = decision.retry_after {
        let secs = retry_after.ceil().max(1.0) as u64;
        if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
            headers.insert(header::RETRY_AFTER, value);
        }
    }
}
