//! Minimal introspection surface: live devices, stream info, health,
//! metrics.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use fb_protocol::{HttpErrorEnvelope, StreamSummary};

use crate::state::AppState;

/// `GET /devices` — every live session's identity context.
pub async fn list_devices(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.snapshot().await)
}

/// `GET /streams` — name, subjects and shape of each stream on the bus.
pub async fn list_streams(State(state): State<AppState>) -> impl IntoResponse {
    match state.bus.list_streams().await {
        Ok(infos) => {
            let summaries: Vec<StreamSummary> = infos
                .into_iter()
                .map(|info| StreamSummary {
                    name: info.config.name,
                    subjects: info.config.subjects,
                    messages: info.messages,
                    first_sequence: info.first_sequence,
                    last_sequence: info.last_sequence,
                })
                .collect();
            Json(summaries).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HttpErrorEnvelope {
                code: "BUS_UNAVAILABLE".to_owned(),
                message: e.to_string(),
                details: None,
            }),
        )
            .into_response(),
    }
}

/// `GET /health` — 200 when the session core and bus adapter are ready.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    if state.shutdown.is_cancelled() {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    if state.bus.ready().await {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "bus not ready").into_response()
    }
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
