use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tracing::warn;

use crate::relay::Relay;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    store: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    local_connections: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    active_sessions: Option<usize>,
}

/// GET /health - round-trips a value through the store
pub async fn health_check(State(state): State<AppState>) -> Response {
    let sessions = state.relay.sessions();
    let probe = &sessions.keys().probe;
    let stamp = Utc::now().timestamp_millis().to_string();

    let outcome = async {
        sessions.store().set(probe, &stamp).await?;
        sessions.store().get(probe).await
    }
    .await;

    match outcome {
        Ok(Some(echoed)) if echoed == stamp => Json(HealthStatus {
            status: "ok",
            store: "ok",
        })
        .into_response(),
        Ok(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: "degraded",
                store: "inconsistent",
            }),
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthStatus {
                    status: "degraded",
                    store: "unavailable",
                }),
            )
                .into_response()
        }
    }
}

/// GET /stats - local connection count and shared active session count
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let active_sessions = match state.relay.sessions().activity().await {
        Ok(activity) => Some(activity.len()),
        Err(err) => {
            warn!(error = %err, "failed to count active sessions");
            None
        }
    };
    Json(StatsResponse {
        local_connections: state.relay.registry().len(),
        active_sessions,
    })
}

/// GET /metrics - Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
