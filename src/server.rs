//! Operational HTTP surface: health, readiness, metrics, pipeline status,
//! and the push ingress endpoint.

use crate::ingress::{Ingress, RejectReason, SubmitOutcome};
use crate::metrics::{self, StagePercentiles, LATENCIES};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub ingress: Arc<Ingress>,
    pub ready: watch::Receiver<bool>,
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn ready_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if *state.ready.borrow() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> String {
    metrics::gather()
}

#[derive(Debug, Serialize)]
struct StatusBody {
    ready: bool,
    in_flight: i64,
    bus_depth: i64,
    dlq_depth: i64,
    stage_latencies: BTreeMap<String, StagePercentiles>,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusBody> {
    Json(StatusBody {
        ready: *state.ready.borrow(),
        in_flight: metrics::IN_FLIGHT.get(),
        bus_depth: metrics::BUS_DEPTH.get(),
        dlq_depth: metrics::DLQ_DEPTH.get(),
        stage_latencies: LATENCIES.percentiles(),
    })
}

async fn submit_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<SubmitOutcome>) {
    let source = body
        .get("source")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let outcome = state.ingress.submit(&source, &body);

    let code = if outcome.accepted {
        StatusCode::ACCEPTED
    } else {
        match outcome.reason {
            Some(RejectReason::Backpressure) => StatusCode::TOO_MANY_REQUESTS,
            Some(RejectReason::Draining) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    };
    (code, Json(outcome))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/v1/events", post(submit_handler))
        .with_state(state)
}

pub async fn start_server(addr: SocketAddr, state: AppState) {
    let app = router(state);

    info!("ops server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind ops server to {}: {}", addr, err);
            return;
        }
    };

    if let Err(err) = axum::serve(listener, app).await {
        error!("ops server error: {}", err);
    }
}
