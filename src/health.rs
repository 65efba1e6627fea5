//! `GET /healthz` — the one HTTP surface this core exposes directly.
//!
//! An external transport is expected to build the real API against
//! `api.rs`'s contracts, not against this module — this one endpoint is
//! just a liveness probe for orchestration.

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::info;

use crate::db::Db;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
}

#[derive(Serialize)]
struct ServiceHealth {
    database: &'static str,
    mqtt: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    services: ServiceHealth,
    uptime_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new().route("/healthz", get(healthz)).with_state(state)
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.health_check().await.is_ok();
    let st = state.shared.read().await;
    let mqtt_ok = st.mqtt_connected;
    let uptime_secs = st.started_at.elapsed().as_secs();
    drop(st);

    let status = if db_ok && mqtt_ok { "ok" } else { "degraded" };
    Json(HealthResponse {
        status,
        services: ServiceHealth {
            database: if db_ok { "ok" } else { "unavailable" },
            mqtt: if mqtt_ok { "ok" } else { "disconnected" },
        },
        uptime_secs,
    })
}

pub async fn serve(shared: SharedState, db: Db, port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind health port");
    info!(%addr, "health endpoint listening");

    let state = AppState { shared, db };
    axum::serve(listener, router(state)).await.expect("health server error");
}
