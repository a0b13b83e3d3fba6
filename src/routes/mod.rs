//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router serves the realtime canvas endpoint plus two liveness
//! checks. Every route shares the same `AppState`.

pub mod ws;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/canvas/ping", get(ping))
        .route("/canvas/ws/{board_id}", get(ws::handle_ws))
        .route("/healthz", get(healthz))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> Json<Value> {
    Json(json!({ "message": "pong" }))
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}
