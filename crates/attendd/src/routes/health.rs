use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub model: String,
    pub embedding_dim: usize,
    pub sharpness_threshold: f64,
    pub distance_threshold: f32,
    pub max_gallery_size: usize,
}

/// GET / -- liveness.
async fn root() -> Json<Value> {
    Json(json!({ "message": "Face Attendance Backend is running" }))
}

/// GET /status -- version and the active policy.
async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let policy = state.pipeline.policy();
    Json(StatusResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model: state.model.clone(),
        embedding_dim: policy.embedding_dim,
        sharpness_threshold: policy.sharpness_threshold,
        distance_threshold: policy.distance_threshold,
        max_gallery_size: policy.max_gallery_size,
    })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
}
