use attend_core::SweepReport;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub report: SweepReport,
}

/// POST /cleanup_blurry -- drop every stored embedding below the sharpness
/// threshold, with its image, and trim galleries left over capacity.
async fn cleanup_blurry(State(state): State<AppState>) -> AppResult<Json<CleanupResponse>> {
    let report = state.pipeline.cleanup_blurry().await?;
    Ok(Json(CleanupResponse {
        status: "cleanup-complete",
        report,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/cleanup_blurry", post(cleanup_blurry))
}
