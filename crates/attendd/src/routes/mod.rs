pub mod cleanup;
pub mod health;
pub mod recognize;
pub mod register;

use axum::Router;

use crate::state::AppState;

/// Route tree:
///
/// ```text
/// GET  /                 liveness
/// GET  /status           version and policy
/// POST /register         enroll images, upsert profile
/// POST /recognize        identify, mark attendance
/// POST /cleanup_blurry   sweep blurry embeddings
/// ```
pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(register::router())
        .merge(recognize::router())
        .merge(cleanup::router())
}
