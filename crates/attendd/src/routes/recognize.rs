use attend_core::{AttendanceStatus, Direction, GalleryRefresh, RecognizeOutcome, SessionContext, Usn};
use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// Flat status object returned by `POST /recognize`.
///
/// `distance` is always present and is `null` when no comparison happened.
#[derive(Debug, Serialize, PartialEq)]
pub struct RecognizeResponse {
    pub status: &'static str,
    pub distance: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usn: Option<Usn>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub marked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance: Option<AttendanceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gallery_refresh: Option<GalleryRefresh>,
}

impl From<RecognizeOutcome> for RecognizeResponse {
    fn from(outcome: RecognizeOutcome) -> Self {
        let mut response = RecognizeResponse {
            status: outcome.status(),
            distance: outcome.distance(),
            usn: None,
            message: None,
            direction: None,
            marked_at: None,
            attendance: None,
            gallery_refresh: None,
        };
        match outcome {
            RecognizeOutcome::NoFace { message } => response.message = Some(message),
            RecognizeOutcome::NoGallery => {
                response.message = Some("No embeddings in database".to_string());
            }
            RecognizeOutcome::NoMatch { .. } => {}
            RecognizeOutcome::AlreadyMarked {
                usn,
                direction,
                marked_at,
                ..
            } => {
                response.usn = Some(usn);
                response.direction = Some(direction);
                response.marked_at = Some(marked_at);
            }
            RecognizeOutcome::Success {
                usn,
                attendance,
                gallery_refresh,
                ..
            } => {
                response.usn = Some(usn);
                response.attendance = Some(attendance);
                response.gallery_refresh = gallery_refresh;
            }
        }
        response
    }
}

/// POST /recognize -- identify the face and, with a full session context,
/// mark attendance.
async fn recognize(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<RecognizeResponse>> {
    let mut image: Option<Vec<u8>> = None;
    let mut session = SessionContext::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "file" {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            image = Some(bytes.to_vec());
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        match name.as_str() {
            "session_id" => session.session_id = value,
            "class_name" => session.class_name = value,
            "subject" => session.subject = value,
            "teacher_id" => session.teacher_id = value,
            "mode" => {
                session.mode = value
                    .map(|v| v.parse::<Direction>())
                    .transpose()
                    .map_err(AppError::BadRequest)?;
            }
            other => tracing::debug!(field = other, "ignoring unknown recognize field"),
        }
    }

    let image = image.ok_or_else(|| AppError::BadRequest("file is required".to_string()))?;
    let outcome = state.pipeline.recognize(&image, &session).await?;
    tracing::info!(
        status = outcome.status(),
        distance = ?outcome.distance(),
        "recognize finished"
    );
    Ok(Json(outcome.into()))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/recognize", post(recognize))
}
