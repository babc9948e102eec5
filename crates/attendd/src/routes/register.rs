use attend_core::{IdentityProfile, RegisterReport, UploadedImage, Usn};
use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub report: RegisterReport,
}

/// Form fields of `POST /register`.
#[derive(Debug, Default)]
struct RegisterForm {
    usn: Option<String>,
    name: Option<String>,
    class_name: Option<String>,
    phone: Option<String>,
    guardian_email: Option<String>,
    guardian_phone: Option<String>,
    subjects: Vec<String>,
    files: Vec<UploadedImage>,
}

impl RegisterForm {
    async fn read(mut multipart: Multipart) -> AppResult<Self> {
        let mut form = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "files" {
                let filename = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::BadRequest(e.to_string()))?;
                form.files.push(UploadedImage {
                    filename,
                    bytes: bytes.to_vec(),
                });
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            match name.as_str() {
                "usn" => form.usn = Some(value),
                "name" => form.name = Some(value),
                "class_" | "class" => form.class_name = Some(value),
                "phone" => form.phone = Some(value),
                "guardianEmail" => form.guardian_email = Some(value),
                "guardianPhone" => form.guardian_phone = Some(value),
                "subjects" => form.subjects.push(value),
                other => tracing::debug!(field = other, "ignoring unknown register field"),
            }
        }
        Ok(form)
    }

    fn into_parts(self) -> AppResult<(IdentityProfile, Vec<UploadedImage>)> {
        let usn = Usn::parse(self.usn.as_deref().unwrap_or_default())?;
        let name = non_blank(self.name)
            .ok_or_else(|| AppError::BadRequest("name is required".to_string()))?;
        if self.files.is_empty() {
            return Err(AppError::BadRequest("at least one file is required".to_string()));
        }

        let subjects: Vec<String> = self
            .subjects
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let profile = IdentityProfile {
            usn,
            name,
            class_name: non_blank(self.class_name),
            phone: non_blank(self.phone),
            guardian_email: non_blank(self.guardian_email),
            guardian_phone: non_blank(self.guardian_phone),
            subjects: (!subjects.is_empty()).then_some(subjects),
        };
        Ok((profile, self.files))
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// POST /register -- enroll every usable image and upsert the profile.
async fn register(
    State(state): State<AppState>,
    multipart: Multipart,
) -> AppResult<Json<RegisterResponse>> {
    let (profile, files) = RegisterForm::read(multipart).await?.into_parts()?;
    tracing::info!(usn = %profile.usn, files = files.len(), "register request");

    let report = state.pipeline.register(&profile, files).await?;
    Ok(Json(RegisterResponse {
        status: "success",
        report,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/register", post(register))
}
