//! Register and Recognize flows.
//!
//! Register reports per image and never lets one image fail the batch.
//! Recognize ends in exactly one [`RecognizeOutcome`]. Only infrastructure
//! failures (engine gone, store unreachable) surface as [`PipelineError`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::extractor::{ExtractError, FaceEmbedding, FaceExtractor};
use crate::gallery::{GalleryCandidate, GalleryError, IdentityGallery, InsertOutcome, SweepReport};
use crate::ledger::{AttendanceLedger, Direction, MarkOutcome, SessionContext};
use crate::matcher::{IdentityMatcher, MatchError};
use crate::policy::Policy;
use crate::quality::CropError;
use crate::store::{ObjectStore, RecordStore, StoreError};
use crate::types::{EmbeddingSource, IdentityProfile, Usn};

/// One file from a multipart upload.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: Option<String>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WarningKind {
    NoFace,
    TooBlurry,
    /// Gallery already full of sharper images. Not a failure.
    GalleryFull,
    UploadError,
    PersistenceError,
    ProfileError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Warning {
    pub filename: Option<String>,
    pub kind: WarningKind,
    pub detail: String,
    /// Uploaded image whose record could not be saved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Warning {
    fn new(filename: Option<&str>, kind: WarningKind, detail: impl Into<String>) -> Self {
        Self {
            filename: filename.map(str::to_string),
            kind,
            detail: detail.into(),
            image_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterReport {
    pub usn: Usn,
    /// Images accepted by this call, in upload order.
    pub image_urls: Vec<String>,
    pub sharpnesses: Vec<f64>,
    pub gallery_size: usize,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum AttendanceStatus {
    Recorded {
        direction: Direction,
        at: DateTime<Utc>,
    },
    /// Recognized, but the ledger was not touched.
    Skipped { missing: Vec<&'static str> },
    NotCheckedIn,
}

/// What the check-in probe did to the recognized identity's gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum GalleryRefresh {
    Added {
        sharpness: f64,
    },
    Replaced {
        sharpness: f64,
        evicted_sharpness: f64,
    },
    Discarded {
        sharpness: f64,
        floor: f64,
    },
    TooBlurry {
        sharpness: f64,
        threshold: f64,
    },
    Failed {
        kind: WarningKind,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognizeOutcome {
    NoFace {
        message: String,
    },
    NoGallery,
    NoMatch {
        distance: f32,
    },
    AlreadyMarked {
        usn: Usn,
        distance: f32,
        direction: Direction,
        marked_at: DateTime<Utc>,
    },
    Success {
        usn: Usn,
        distance: f32,
        attendance: AttendanceStatus,
        gallery_refresh: Option<GalleryRefresh>,
    },
}

impl RecognizeOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::NoFace { .. } => "no-face",
            Self::NoGallery => "no-gallery",
            Self::NoMatch { .. } => "no-match",
            Self::AlreadyMarked { .. } => "already-marked",
            Self::Success { .. } => "success",
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            Self::NoFace { .. } | Self::NoGallery => None,
            Self::NoMatch { distance }
            | Self::AlreadyMarked { distance, .. }
            | Self::Success { distance, .. } => Some(*distance),
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("embedding engine failure: {0}")]
    Engine(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Pipeline {
    extractor: Arc<dyn FaceExtractor>,
    records: Arc<dyn RecordStore>,
    gallery: IdentityGallery,
    matcher: IdentityMatcher,
    ledger: AttendanceLedger,
    policy: Policy,
}

/// Result of running the extractor and quality scoring on one image.
enum Capture {
    Ready(GalleryCandidate),
    Rejected(WarningKind, String),
}

impl Pipeline {
    pub fn new(
        extractor: Arc<dyn FaceExtractor>,
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        policy: Policy,
    ) -> Self {
        Self {
            extractor,
            gallery: IdentityGallery::new(Arc::clone(&records), objects, &policy),
            matcher: IdentityMatcher::new(Arc::clone(&records)),
            ledger: AttendanceLedger::new(Arc::clone(&records)),
            records,
            policy,
        }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn gallery(&self) -> &IdentityGallery {
        &self.gallery
    }

    pub fn ledger(&self) -> &AttendanceLedger {
        &self.ledger
    }

    /// Enroll every usable image for `profile.usn`, then create or update
    /// the profile.
    pub async fn register(
        &self,
        profile: &IdentityProfile,
        images: Vec<UploadedImage>,
    ) -> Result<RegisterReport, PipelineError> {
        let usn = &profile.usn;
        let mut image_urls = Vec::new();
        let mut sharpnesses = Vec::new();
        let mut warnings = Vec::new();

        for image in images {
            let filename = image.filename.as_deref();
            let candidate = match self.capture(&image.bytes, EmbeddingSource::Register).await? {
                Capture::Ready(candidate) => candidate,
                Capture::Rejected(kind, detail) => {
                    tracing::warn!(usn = %usn, file = ?filename, ?kind, %detail, "image rejected");
                    warnings.push(Warning::new(filename, kind, detail));
                    continue;
                }
            };

            match self.gallery.insert(usn, candidate).await {
                Ok(InsertOutcome::Added { record }) | Ok(InsertOutcome::Replaced { record, .. }) => {
                    if let Some(image) = &record.image {
                        image_urls.push(image.url.clone());
                    }
                    sharpnesses.push(record.sharpness);
                }
                Ok(InsertOutcome::Discarded { sharpness, floor }) => {
                    warnings.push(Warning::new(
                        filename,
                        WarningKind::GalleryFull,
                        format!(
                            "gallery full; sharpness {sharpness:.1} does not beat the weakest stored image ({floor:.1})"
                        ),
                    ));
                }
                Ok(InsertOutcome::TooBlurry {
                    sharpness,
                    threshold,
                }) => {
                    warnings.push(Warning::new(
                        filename,
                        WarningKind::TooBlurry,
                        format!("too blurry (sharpness={sharpness:.1} < threshold={threshold})"),
                    ));
                }
                Err(e) => warnings.push(self.insert_failure(filename, e)?),
            }
        }

        if let Err(e) = self.records.upsert_identity(profile, Utc::now()).await {
            tracing::error!(usn = %usn, error = %e, "profile upsert failed");
            warnings.push(Warning::new(None, WarningKind::ProfileError, e.to_string()));
        } else if let Err(e) = self.records.refresh_image_urls(usn).await {
            tracing::warn!(usn = %usn, error = %e, "image list refresh failed");
        }

        let gallery_size = self.gallery.list(usn).await?.len();
        tracing::info!(
            usn = %usn,
            accepted = image_urls.len(),
            warnings = warnings.len(),
            gallery_size,
            "registration finished"
        );

        Ok(RegisterReport {
            usn: usn.clone(),
            image_urls,
            sharpnesses,
            gallery_size,
            warnings,
        })
    }

    /// Identify the face in `image` and, when the session context is
    /// complete, mark attendance. A recorded check-in also offers the probe
    /// to the identity's gallery.
    pub async fn recognize(
        &self,
        image: &[u8],
        session: &SessionContext,
    ) -> Result<RecognizeOutcome, PipelineError> {
        let probe = match self.extract(image).await? {
            Ok(probe) => probe,
            Err(message) => return Ok(RecognizeOutcome::NoFace { message }),
        };

        let found = match self.matcher.best_match(&probe.embedding).await {
            Ok(found) => found,
            Err(MatchError::NoGallery) => return Ok(RecognizeOutcome::NoGallery),
            Err(e @ MatchError::DimensionMismatch { .. }) => {
                return Err(PipelineError::Engine(e.to_string()))
            }
            Err(MatchError::Store(e)) => return Err(e.into()),
        };
        let distance = found.distance;
        if !found.is_confirmed(self.policy.distance_threshold) {
            tracing::info!(
                nearest = %found.usn,
                distance,
                threshold = self.policy.distance_threshold,
                "no match"
            );
            return Ok(RecognizeOutcome::NoMatch { distance });
        }
        let usn = found.usn;

        let mark = match session.complete() {
            Ok(mark) => mark,
            Err(missing) => {
                tracing::info!(usn = %usn, ?missing, "recognized, attendance skipped");
                return Ok(RecognizeOutcome::Success {
                    usn,
                    distance,
                    attendance: AttendanceStatus::Skipped { missing },
                    gallery_refresh: None,
                });
            }
        };

        if self.records.find_identity(&usn).await?.is_none() {
            tracing::warn!(usn = %usn, "matched embedding has no identity profile");
            return Ok(RecognizeOutcome::Success {
                usn,
                distance,
                attendance: AttendanceStatus::Skipped {
                    missing: vec!["identity"],
                },
                gallery_refresh: None,
            });
        }

        let attendance = match self.ledger.mark(&usn, &mark, Utc::now()).await? {
            MarkOutcome::Recorded(record) => AttendanceStatus::Recorded {
                direction: mark.direction,
                at: record.timestamp(mark.direction).unwrap_or_else(Utc::now),
            },
            MarkOutcome::AlreadyMarked { at } => {
                return Ok(RecognizeOutcome::AlreadyMarked {
                    usn,
                    distance,
                    direction: mark.direction,
                    marked_at: at,
                });
            }
            MarkOutcome::NotCheckedIn => AttendanceStatus::NotCheckedIn,
        };

        let gallery_refresh = match attendance {
            AttendanceStatus::Recorded {
                direction: Direction::CheckIn,
                ..
            } => Some(self.refresh_gallery(&usn, image, probe).await?),
            _ => None,
        };

        Ok(RecognizeOutcome::Success {
            usn,
            distance,
            attendance,
            gallery_refresh,
        })
    }

    /// Remove every stored embedding below the sharpness threshold.
    pub async fn cleanup_blurry(&self) -> Result<SweepReport, PipelineError> {
        Ok(self.gallery.sweep_below_threshold().await?)
    }

    async fn refresh_gallery(
        &self,
        usn: &Usn,
        image: &[u8],
        probe: FaceEmbedding,
    ) -> Result<GalleryRefresh, PipelineError> {
        let candidate = match self.score(image, probe, EmbeddingSource::CheckIn) {
            Capture::Ready(candidate) => candidate,
            Capture::Rejected(kind, detail) => return Ok(GalleryRefresh::Failed { kind, detail }),
        };

        Ok(match self.gallery.insert(usn, candidate).await {
            Ok(InsertOutcome::Added { record }) => GalleryRefresh::Added {
                sharpness: record.sharpness,
            },
            Ok(InsertOutcome::Replaced { record, evicted }) => GalleryRefresh::Replaced {
                sharpness: record.sharpness,
                evicted_sharpness: evicted
                    .iter()
                    .map(|r| r.sharpness)
                    .fold(f64::NEG_INFINITY, f64::max),
            },
            Ok(InsertOutcome::Discarded { sharpness, floor }) => {
                GalleryRefresh::Discarded { sharpness, floor }
            }
            Ok(InsertOutcome::TooBlurry {
                sharpness,
                threshold,
            }) => GalleryRefresh::TooBlurry {
                sharpness,
                threshold,
            },
            Err(e) => {
                let warning = self.insert_failure(None, e)?;
                GalleryRefresh::Failed {
                    kind: warning.kind,
                    detail: warning.detail,
                }
            }
        })
    }

    /// Run the extractor. The inner `Err` is a per-image "no face" message;
    /// the outer one is an engine failure.
    async fn extract(&self, image: &[u8]) -> Result<Result<FaceEmbedding, String>, PipelineError> {
        match self.extractor.detect_and_embed(image).await {
            Ok(found) => Ok(Ok(found)),
            Err(ExtractError::NoFaceDetected) => Ok(Err("No face detected in image.".to_string())),
            Err(ExtractError::UnreadableImage(detail)) => {
                Ok(Err(format!("Image could not be read: {detail}")))
            }
            Err(ExtractError::Engine(detail)) => Err(PipelineError::Engine(detail)),
        }
    }

    async fn capture(&self, image: &[u8], source: EmbeddingSource) -> Result<Capture, PipelineError> {
        Ok(match self.extract(image).await? {
            Ok(found) => self.score(image, found, source),
            Err(message) => Capture::Rejected(WarningKind::NoFace, message),
        })
    }

    fn score(&self, image: &[u8], found: FaceEmbedding, source: EmbeddingSource) -> Capture {
        let crop = self
            .gallery
            .gate()
            .score_face(image, &found.face, self.policy.crop_size);
        match crop {
            Ok(crop) => Capture::Ready(GalleryCandidate {
                embedding: found.embedding,
                crop_jpeg: crop.jpeg,
                sharpness: crop.sharpness,
                source,
            }),
            Err(e @ (CropError::Decode(_) | CropError::EmptyFace)) => {
                Capture::Rejected(WarningKind::NoFace, e.to_string())
            }
            Err(e @ CropError::Encode(_)) => Capture::Rejected(WarningKind::UploadError, e.to_string()),
        }
    }

    /// Turn a gallery error into a per-item warning. A dimension mismatch
    /// means the configured model does not match the store and is fatal.
    fn insert_failure(&self, filename: Option<&str>, err: GalleryError) -> Result<Warning, PipelineError> {
        let detail = err.to_string();
        Ok(match err {
            GalleryError::DimensionMismatch { .. } => return Err(PipelineError::Engine(detail)),
            GalleryError::Upload(_) => Warning::new(filename, WarningKind::UploadError, detail),
            GalleryError::Persistence { image_url, .. } => Warning {
                image_url,
                ..Warning::new(filename, WarningKind::PersistenceError, detail)
            },
        })
    }
}
