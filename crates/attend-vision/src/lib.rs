//! attend-vision — Face detection and embedding.
//!
//! SCRFD finds faces, ArcFace embeds the most confident one. Both run on
//! ONNX Runtime on the CPU. Sessions need `&mut`, so callers keep an
//! [`OnnxExtractor`] on one thread (see `attendd::engine`).

pub mod alignment;
pub mod detector;
pub mod recognizer;

use std::path::Path;

use attend_core::{BoundingBox, ExtractError, FaceEmbedding};
use image::DynamicImage;
use thiserror::Error;

pub use detector::{DetectorError, FaceDetector};
pub use recognizer::{FaceRecognizer, RecognizerError, ARCFACE_EMBEDDING_DIM, ARCFACE_MODEL_TAG};

pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Detector + recognizer pair.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, VisionError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }

    pub fn model_tag(&self) -> &'static str {
        ARCFACE_MODEL_TAG
    }

    /// Decode `bytes` and embed the most confident face.
    pub fn extract(&mut self, bytes: &[u8]) -> Result<FaceEmbedding, ExtractError> {
        let image = image::load_from_memory(bytes)
            .map_err(|e| ExtractError::UnreadableImage(e.to_string()))?;
        self.extract_image(&image)
    }

    pub fn extract_image(&mut self, image: &DynamicImage) -> Result<FaceEmbedding, ExtractError> {
        let rgb = image.to_rgb8();
        let faces = self
            .detector
            .detect(&rgb)
            .map_err(|e| ExtractError::Engine(e.to_string()))?;
        let face = most_confident(faces).ok_or(ExtractError::NoFaceDetected)?;

        let embedding = match self.recognizer.embed(&rgb, &face) {
            Ok(embedding) => embedding,
            Err(RecognizerError::NoLandmarks) => return Err(ExtractError::NoFaceDetected),
            Err(e) => return Err(ExtractError::Engine(e.to_string())),
        };

        tracing::debug!(
            confidence = face.confidence,
            x = face.x,
            y = face.y,
            width = face.width,
            height = face.height,
            "face embedded"
        );
        Ok(FaceEmbedding { embedding, face })
    }
}

/// Only one face per image is used; extra faces are ignored.
fn most_confident(faces: Vec<BoundingBox>) -> Option<BoundingBox> {
    faces
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}
