//! Boundary to the face detector + embedding model.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{BoundingBox, Embedding};

/// The single face found in an image and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceEmbedding {
    pub embedding: Embedding,
    pub face: BoundingBox,
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("image could not be decoded: {0}")]
    UnreadableImage(String),
    /// The inference backend itself failed; not attributable to the image.
    #[error("embedding engine failure: {0}")]
    Engine(String),
}

/// Detects the most confident face in an encoded image and embeds it.
#[async_trait]
pub trait FaceExtractor: Send + Sync {
    async fn detect_and_embed(&self, image: &[u8]) -> Result<FaceEmbedding, ExtractError>;
}
