use serde::{Deserialize, Serialize};

/// Upper bound on reference embeddings kept per identity.
pub const MAX_GALLERY_SIZE: usize = 5;
/// Minimum Laplacian variance for a usable face crop.
pub const DEFAULT_SHARPNESS_THRESHOLD: f64 = 100.0;
/// Maximum cosine distance for a confirmed match. Calibrated for a 512-d
/// face embedding; recalibrate when the model changes.
pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_EMBEDDING_DIM: usize = 512;
/// Side length of the square face crop that is scored and stored.
pub const DEFAULT_CROP_SIZE: u32 = 224;

/// Tunables shared by every component of the pipeline.
///
/// One sharpness threshold serves registration, check-in refresh and the
/// cleanup sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub sharpness_threshold: f64,
    pub distance_threshold: f32,
    pub max_gallery_size: usize,
    pub embedding_dim: usize,
    pub crop_size: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            sharpness_threshold: DEFAULT_SHARPNESS_THRESHOLD,
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            max_gallery_size: MAX_GALLERY_SIZE,
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            crop_size: DEFAULT_CROP_SIZE,
        }
    }
}
