//! Focus measure for face crops.
//!
//! Sharpness is the variance of the 3×3 Laplacian of the grayscale crop.
//! Borders reflect without repeating the edge pixel (`dcb|abcd|cba`).
//! Stored crops are scored after JPEG encoding, so the recorded value
//! describes the bytes that are kept.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use thiserror::Error;

use crate::types::BoundingBox;

#[derive(Error, Debug)]
pub enum CropError {
    #[error("image could not be decoded: {0}")]
    Decode(#[source] image::ImageError),
    #[error("face box lies outside the image")]
    EmptyFace,
    #[error("crop could not be encoded: {0}")]
    Encode(#[source] image::ImageError),
}

/// A face crop ready for the object store, with its score.
#[derive(Debug, Clone)]
pub struct ScoredCrop {
    /// JPEG-encoded, `crop_size`×`crop_size`.
    pub jpeg: Vec<u8>,
    pub sharpness: f64,
}

/// Accepts or rejects face crops by sharpness.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    threshold: f64,
}

impl QualityGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Sharpness of an image. Higher = sharper.
    pub fn score(&self, image: &DynamicImage) -> f64 {
        laplacian_variance(&to_gray(image))
    }

    /// Inclusive: a score equal to the threshold passes.
    pub fn accepts(&self, sharpness: f64) -> bool {
        sharpness >= self.threshold
    }

    /// Decode `image_bytes`, crop `face`, resize to `crop_size` and
    /// JPEG-encode the crop. The score is taken from the decoded JPEG.
    pub fn score_face(
        &self,
        image_bytes: &[u8],
        face: &BoundingBox,
        crop_size: u32,
    ) -> Result<ScoredCrop, CropError> {
        let image = image::load_from_memory(image_bytes).map_err(CropError::Decode)?;
        let crop = crop_face(&image, face, crop_size).ok_or(CropError::EmptyFace)?;
        let jpeg = encode_jpeg(&crop).map_err(CropError::Encode)?;
        let stored = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg)
            .map_err(CropError::Decode)?;
        let sharpness = self.score(&stored);
        Ok(ScoredCrop { jpeg, sharpness })
    }
}

/// Crop the face box (clamped to the image) and resize it to a square.
///
/// Returns `None` when the clamped box is empty.
pub fn crop_face(image: &DynamicImage, face: &BoundingBox, size: u32) -> Option<DynamicImage> {
    let (w, h) = (image.width() as f32, image.height() as f32);
    let x0 = face.x.floor().clamp(0.0, w);
    let y0 = face.y.floor().clamp(0.0, h);
    let x1 = (face.x + face.width).ceil().clamp(0.0, w);
    let y1 = (face.y + face.height).ceil().clamp(0.0, h);
    if x1 - x0 < 1.0 || y1 - y0 < 1.0 {
        return None;
    }

    let cropped = image.crop_imm(x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32);
    Some(cropped.resize_exact(size, size, FilterType::CatmullRom))
}

pub fn encode_jpeg(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(image.to_rgb8());
    let mut buf = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)?;
    Ok(buf)
}

/// ITU-R 601-2 luma with rounding, `L = (299 R + 587 G + 114 B) / 1000`.
pub fn to_gray(image: &DynamicImage) -> GrayImage {
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let [r, g, b] = rgb.get_pixel(x, y).0;
        let l = (u32::from(r) * 19595 + u32::from(g) * 38470 + u32::from(b) * 7471 + 0x8000) >> 16;
        Luma([l as u8])
    })
}

/// Population variance of the 4-neighbour Laplacian over every pixel.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    if w == 0 || h == 0 {
        return 0.0;
    }

    let px = |x: i64, y: i64| -> f64 {
        f64::from(gray.get_pixel(reflect_101(x, w) as u32, reflect_101(y, h) as u32)[0])
    };

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for y in 0..h {
        for x in 0..w {
            let lap = px(x, y - 1) + px(x - 1, y) + px(x + 1, y) + px(x, y + 1) - 4.0 * px(x, y);
            sum += lap;
            sum_sq += lap * lap;
        }
    }

    let n = (w * h) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Mirror an out-of-range index by one step, excluding the edge itself.
fn reflect_101(i: i64, len: i64) -> i64 {
    if len == 1 {
        return 0;
    }
    if i < 0 {
        -i
    } else if i >= len {
        2 * (len - 1) - i
    } else {
        i
    }
}
