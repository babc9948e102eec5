#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use attend_core::{
    BoundingBox, Embedding, ExtractError, FaceEmbedding, FaceExtractor, Pipeline, Policy,
};
use attend_store::{FsObjectStore, SqliteStore};
use attendd::config::Config;
use attendd::state::AppState;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tempfile::TempDir;

pub const DIM: usize = 4;
pub const SIZE: u32 = 96;
pub const BOUNDARY: &str = "attend-test-boundary";

/// Extractor backed by a table of known image bytes. Unknown bytes have no
/// face. The face box always covers the whole image.
#[derive(Default)]
pub struct TableExtractor {
    table: Mutex<HashMap<Vec<u8>, Vec<f32>>>,
    broken: Mutex<bool>,
}

impl TableExtractor {
    pub fn learn(&self, image: &[u8], embedding: &[f32]) {
        self.table
            .lock()
            .unwrap()
            .insert(image.to_vec(), embedding.to_vec());
    }

    /// Make every subsequent call fail as if the engine thread died.
    pub fn break_engine(&self) {
        *self.broken.lock().unwrap() = true;
    }
}

#[async_trait]
impl FaceExtractor for TableExtractor {
    async fn detect_and_embed(&self, image: &[u8]) -> Result<FaceEmbedding, ExtractError> {
        if *self.broken.lock().unwrap() {
            return Err(ExtractError::Engine("engine thread exited".to_string()));
        }
        let values = self
            .table
            .lock()
            .unwrap()
            .get(image)
            .cloned()
            .ok_or(ExtractError::NoFaceDetected)?;
        Ok(FaceEmbedding {
            embedding: Embedding::new(values, "test"),
            face: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: SIZE as f32,
                height: SIZE as f32,
                confidence: 0.99,
                landmarks: None,
            },
        })
    }
}

fn png(image: GrayImage) -> Vec<u8> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(image)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

/// High-contrast checkerboard. `shade` varies the bytes between images.
pub fn sharp_image(shade: u8) -> Vec<u8> {
    png(GrayImage::from_fn(SIZE, SIZE, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            Luma([shade])
        } else {
            Luma([255])
        }
    }))
}

/// Flat image; Laplacian variance is zero.
pub fn blurry_image(shade: u8) -> Vec<u8> {
    png(GrayImage::from_pixel(SIZE, SIZE, Luma([shade])))
}

pub fn test_policy() -> Policy {
    Policy {
        embedding_dim: DIM,
        ..Policy::default()
    }
}

pub fn test_config(dir: &TempDir) -> Config {
    Config {
        db_path: dir.path().join("attend.db"),
        image_dir: dir.path().join("images"),
        public_base_url: "http://test/images".to_string(),
        embedding_dim: DIM,
        ..Config::default()
    }
}

pub struct TestApp {
    pub router: Router,
    pub pipeline: Arc<Pipeline>,
    pub extractor: Arc<TableExtractor>,
    pub store: Arc<SqliteStore>,
    pub dir: TempDir,
}

pub async fn build_test_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let extractor = Arc::new(TableExtractor::default());
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let objects = Arc::new(FsObjectStore::new(
        config.image_dir.clone(),
        config.public_base_url.clone(),
    ));
    let pipeline = Arc::new(Pipeline::new(
        extractor.clone(),
        store.clone(),
        objects,
        config.policy(),
    ));
    let state = AppState {
        pipeline: pipeline.clone(),
        config: Arc::new(config),
        model: "test".to_string(),
    };

    TestApp {
        router: attendd::build_router(state),
        pipeline,
        extractor,
        store,
        dir,
    }
}

/// One multipart part: a text field or a file.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a str, &'a [u8]),
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(name, filename, bytes) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                         Content-Type: image/png\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
