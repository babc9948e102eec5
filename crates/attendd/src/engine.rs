use std::path::Path;

use async_trait::async_trait;
use attend_core::{ExtractError, FaceEmbedding, FaceExtractor};
use attend_vision::{OnnxExtractor, VisionError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Vision(#[from] VisionError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<FaceEmbedding, ExtractError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    model: &'static str,
}

impl EngineHandle {
    /// Tag of the embedding model loaded on the engine thread.
    pub fn model(&self) -> &'static str {
        self.model
    }

    async fn extract(&self, image: Vec<u8>) -> Result<Result<FaceEmbedding, ExtractError>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

#[async_trait]
impl FaceExtractor for EngineHandle {
    async fn detect_and_embed(&self, image: &[u8]) -> Result<FaceEmbedding, ExtractError> {
        self.extract(image.to_vec())
            .await
            .map_err(|e| ExtractError::Engine(e.to_string()))?
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads both ONNX models synchronously so startup fails fast when either
/// is missing, then serves extraction requests one at a time.
pub fn spawn_engine(model_dir: &Path) -> Result<EngineHandle, EngineError> {
    let mut extractor = OnnxExtractor::load(model_dir)?;
    let model = extractor.model_tag();
    tracing::info!(dir = %model_dir.display(), model, "face models loaded");

    spawn_worker(model, move |image| extractor.extract(image))
}

/// Run `extract` on its own thread behind an [`EngineHandle`].
pub fn spawn_worker<F>(model: &'static str, mut extract: F) -> Result<EngineHandle, EngineError>
where
    F: FnMut(&[u8]) -> Result<FaceEmbedding, ExtractError> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("attend-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(request) = rx.blocking_recv() {
                match request {
                    EngineRequest::Extract { image, reply } => {
                        let result = extract(&image);
                        if let Err(e) = &result {
                            tracing::debug!(error = %e, "extraction rejected");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx, model })
}

#[cfg(test)]
mod tests {
    use super::*;
    use attend_core::{BoundingBox, Embedding};

    fn face() -> BoundingBox {
        BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 4.0,
            height: 4.0,
            confidence: 0.9,
            landmarks: None,
        }
    }

    #[tokio::test]
    async fn test_worker_answers_requests() {
        let handle = spawn_worker("test", |image| {
            if image.is_empty() {
                return Err(ExtractError::NoFaceDetected);
            }
            Ok(FaceEmbedding {
                embedding: Embedding::new(vec![image.len() as f32, 0.0], "test"),
                face: face(),
            })
        })
        .unwrap();

        let got = handle.detect_and_embed(&[1, 2, 3]).await.unwrap();
        assert_eq!(got.embedding.values, vec![3.0, 0.0]);
        assert!(matches!(
            handle.detect_and_embed(&[]).await,
            Err(ExtractError::NoFaceDetected)
        ));
        assert_eq!(handle.model(), "test");
    }

    #[tokio::test]
    async fn test_panicked_worker_reports_engine_failure() {
        let handle = spawn_worker("test", |_| panic!("inference crashed")).unwrap();
        let err = handle.detect_and_embed(&[0]).await.unwrap_err();
        assert!(matches!(err, ExtractError::Engine(_)));
    }
}
