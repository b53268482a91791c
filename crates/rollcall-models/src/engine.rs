use crate::detector::FaceDetector;
use crate::embedder::FaceEmbedder;
use crate::liveness::{LivenessClassifier, MINIFASNET_INPUT_SIZE};
use crate::ModelError;
use async_trait::async_trait;
use image::RgbImage;
use rollcall_core::{
    Embedding, EmbeddingExtractor, ExternalError, FaceLocalizer, FaceRegion, LivenessModel,
};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("no liveness model loaded")]
    NoLivenessModel,
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<EngineError> for ExternalError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Model(m) => ExternalError::Failed(m.to_string()),
            other => ExternalError::Unavailable(other.to_string()),
        }
    }
}

/// Model files loaded by [`spawn_engine`].
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub detector: PathBuf,
    pub embedder: PathBuf,
    /// Only needed when liveness uses the trained classifier.
    pub liveness: Option<PathBuf>,
}

/// Messages sent from pipeline tasks to the engine thread.
enum EngineRequest {
    Detect {
        frame: RgbImage,
        reply: oneshot::Sender<Result<Vec<FaceRegion>, EngineError>>,
    },
    Embed {
        crop: RgbImage,
        reply: oneshot::Sender<Result<Embedding, EngineError>>,
    },
    Liveness {
        crop: RgbImage,
        reply: oneshot::Sender<Result<f32, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct ModelHandle {
    tx: mpsc::Sender<EngineRequest>,
    has_liveness: bool,
}

impl ModelHandle {
    pub fn has_liveness(&self) -> bool {
        self.has_liveness
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

#[async_trait]
impl FaceLocalizer for ModelHandle {
    async fn detect(&self, frame: &RgbImage) -> Result<Vec<FaceRegion>, ExternalError> {
        let frame = frame.clone();
        Ok(self
            .request(|reply| EngineRequest::Detect { frame, reply })
            .await?)
    }
}

#[async_trait]
impl EmbeddingExtractor for ModelHandle {
    async fn embed(&self, crop: &RgbImage) -> Result<Embedding, ExternalError> {
        let crop = crop.clone();
        Ok(self
            .request(|reply| EngineRequest::Embed { crop, reply })
            .await?)
    }
}

#[async_trait]
impl LivenessModel for ModelHandle {
    fn input_size(&self) -> (u32, u32) {
        (MINIFASNET_INPUT_SIZE, MINIFASNET_INPUT_SIZE)
    }

    async fn predict(&self, crop: &RgbImage) -> Result<f32, ExternalError> {
        if !self.has_liveness {
            return Err(EngineError::NoLivenessModel.into());
        }
        let crop = crop.clone();
        Ok(self
            .request(|reply| EngineRequest::Liveness { crop, reply })
            .await?)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads every configured ONNX model before returning, so a missing or
/// broken model file fails startup instead of the first request.
pub fn spawn_engine(paths: &ModelPaths) -> Result<ModelHandle, EngineError> {
    let mut detector = FaceDetector::load(&paths.detector)?;
    let mut embedder = FaceEmbedder::load(&paths.embedder)?;
    let mut liveness = paths
        .liveness
        .as_deref()
        .map(LivenessClassifier::load)
        .transpose()?;
    let has_liveness = liveness.is_some();

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(has_liveness, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Detect { frame, reply } => {
                        let result = detector
                            .detect(&frame)
                            .map(|dets| {
                                dets.iter()
                                    .filter_map(|d| d.to_region(frame.width(), frame.height()))
                                    .collect()
                            })
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                    EngineRequest::Embed { crop, reply } => {
                        let _ = reply.send(embedder.embed(&crop).map_err(EngineError::from));
                    }
                    EngineRequest::Liveness { crop, reply } => {
                        let result = match liveness.as_mut() {
                            Some(model) => model.predict(&crop).map_err(EngineError::from),
                            None => Err(EngineError::NoLivenessModel),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(ModelHandle { tx, has_liveness })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_fails_fast_on_missing_model() {
        let paths = ModelPaths {
            detector: PathBuf::from("/nonexistent/det_10g.onnx"),
            embedder: PathBuf::from("/nonexistent/w600k_r50.onnx"),
            liveness: None,
        };
        let err = spawn_engine(&paths).err().unwrap();
        assert!(matches!(err, EngineError::Model(ModelError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_closed_engine_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ModelHandle { tx, has_liveness: true };

        let err = handle.detect(&RgbImage::new(8, 8)).await.unwrap_err();
        assert!(matches!(err, ExternalError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_predict_without_liveness_model() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ModelHandle { tx, has_liveness: false };
        assert_eq!(handle.input_size(), (80, 80));
        let err = handle.predict(&RgbImage::new(80, 80)).await.unwrap_err();
        assert!(matches!(err, ExternalError::Unavailable(_)));
    }
}
