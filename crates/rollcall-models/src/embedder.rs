//! ArcFace embedding extractor.
//!
//! Extracts 512-dimensional, L2-normalised embeddings from face crops using
//! the w600k_r50 ArcFace model.

use crate::ModelError;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::Embedding;
use std::path::Path;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // symmetric, unlike SCRFD's 128.0
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";

pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );
        Ok(Self { session })
    }

    pub fn embed(&mut self, crop: &RgbImage) -> Result<Embedding, ModelError> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ModelError::InferenceFailed("empty face crop".into()));
        }
        let input = preprocess(crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("embedding extraction: {e}")))?;
        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(ModelError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw.to_vec()),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

/// Resize to 112×112 and normalise into an NCHW tensor.
fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let resized = image::imageops::resize(crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
    let n = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(values: Vec<f32>) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.into_iter().map(|x| x / norm).collect()
    } else {
        values
    }
}
