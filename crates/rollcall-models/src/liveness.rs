//! MiniFASNet anti-spoofing classifier.
//!
//! Expects an 80×80 BGR crop with raw 0-255 intensities and emits three
//! class logits; index 1 is the "real face" class.

use crate::ModelError;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

pub const MINIFASNET_INPUT_SIZE: u32 = 80;
const MINIFASNET_REAL_CLASS: usize = 1;

pub struct LivenessClassifier {
    session: Session,
}

impl LivenessClassifier {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded MiniFASNet model");
        Ok(Self { session })
    }

    /// Probability that `crop` shows a live face.
    pub fn predict(&mut self, crop: &RgbImage) -> Result<f32, ModelError> {
        let input = preprocess(crop);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::InferenceFailed(format!("liveness logits: {e}")))?;
        real_probability(logits)
    }
}

fn preprocess(crop: &RgbImage) -> Array4<f32> {
    let size = MINIFASNET_INPUT_SIZE;
    let resized;
    let input = if crop.dimensions() == (size, size) {
        crop
    } else {
        resized = image::imageops::resize(crop, size, size, FilterType::Triangle);
        &resized
    };

    let n = size as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in input.enumerate_pixels() {
        // RGB -> BGR
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[2 - c] as f32;
        }
    }
    tensor
}

fn real_probability(logits: &[f32]) -> Result<f32, ModelError> {
    if logits.len() <= MINIFASNET_REAL_CLASS {
        return Err(ModelError::InferenceFailed(format!(
            "expected at least {} class logits, got {}",
            MINIFASNET_REAL_CLASS + 1,
            logits.len()
        )));
    }
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    Ok((logits[MINIFASNET_REAL_CLASS] - max).exp() / sum)
}
