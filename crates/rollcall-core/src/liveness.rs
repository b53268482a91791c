//! Liveness gate: anti-spoofing score for a detected face.
//!
//! Two strategies satisfy the same contract, chosen when the pipeline is
//! built: a trained classifier run on an expanded, resized crop
//! ([`ModelLiveness`]), and an edge/contrast heuristic on the tight crop
//! ([`HeuristicLiveness`]). Both return a score in [0, 1] where higher
//! means more likely live.

use crate::external::{ExternalError, LivenessModel};
use crate::imaging;
use crate::types::FaceRegion;
use async_trait::async_trait;
use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_LIVENESS_THRESHOLD: f32 = 0.5;
/// Context around the tight box that the classifier was trained with.
const DEFAULT_CROP_SCALE: f32 = 1.35;
const DEFAULT_EDGE_DIVISOR: f32 = 350.0;
const DEFAULT_CONTRAST_DIVISOR: f32 = 80.0;
const EDGE_WEIGHT: f32 = 0.6;
const CONTRAST_WEIGHT: f32 = 0.4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Scores at or above this are live.
    pub threshold: f32,
    /// Dilation applied to the face box before classifier inference.
    pub crop_scale: f32,
    /// Laplacian variance that maps to a full edge score (heuristic).
    pub edge_divisor: f32,
    /// Intensity stddev that maps to a full contrast score (heuristic).
    pub contrast_divisor: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_LIVENESS_THRESHOLD,
            crop_scale: DEFAULT_CROP_SCALE,
            edge_divisor: DEFAULT_EDGE_DIVISOR,
            contrast_divisor: DEFAULT_CONTRAST_DIVISOR,
        }
    }
}

#[derive(Error, Debug)]
pub enum LivenessError {
    #[error("liveness model: {0}")]
    Model(#[from] ExternalError),
    #[error("liveness model timed out after {0:?}")]
    Timeout(Duration),
    #[error("liveness model returned a non-finite score")]
    NonFinite,
    #[error("face region lies outside the frame")]
    EmptyCrop,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LivenessScore {
    pub score: f32,
    pub is_live: bool,
}

impl LivenessScore {
    /// Classify a raw score. The threshold is inclusive.
    pub fn classify(score: f32, threshold: f32) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            score,
            is_live: score >= threshold,
        }
    }
}

/// A way of scoring a face for liveness.
#[async_trait]
pub trait LivenessStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Raw liveness score for `region` of `frame`; higher = more real.
    async fn score(&self, frame: &RgbImage, region: &FaceRegion) -> Result<f32, LivenessError>;
}

/// Applies the configured threshold to whichever strategy was selected.
#[derive(Clone)]
pub struct LivenessGate {
    strategy: Arc<dyn LivenessStrategy>,
    threshold: f32,
}

impl LivenessGate {
    pub fn new(strategy: Arc<dyn LivenessStrategy>, threshold: f32) -> Self {
        Self {
            strategy,
            threshold,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub async fn score(
        &self,
        frame: &RgbImage,
        region: &FaceRegion,
    ) -> Result<LivenessScore, LivenessError> {
        let raw = self.strategy.score(frame, region).await?;
        if !raw.is_finite() {
            return Err(LivenessError::NonFinite);
        }
        if !(0.0..=1.0).contains(&raw) {
            tracing::warn!(
                strategy = self.strategy.name(),
                raw,
                "liveness score outside [0, 1]; clamping"
            );
        }
        Ok(LivenessScore::classify(raw, self.threshold))
    }
}

/// Trained classifier on a context-expanded crop.
pub struct ModelLiveness {
    model: Arc<dyn LivenessModel>,
    crop_scale: f32,
    timeout: Duration,
}

impl ModelLiveness {
    pub fn new(model: Arc<dyn LivenessModel>, crop_scale: f32, timeout: Duration) -> Self {
        Self {
            model,
            crop_scale,
            timeout,
        }
    }

    /// Expand, crop and resize the face to the classifier's input size.
    fn prepare(&self, frame: &RgbImage, region: &FaceRegion) -> Option<RgbImage> {
        let expanded = region.expand(self.crop_scale, frame.width(), frame.height());
        if expanded.width == 0 || expanded.height == 0 {
            return None;
        }
        let crop = expanded.crop(frame);
        let (w, h) = self.model.input_size();
        Some(image::imageops::resize(&crop, w, h, FilterType::Triangle))
    }
}

#[async_trait]
impl LivenessStrategy for ModelLiveness {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn score(&self, frame: &RgbImage, region: &FaceRegion) -> Result<f32, LivenessError> {
        let input = self.prepare(frame, region).ok_or(LivenessError::EmptyCrop)?;
        tokio::time::timeout(self.timeout, self.model.predict(&input))
            .await
            .map_err(|_| LivenessError::Timeout(self.timeout))?
            .map_err(LivenessError::from)
    }
}

/// Edge-variance and contrast heuristic for hosts without a classifier.
///
/// Printed photos and screens replayed to a camera tend to lose fine texture
/// and dynamic range; live faces keep both.
pub struct HeuristicLiveness {
    edge_divisor: f32,
    contrast_divisor: f32,
}

impl HeuristicLiveness {
    pub fn new(edge_divisor: f32, contrast_divisor: f32) -> Self {
        Self {
            edge_divisor,
            contrast_divisor,
        }
    }

    pub fn from_config(config: &LivenessConfig) -> Self {
        Self::new(config.edge_divisor, config.contrast_divisor)
    }

    fn evaluate(&self, crop: &RgbImage) -> f32 {
        let gray = imaging::luma(crop);
        let edge = (imaging::laplacian_variance(&gray) / self.edge_divisor).min(1.0);
        let contrast = (imaging::intensity_stddev(&gray) / self.contrast_divisor).min(1.0);
        (EDGE_WEIGHT * edge + CONTRAST_WEIGHT * contrast).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl LivenessStrategy for HeuristicLiveness {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    async fn score(&self, frame: &RgbImage, region: &FaceRegion) -> Result<f32, LivenessError> {
        let crop = region.crop(frame);
        if crop.width() == 0 || crop.height() == 0 {
            return Err(LivenessError::EmptyCrop);
        }
        Ok(self.evaluate(&crop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::tests::{checkerboard, flat};
    use std::sync::Mutex;

    /// Records the crop it was given and answers with a fixed score.
    struct FixedModel {
        score: f32,
        seen: Mutex<Option<(u32, u32)>>,
        delay: Option<Duration>,
    }

    impl FixedModel {
        fn new(score: f32) -> Self {
            Self { score, seen: Mutex::new(None), delay: None }
        }
    }

    #[async_trait]
    impl LivenessModel for FixedModel {
        fn input_size(&self) -> (u32, u32) {
            (80, 80)
        }

        async fn predict(&self, crop: &RgbImage) -> Result<f32, ExternalError> {
            *self.seen.lock().unwrap() = Some(crop.dimensions());
            if let Some(d) = self.delay {
                tokio::time::sleep(d).await;
            }
            Ok(self.score)
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let s = LivenessScore::classify(0.5, 0.5);
        assert!(s.is_live);
        let s = LivenessScore::classify(0.4999, 0.5);
        assert!(!s.is_live);
    }

    #[test]
    fn test_classify_clamps() {
        assert_eq!(LivenessScore::classify(1.7, 0.5).score, 1.0);
        assert_eq!(LivenessScore::classify(-0.2, 0.5).score, 0.0);
    }

    #[tokio::test]
    async fn test_model_strategy_resizes_to_input() {
        let model = Arc::new(FixedModel::new(0.9));
        let strategy = ModelLiveness::new(model.clone(), 1.35, Duration::from_secs(1));
        let gate = LivenessGate::new(Arc::new(strategy), 0.5);

        let frame = checkerboard(640, 480, 4);
        let score = gate.score(&frame, &FaceRegion::new(200, 150, 120, 140)).await.unwrap();
        assert!(score.is_live);
        assert_eq!(*model.seen.lock().unwrap(), Some((80, 80)));
    }

    #[tokio::test]
    async fn test_model_strategy_at_threshold_is_live() {
        let strategy = ModelLiveness::new(Arc::new(FixedModel::new(0.5)), 1.35, Duration::from_secs(1));
        let gate = LivenessGate::new(Arc::new(strategy), 0.5);
        let frame = flat(100, 100, 90);
        let score = gate.score(&frame, &FaceRegion::new(10, 10, 50, 50)).await.unwrap();
        assert!(score.is_live);
        assert_eq!(score.score, 0.5);
    }

    #[tokio::test]
    async fn test_model_strategy_empty_crop() {
        let strategy = ModelLiveness::new(Arc::new(FixedModel::new(0.9)), 1.35, Duration::from_secs(1));
        let frame = flat(100, 100, 90);
        let err = strategy.score(&frame, &FaceRegion::new(200, 200, 50, 50)).await;
        assert!(matches!(err, Err(LivenessError::EmptyCrop)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_strategy_timeout() {
        let mut model = FixedModel::new(0.9);
        model.delay = Some(Duration::from_secs(30));
        let strategy = ModelLiveness::new(Arc::new(model), 1.35, Duration::from_secs(2));
        let frame = flat(100, 100, 90);
        let err = strategy.score(&frame, &FaceRegion::new(10, 10, 50, 50)).await;
        assert!(matches!(err, Err(LivenessError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_non_finite_score_is_error() {
        let strategy = ModelLiveness::new(Arc::new(FixedModel::new(f32::NAN)), 1.35, Duration::from_secs(1));
        let gate = LivenessGate::new(Arc::new(strategy), 0.5);
        let frame = flat(100, 100, 90);
        let err = gate.score(&frame, &FaceRegion::new(10, 10, 50, 50)).await;
        assert!(matches!(err, Err(LivenessError::NonFinite)));
    }

    #[tokio::test]
    async fn test_heuristic_flat_crop_scores_zero() {
        let gate = LivenessGate::new(Arc::new(HeuristicLiveness::new(350.0, 80.0)), 0.5);
        let frame = flat(200, 200, 128);
        let score = gate.score(&frame, &FaceRegion::new(20, 20, 100, 100)).await.unwrap();
        assert_eq!(score.score, 0.0);
        assert!(!score.is_live);
    }

    #[tokio::test]
    async fn test_heuristic_textured_crop_saturates() {
        let gate = LivenessGate::new(Arc::new(HeuristicLiveness::new(350.0, 80.0)), 0.5);
        let frame = checkerboard(200, 200, 2);
        let score = gate.score(&frame, &FaceRegion::new(20, 20, 100, 100)).await.unwrap();
        // Both components cap at 1.0 → 0.6 + 0.4
        assert!((score.score - 1.0).abs() < 1e-6);
        assert!(score.is_live);
    }

    #[test]
    fn test_heuristic_weights() {
        // Contrast only: a smooth horizontal ramp has near-zero Laplacian
        // but a wide intensity spread.
        let h = HeuristicLiveness::new(350.0, 50.0);
        let ramp = RgbImage::from_fn(256, 16, |x, _| image::Rgb([x as u8, x as u8, x as u8]));
        let s = h.evaluate(&ramp);
        assert!((s - CONTRAST_WEIGHT).abs() < 0.01, "score = {s}");
    }
}
