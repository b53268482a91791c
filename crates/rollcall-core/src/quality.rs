//! Face quality filter: size bounds and sharpness.

use crate::imaging;
use crate::types::FaceRegion;
use image::RgbImage;
use serde::{Deserialize, Serialize};

const DEFAULT_MIN_FACE_SIZE: u32 = 80;
const DEFAULT_MAX_FACE_SIZE: u32 = 1200;
const DEFAULT_BLUR_THRESHOLD: f32 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Smallest accepted face width or height, in pixels.
    pub min_face_size: u32,
    /// Largest accepted face width or height, in pixels.
    pub max_face_size: u32,
    /// Minimum Laplacian variance of the face luminance.
    pub blur_threshold: f32,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            max_face_size: DEFAULT_MAX_FACE_SIZE,
            blur_threshold: DEFAULT_BLUR_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityReason {
    TooSmall,
    TooLarge,
    Blurry,
    /// No pixel of the region lies inside the frame.
    OutOfFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub passed: bool,
    /// Why the face was rejected; `None` when it passed.
    pub reason: Option<QualityReason>,
    /// Laplacian variance of the crop. Zero when size checks failed first.
    pub blur_score: f32,
}

impl QualityReport {
    fn rejected(reason: QualityReason, blur_score: f32) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
            blur_score,
        }
    }
}

/// Evaluate whether a detected face is usable for recognition.
///
/// Size is checked on the detected box itself, before any pixels are read,
/// so undersized faces are always `TooSmall` and oversized ones `TooLarge`
/// even when the frame edge cuts them off. Sharpness is measured on the
/// part of the box that lies inside the frame.
pub fn evaluate(region: &FaceRegion, frame: &RgbImage, config: &QualityConfig) -> QualityReport {
    if region.width < config.min_face_size || region.height < config.min_face_size {
        return QualityReport::rejected(QualityReason::TooSmall, 0.0);
    }
    if region.width > config.max_face_size || region.height > config.max_face_size {
        return QualityReport::rejected(QualityReason::TooLarge, 0.0);
    }

    let visible = region.clamp_to(frame.width(), frame.height());
    if visible.width == 0 || visible.height == 0 {
        return QualityReport::rejected(QualityReason::OutOfFrame, 0.0);
    }

    let gray = imaging::luma(&visible.crop(frame));
    let blur_score = imaging::laplacian_variance(&gray);
    if blur_score < config.blur_threshold {
        return QualityReport::rejected(QualityReason::Blurry, blur_score);
    }

    QualityReport {
        passed: true,
        reason: None,
        blur_score,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::tests::{checkerboard, flat};

    fn config() -> QualityConfig {
        QualityConfig {
            min_face_size: 40,
            max_face_size: 200,
            blur_threshold: 30.0,
        }
    }

    #[test]
    fn test_sharp_face_passes() {
        let frame = checkerboard(320, 240, 3);
        let report = evaluate(&FaceRegion::new(10, 10, 100, 100), &frame, &config());
        assert!(report.passed);
        assert!(report.reason.is_none());
        assert!(report.blur_score >= 30.0);
    }

    #[test]
    fn test_too_small_regardless_of_content() {
        for frame in [checkerboard(320, 240, 3), flat(320, 240, 0)] {
            let report = evaluate(&FaceRegion::new(10, 10, 39, 100), &frame, &config());
            assert!(!report.passed);
            assert_eq!(report.reason, Some(QualityReason::TooSmall));

            let report = evaluate(&FaceRegion::new(10, 10, 100, 12), &frame, &config());
            assert_eq!(report.reason, Some(QualityReason::TooSmall));
        }
    }

    #[test]
    fn test_too_large() {
        let frame = checkerboard(640, 480, 3);
        let report = evaluate(&FaceRegion::new(0, 0, 300, 150), &frame, &config());
        assert!(!report.passed);
        assert_eq!(report.reason, Some(QualityReason::TooLarge));
    }

    #[test]
    fn test_blurry_face_rejected() {
        let frame = flat(320, 240, 128);
        let report = evaluate(&FaceRegion::new(10, 10, 100, 100), &frame, &config());
        assert!(!report.passed);
        assert_eq!(report.reason, Some(QualityReason::Blurry));
        assert_eq!(report.blur_score, 0.0);
    }

    #[test]
    fn test_size_uses_detected_box_not_visible_part() {
        let defaults = QualityConfig::default();

        // A 100px face with only 40px inside the frame is still big enough.
        let frame = checkerboard(640, 480, 2);
        let report = evaluate(&FaceRegion::new(600, 100, 100, 100), &frame, &defaults);
        assert!(report.passed, "{report:?}");
        assert!(report.blur_score >= defaults.blur_threshold);

        // An oversized face cut off by the frame edge is still too large.
        let frame = checkerboard(1200, 1200, 2);
        let report = evaluate(&FaceRegion::new(0, 0, 1250, 1250), &frame, &defaults);
        assert_eq!(report.reason, Some(QualityReason::TooLarge));
    }

    #[test]
    fn test_region_outside_frame() {
        let frame = checkerboard(120, 120, 3);
        let report = evaluate(&FaceRegion::new(200, 0, 100, 100), &frame, &config());
        assert!(!report.passed);
        assert_eq!(report.reason, Some(QualityReason::OutOfFrame));
    }

    #[test]
    fn test_boundary_sizes_inclusive() {
        let frame = checkerboard(640, 480, 3);
        assert!(evaluate(&FaceRegion::new(0, 0, 40, 40), &frame, &config()).passed);
        assert!(evaluate(&FaceRegion::new(0, 0, 200, 200), &frame, &config()).passed);
    }
}
