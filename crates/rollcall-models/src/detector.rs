//! SCRFD face localizer.
//!
//! Letterboxes the RGB frame to 640×640, decodes the three anchor strides
//! and suppresses overlaps. Landmark outputs are ignored: the embedder works
//! on the plain face box.

use crate::ModelError;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use rollcall_core::FaceRegion;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// A detected face before conversion to frame pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl Detection {
    /// Round to a pixel box clipped to the frame. `None` if nothing is left.
    pub fn to_region(&self, frame_width: u32, frame_height: u32) -> Option<FaceRegion> {
        let x1 = self.x.max(0.0).round() as u32;
        let y1 = self.y.max(0.0).round() as u32;
        let x2 = (self.x + self.width).max(0.0).round() as u32;
        let y2 = (self.y + self.height).max(0.0).round() as u32;
        let region = FaceRegion::new(x1, y1, x2.saturating_sub(x1), y2.saturating_sub(y1))
            .clamp_to(frame_width, frame_height);
        (region.width > 0 && region.height > 0).then_some(region)
    }
}

struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// (score, bbox) output indices for one stride.
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Session,
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, ModelError> {
        if !model_path.exists() {
            return Err(ModelError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();
        if output_names.len() < 6 {
            return Err(ModelError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                output_names.len()
            )));
        }
        let stride_outputs = discover_outputs(&output_names);

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            ?stride_outputs,
            "loaded SCRFD model"
        );
        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Faces in `frame`, most confident first.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>, ModelError> {
        let (input, letterbox) = preprocess(frame);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ModelError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            detections.extend(decode_stride(scores, bboxes, stride, &letterbox));
        }

        Ok(nms(detections, SCRFD_NMS_THRESHOLD))
    }
}

/// NCHW tensor of the letterboxed frame, padding at the mean (normalises to 0).
fn preprocess(frame: &RgbImage) -> (Array4<f32>, Letterbox) {
    let size = SCRFD_INPUT_SIZE as f32;
    let scale = (size / frame.width() as f32).min(size / frame.height() as f32);
    let new_w = ((frame.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((frame.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let pad_x = (SCRFD_INPUT_SIZE - new_w) / 2;
    let pad_y = (SCRFD_INPUT_SIZE - new_h) / 2;

    let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    let n = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, n, n));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (tx, ty) = ((x + pad_x) as usize, (y + pad_y) as usize);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (
        tensor,
        Letterbox {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Map stride slots to output tensors by name (`score_8`, `bbox_16`, ...),
/// falling back to the standard export order (scores 0-2, boxes 3-5).
fn discover_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let mut named = [(0, 0); 3];
    for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
        match (find("score", stride), find("bbox", stride)) {
            (Some(s), Some(b)) => named[slot] = (s, b),
            _ => return [(0, 3), (1, 4), (2, 5)],
        }
    }
    named
}

fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
) -> Vec<Detection> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let anchors = grid_w * grid_h * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = scores.get(idx).copied().unwrap_or(0.0);
            if score <= SCRFD_CONFIDENCE_THRESHOLD {
                return None;
            }
            let d = bboxes.get(idx * 4..idx * 4 + 4)?;

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let unmap_x = |v: f32| (v - letterbox.pad_x) / letterbox.scale;
            let unmap_y = |v: f32| (v - letterbox.pad_y) / letterbox.scale;
            let x1 = unmap_x(ax - d[0] * s);
            let y1 = unmap_y(ay - d[1] * s);
            let x2 = unmap_x(ax + d[2] * s);
            let y2 = unmap_y(ay + d[3] * s);

            Some(Detection {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &Detection, b: &Detection) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Detection {
        Detection { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_iou_partial() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert!(iou(&a, &det(20.0, 20.0, 5.0, 5.0, 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_overlap() {
        let kept = nms(
            vec![
                det(5.0, 5.0, 100.0, 100.0, 0.8),
                det(200.0, 200.0, 50.0, 50.0, 0.7),
                det(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let conf: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(conf, vec![0.9, 0.7]);
    }

    #[test]
    fn test_to_region_clips_to_frame() {
        let r = det(-10.4, 20.0, 100.0, 500.0, 0.9).to_region(640, 480).unwrap();
        assert_eq!(r, FaceRegion::new(0, 20, 90, 460));
        assert!(det(700.0, 10.0, 50.0, 50.0, 0.9).to_region(640, 480).is_none());
    }

    #[test]
    fn test_preprocess_letterbox() {
        let frame = RgbImage::from_pixel(320, 160, image::Rgb([255, 255, 255]));
        let (tensor, lb) = preprocess(&frame);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(lb.scale, 2.0);
        assert_eq!((lb.pad_x, lb.pad_y), (0.0, 160.0));
        // Padding rows normalise to zero, content rows do not.
        assert_eq!(tensor[[0, 0, 10, 10]], 0.0);
        assert!(tensor[[0, 0, 320, 320]] > 0.9);
    }

    #[test]
    fn test_decode_maps_back_through_letterbox() {
        // One hit at anchor (cell 0, anchor 0) of stride 8, box offsets of 1 stride.
        let mut scores = vec![0.0; 80 * 80 * 2];
        scores[0] = 0.95;
        let mut bboxes = vec![0.0; scores.len() * 4];
        bboxes[..4].copy_from_slice(&[0.0, 0.0, 2.0, 2.0]);
        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };

        let dets = decode_stride(&scores, &bboxes, 8, &lb);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0], det(0.0, 0.0, 8.0, 8.0, 0.95));
    }

    #[test]
    fn test_discover_outputs() {
        let named: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(discover_outputs(&named), [(1, 0), (3, 2), (5, 4)]);

        let numeric: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_outputs(&numeric), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceDetector::load(Path::new("/nonexistent/det_10g.onnx")).err().unwrap();
        assert!(matches!(err, ModelError::ModelNotFound(_)));
    }
}
