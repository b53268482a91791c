use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Identifier of an enrolled person, as issued by the reference store.
pub type IdentityId = String;

/// Confirmation and attendance key used when no subject context is given.
pub const GLOBAL_SUBJECT: &str = "global";

/// Canonical subject context for keying confirmation and attendance.
///
/// Blank strings and [`GLOBAL_SUBJECT`] mean "no subject" and map to `None`;
/// anything else is trimmed.
pub fn normalize_subject(subject_context: Option<&str>) -> Option<&str> {
    match subject_context.map(str::trim) {
        Some(s) if !s.is_empty() && s != GLOBAL_SUBJECT => Some(s),
        _ => None,
    }
}

/// Axis-aligned face bounding box in source-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FaceRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Intersect the region with a `frame_width` × `frame_height` frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> FaceRegion {
        let x = self.x.min(frame_width);
        let y = self.y.min(frame_height);
        let right = self.x.saturating_add(self.width).min(frame_width);
        let bottom = self.y.saturating_add(self.height).min(frame_height);
        FaceRegion {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }

    /// Dilate the region by `scale` around its centre, clamped to the frame.
    ///
    /// The expanded box keeps its top-left inside the frame and is then
    /// shortened to fit, so it may lose symmetry near the edges.
    pub fn expand(&self, scale: f32, frame_width: u32, frame_height: u32) -> FaceRegion {
        let new_w = (self.width as f32 * scale) as i64;
        let new_h = (self.height as f32 * scale) as i64;
        let new_x = (self.x as i64 - (new_w - self.width as i64) / 2).max(0);
        let new_y = (self.y as i64 - (new_h - self.height as i64) / 2).max(0);
        let new_w = new_w.min(frame_width as i64 - new_x).max(0);
        let new_h = new_h.min(frame_height as i64 - new_y).max(0);

        FaceRegion {
            x: new_x.min(frame_width as i64) as u32,
            y: new_y.min(frame_height as i64) as u32,
            width: new_w as u32,
            height: new_h as u32,
        }
    }

    /// Copy the region's pixels out of `frame`. Out-of-frame parts are dropped.
    pub fn crop(&self, frame: &RgbImage) -> RgbImage {
        let r = self.clamp_to(frame.width(), frame.height());
        image::imageops::crop_imm(frame, r.x, r.y, r.width, r.height).to_image()
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector is
    /// similar to nothing (0.0).
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled sample in the reference set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub identity_id: IdentityId,
    pub embedding: Embedding,
}

impl ReferenceEntry {
    pub fn new(identity_id: impl Into<IdentityId>, embedding: Embedding) -> Self {
        Self {
            identity_id: identity_id.into(),
            embedding,
        }
    }
}

/// A ranked identity match for a query embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity_id: IdentityId,
    /// Cosine similarity of the identity's best reference sample [-1, 1].
    pub similarity: f32,
    /// Euclidean distance to that same sample.
    pub distance: f32,
}
