//! Enrollment of reference embeddings.
//!
//! Each sample frame contributes at most one embedding: its largest face,
//! and only if that face passes the same quality and liveness gates a
//! recognition would apply.

use crate::external::ReferenceWriter;
use crate::pipeline::Pipeline;
use crate::quality::{self, QualityReason};
use crate::types::{FaceRegion, IdentityId, ReferenceEntry};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SampleOutcome {
    Enrolled { region: FaceRegion, liveness_score: f32 },
    NoFace,
    Quality { reason: QualityReason },
    Spoof { liveness_score: f32 },
    LivenessUnavailable,
    EmbeddingFailed,
    StoreFailed { error: String },
}

impl SampleOutcome {
    pub fn is_enrolled(&self) -> bool {
        matches!(self, SampleOutcome::Enrolled { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentReport {
    pub identity_id: IdentityId,
    pub samples: Vec<SampleOutcome>,
    pub accepted: usize,
    pub rejected: usize,
}

pub struct Enroller {
    pipeline: Pipeline,
    writer: Arc<dyn ReferenceWriter>,
}

impl Enroller {
    /// Enroll through `pipeline`'s localizer, gates and extractor.
    pub fn new(pipeline: Pipeline, writer: Arc<dyn ReferenceWriter>) -> Self {
        Self { pipeline, writer }
    }

    pub async fn enroll(&self, identity_id: &str, samples: &[RgbImage]) -> EnrollmentReport {
        let mut outcomes = Vec::with_capacity(samples.len());
        for (index, frame) in samples.iter().enumerate() {
            let outcome = self.enroll_sample(identity_id, frame).await;
            tracing::debug!(identity = identity_id, sample = index, ?outcome, "enrollment sample");
            outcomes.push(outcome);
        }

        let accepted = outcomes.iter().filter(|o| o.is_enrolled()).count();
        let report = EnrollmentReport {
            identity_id: identity_id.to_string(),
            rejected: outcomes.len() - accepted,
            accepted,
            samples: outcomes,
        };
        tracing::info!(
            identity = identity_id,
            accepted = report.accepted,
            rejected = report.rejected,
            "enrollment finished"
        );
        report
    }

    async fn enroll_sample(&self, identity_id: &str, frame: &RgbImage) -> SampleOutcome {
        let region = match self.pipeline.detect(frame).await {
            Some(regions) => match regions.into_iter().max_by_key(FaceRegion::area) {
                Some(region) => region,
                None => return SampleOutcome::NoFace,
            },
            None => return SampleOutcome::NoFace,
        };

        let report = quality::evaluate(&region, frame, &self.pipeline.config().quality);
        if let Some(reason) = report.reason {
            return SampleOutcome::Quality { reason };
        }

        let liveness = match self.pipeline.liveness().score(frame, &region).await {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(identity = identity_id, error = %e, "liveness scoring failed");
                return SampleOutcome::LivenessUnavailable;
            }
        };
        if !liveness.is_live {
            tracing::warn!(identity = identity_id, score = liveness.score, "spoofed enrollment sample");
            return SampleOutcome::Spoof {
                liveness_score: liveness.score,
            };
        }

        let Some(embedding) = self.pipeline.embed(&region.crop(frame)).await else {
            return SampleOutcome::EmbeddingFailed;
        };

        match self
            .writer
            .add_reference(ReferenceEntry::new(identity_id, embedding))
            .await
        {
            Ok(()) => SampleOutcome::Enrolled {
                region,
                liveness_score: liveness.score,
            },
            Err(e) => SampleOutcome::StoreFailed {
                error: e.to_string(),
            },
        }
    }
}
