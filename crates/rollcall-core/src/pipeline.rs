//! Pipeline orchestrator.
//!
//! Runs every face of a frame through the gates in order:
//!
//! ```text
//! quality → liveness → embedding → matcher → validator → confirmation → commit
//! ```
//!
//! A failing gate short-circuits that face to a typed rejection. Faces of
//! one frame run concurrently and never affect each other; the frame result
//! lists them in localizer order.

use crate::attendance::{AttendanceCommitter, CommitOutcome};
use crate::audit::{AuditEntry, AuditLogger, AuditReason};
use crate::config::{ConfigError, PipelineConfig};
use crate::confirmation::{Confirmation, ConfirmationBuffer};
use crate::external::{
    AttendanceStore, AuditStore, EmbeddingExtractor, FaceLocalizer, LivenessModel, ReferenceStore,
};
use crate::liveness::{HeuristicLiveness, LivenessGate, LivenessStrategy, ModelLiveness};
use crate::matcher::IdentityMatcher;
use crate::quality::{self, QualityReason};
use crate::types::{Embedding, FaceRegion, IdentityId};
use crate::validator::{ConfidenceValidator, ValidationStage};
use chrono::NaiveDate;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is missing its {0}")]
    MissingComponent(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("frame could not be decoded: {0}")]
    MalformedFrame(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceOutcome {
    Spoof,
    Unknown,
    Recognized,
}

/// Why a face did not reach the confirmation buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    Quality { reason: QualityReason },
    LivenessUnavailable,
    EmbeddingFailed,
    MatchingFailed,
    NoMatch,
    Validation { stage: ValidationStage },
}

/// What happened to attendance for a recognized face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AttendanceMark {
    /// Waiting for more sightings.
    Pending { sightings: u32, required: u32 },
    /// Confidence fell under the confirmation threshold.
    Reset,
    Marked { record_id: Uuid },
    AlreadyMarked,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub region: FaceRegion,
    pub outcome: FaceOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<IdentityId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<Rejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attendance: Option<AttendanceMark>,
}

impl FaceResult {
    fn new(region: FaceRegion, outcome: FaceOutcome) -> Self {
        Self {
            region,
            outcome,
            identity_id: None,
            confidence: None,
            liveness_score: None,
            rejection: None,
            attendance: None,
        }
    }

    fn unknown(region: FaceRegion, liveness_score: Option<f32>, rejection: Rejection) -> Self {
        Self {
            liveness_score,
            rejection: Some(rejection),
            ..Self::new(region, FaceOutcome::Unknown)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    NoFace,
    Recognized,
    SpoofDetected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub status: FrameStatus,
    pub faces: Vec<FaceResult>,
}

impl FrameResult {
    fn no_face() -> Self {
        Self {
            status: FrameStatus::NoFace,
            faces: Vec::new(),
        }
    }

    fn from_faces(faces: Vec<FaceResult>) -> Self {
        let any = |o: FaceOutcome| faces.iter().any(|f| f.outcome == o);
        let status = if faces.is_empty() {
            FrameStatus::NoFace
        } else if any(FaceOutcome::Spoof) && !any(FaceOutcome::Recognized) {
            FrameStatus::SpoofDetected
        } else {
            FrameStatus::Recognized
        };
        Self { status, faces }
    }
}

/// Decode an encoded image (JPEG, PNG, ...) into an RGB frame.
pub fn decode_frame(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    if bytes.is_empty() {
        return Err(PipelineError::MalformedFrame("empty payload".into()));
    }
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::MalformedFrame(e.to_string()))
}

enum LivenessChoice {
    Strategy(Arc<dyn LivenessStrategy>),
    Model(Arc<dyn LivenessModel>),
    Heuristic,
}

/// Assembles a [`Pipeline`]. Every collaborator is required.
pub struct PipelineBuilder {
    config: PipelineConfig,
    localizer: Option<Arc<dyn FaceLocalizer>>,
    extractor: Option<Arc<dyn EmbeddingExtractor>>,
    liveness: Option<LivenessChoice>,
    references: Option<Arc<dyn ReferenceStore>>,
    attendance: Option<Arc<dyn AttendanceStore>>,
    audit: Option<Arc<dyn AuditStore>>,
    buffer: Option<Arc<ConfirmationBuffer>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            localizer: None,
            extractor: None,
            liveness: None,
            references: None,
            attendance: None,
            audit: None,
            buffer: None,
        }
    }

    pub fn localizer(mut self, localizer: Arc<dyn FaceLocalizer>) -> Self {
        self.localizer = Some(localizer);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn EmbeddingExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn liveness_strategy(mut self, strategy: Arc<dyn LivenessStrategy>) -> Self {
        self.liveness = Some(LivenessChoice::Strategy(strategy));
        self
    }

    /// Use a trained classifier, fed crops expanded by the configured scale.
    pub fn liveness_model(mut self, model: Arc<dyn LivenessModel>) -> Self {
        self.liveness = Some(LivenessChoice::Model(model));
        self
    }

    /// Use the edge/contrast heuristic with the configured divisors.
    pub fn heuristic_liveness(mut self) -> Self {
        self.liveness = Some(LivenessChoice::Heuristic);
        self
    }

    pub fn reference_store(mut self, store: Arc<dyn ReferenceStore>) -> Self {
        self.references = Some(store);
        self
    }

    pub fn attendance_store(mut self, store: Arc<dyn AttendanceStore>) -> Self {
        self.attendance = Some(store);
        self
    }

    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(store);
        self
    }

    /// Share a confirmation buffer between pipelines. Defaults to a fresh one.
    pub fn confirmation_buffer(mut self, buffer: Arc<ConfirmationBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        self.config.validate()?;
        let config = self.config;
        let external_timeout = config.timeouts.external_call();
        let store_timeout = config.timeouts.store();

        let strategy: Arc<dyn LivenessStrategy> =
            match self.liveness.ok_or(PipelineError::MissingComponent("liveness strategy"))? {
                LivenessChoice::Strategy(s) => s,
                LivenessChoice::Model(model) => Arc::new(ModelLiveness::new(
                    model,
                    config.liveness.crop_scale,
                    external_timeout,
                )),
                LivenessChoice::Heuristic => {
                    Arc::new(HeuristicLiveness::from_config(&config.liveness))
                }
            };
        let liveness = LivenessGate::new(strategy, config.liveness.threshold);

        let references = self
            .references
            .ok_or(PipelineError::MissingComponent("reference store"))?;
        let attendance = self
            .attendance
            .ok_or(PipelineError::MissingComponent("attendance store"))?;
        let audit = self
            .audit
            .ok_or(PipelineError::MissingComponent("audit store"))?;

        let inner = Inner {
            localizer: self
                .localizer
                .ok_or(PipelineError::MissingComponent("face localizer"))?,
            extractor: self
                .extractor
                .ok_or(PipelineError::MissingComponent("embedding extractor"))?,
            liveness,
            matcher: IdentityMatcher::new(references, config.matching.clone(), store_timeout),
            validator: ConfidenceValidator::new(config.validation.clone()),
            buffer: self
                .buffer
                .unwrap_or_else(|| Arc::new(ConfirmationBuffer::new(config.confirmation.clone()))),
            committer: AttendanceCommitter::new(attendance, store_timeout),
            audit: AuditLogger::new(audit, store_timeout),
            config,
        };

        tracing::info!(
            liveness = inner.liveness.strategy_name(),
            required_sightings = inner.buffer.config().required_sightings,
            "pipeline ready"
        );
        Ok(Pipeline {
            inner: Arc::new(inner),
        })
    }
}

struct Inner {
    config: PipelineConfig,
    localizer: Arc<dyn FaceLocalizer>,
    extractor: Arc<dyn EmbeddingExtractor>,
    liveness: LivenessGate,
    matcher: IdentityMatcher,
    validator: ConfidenceValidator,
    buffer: Arc<ConfirmationBuffer>,
    committer: AttendanceCommitter,
    audit: AuditLogger,
}

/// Cheap to clone; clones share collaborators and the confirmation buffer.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn confirmation_buffer(&self) -> &Arc<ConfirmationBuffer> {
        &self.inner.buffer
    }

    pub(crate) fn liveness(&self) -> &LivenessGate {
        &self.inner.liveness
    }

    /// Decode `bytes` and process the frame. Only undecodable input is an
    /// error; every pipeline-internal rejection is part of the result.
    pub async fn recognize_bytes(
        &self,
        bytes: &[u8],
        subject_context: Option<&str>,
    ) -> Result<FrameResult, PipelineError> {
        let frame = decode_frame(bytes)?;
        Ok(self.process_frame(Arc::new(frame), subject_context).await)
    }

    /// Process a frame, counting attendance against today's local date.
    pub async fn process_frame(
        &self,
        frame: Arc<RgbImage>,
        subject_context: Option<&str>,
    ) -> FrameResult {
        let today = chrono::Local::now().date_naive();
        self.process_frame_on(frame, subject_context, today).await
    }

    pub async fn process_frame_on(
        &self,
        frame: Arc<RgbImage>,
        subject_context: Option<&str>,
        day: NaiveDate,
    ) -> FrameResult {
        let regions = match self.detect(&frame).await {
            Some(regions) if !regions.is_empty() => regions,
            _ => return FrameResult::no_face(),
        };
        tracing::debug!(faces = regions.len(), "faces detected");

        let subject = subject_context.map(str::to_owned);
        let mut tasks = JoinSet::new();
        for (index, region) in regions.into_iter().enumerate() {
            let pipeline = self.clone();
            let frame = Arc::clone(&frame);
            let subject = subject.clone();
            tasks.spawn(async move {
                let result = pipeline
                    .process_face(&frame, region, subject.as_deref(), day)
                    .await;
                (index, result)
            });
        }

        let mut faces = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(face) => faces.push(face),
                Err(e) => tracing::error!(error = %e, "face task aborted"),
            }
        }
        faces.sort_by_key(|(index, _)| *index);

        FrameResult::from_faces(faces.into_iter().map(|(_, face)| face).collect())
    }

    /// Localize faces; `None` when the localizer failed or timed out.
    pub(crate) async fn detect(&self, frame: &RgbImage) -> Option<Vec<FaceRegion>> {
        let timeout = self.inner.config.timeouts.external_call();
        match tokio::time::timeout(timeout, self.inner.localizer.detect(frame)).await {
            Ok(Ok(regions)) => Some(regions),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "face localizer failed");
                None
            }
            Err(_) => {
                tracing::warn!(?timeout, "face localizer timed out");
                None
            }
        }
    }

    pub(crate) async fn embed(&self, crop: &RgbImage) -> Option<Embedding> {
        let timeout = self.inner.config.timeouts.external_call();
        match tokio::time::timeout(timeout, self.inner.extractor.embed(crop)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "embedding extraction failed");
                None
            }
            Err(_) => {
                tracing::warn!(?timeout, "embedding extraction timed out");
                None
            }
        }
    }

    async fn process_face(
        &self,
        frame: &RgbImage,
        region: FaceRegion,
        subject: Option<&str>,
        day: NaiveDate,
    ) -> FaceResult {
        let inner = &*self.inner;

        let report = quality::evaluate(&region, frame, &inner.config.quality);
        if let Some(reason) = report.reason {
            tracing::debug!(?region, ?reason, blur = report.blur_score, "quality gate rejected face");
            return FaceResult::unknown(region, None, Rejection::Quality { reason });
        }

        let liveness = match inner.liveness.score(frame, &region).await {
            Ok(score) => score,
            Err(e) => {
                tracing::warn!(?region, error = %e, "liveness scoring failed");
                return FaceResult::unknown(region, None, Rejection::LivenessUnavailable);
            }
        };
        if !liveness.is_live {
            tracing::info!(?region, score = liveness.score, "spoof suspected");
            inner
                .audit
                .record(
                    AuditEntry::new(AuditReason::LowLivenessScore, subject)
                        .with_liveness(liveness.score),
                )
                .await;
            return FaceResult {
                liveness_score: Some(liveness.score),
                ..FaceResult::new(region, FaceOutcome::Spoof)
            };
        }
        let live = Some(liveness.score);

        let Some(embedding) = self.embed(&region.crop(frame)).await else {
            return FaceResult::unknown(region, live, Rejection::EmbeddingFailed);
        };

        let candidates = match inner.matcher.find(&embedding).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(error = %e, "identity matching failed");
                return FaceResult::unknown(region, live, Rejection::MatchingFailed);
            }
        };
        if candidates.is_empty() {
            inner
                .audit
                .record(
                    AuditEntry::new(AuditReason::UnknownFace, subject).with_liveness(liveness.score),
                )
                .await;
            return FaceResult::unknown(region, live, Rejection::NoMatch);
        }

        let validation = inner.validator.validate(&candidates);
        let confidence = validation.top_score;
        let identity_id = candidates[0].identity_id.clone();
        if let Some(stage) = validation.stage {
            tracing::debug!(
                identity = %identity_id,
                top = confidence,
                margin = validation.margin,
                stage = stage.as_str(),
                "match rejected"
            );
            inner
                .audit
                .record(
                    AuditEntry::new(AuditReason::AmbiguousMatch, subject)
                        .with_identity(Some(identity_id))
                        .with_liveness(liveness.score)
                        .with_detail(stage.as_str()),
                )
                .await;
            return FaceResult {
                confidence: Some(confidence),
                ..FaceResult::unknown(region, live, Rejection::Validation { stage })
            };
        }

        let attendance = match inner.buffer.observe(&identity_id, subject, confidence) {
            Confirmation::Reset => AttendanceMark::Reset,
            Confirmation::Buffering {
                sightings,
                required,
            } => AttendanceMark::Pending {
                sightings,
                required,
            },
            Confirmation::Confirmed { .. } => {
                match inner
                    .committer
                    .commit(&identity_id, day, subject, confidence)
                    .await
                {
                    Ok(CommitOutcome::Created(record)) => AttendanceMark::Marked {
                        record_id: record.id,
                    },
                    Ok(CommitOutcome::AlreadyExists) => AttendanceMark::AlreadyMarked,
                    Err(e) => AttendanceMark::Failed {
                        error: e.to_string(),
                    },
                }
            }
        };

        FaceResult {
            identity_id: Some(identity_id),
            confidence: Some(confidence),
            liveness_score: live,
            attendance: Some(attendance),
            ..FaceResult::new(region, FaceOutcome::Recognized)
        }
    }
}
