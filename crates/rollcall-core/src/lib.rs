//! rollcall-core: face verification gates and attendance commit pipeline.
//!
//! A frame's faces pass quality, liveness, identity matching, confidence
//! validation and temporal confirmation before a single attendance record
//! is written per identity, day and subject. Model inference and
//! persistence are consumed through the traits in [`external`].

pub mod attendance;
pub mod audit;
pub mod config;
pub mod confirmation;
pub mod enroll;
pub mod external;
pub mod imaging;
pub mod liveness;
pub mod matcher;
pub mod memory;
pub mod pipeline;
pub mod quality;
pub mod types;
pub mod validator;

pub use attendance::{AttendanceCommitter, AttendanceRecord, AttendanceStatus, CommitOutcome};
pub use audit::{AuditEntry, AuditLogger, AuditReason};
pub use config::{ConfigError, PipelineConfig};
pub use confirmation::{Confirmation, ConfirmationBuffer};
pub use enroll::{Enroller, EnrollmentReport, SampleOutcome};
pub use external::{
    AttendanceStore, AuditStore, EmbeddingExtractor, ExternalError, FaceLocalizer, LivenessModel,
    ReferenceStore, ReferenceWriter, SearchResponse, StoreError,
};
pub use liveness::{LivenessGate, LivenessScore, LivenessStrategy};
pub use pipeline::{
    decode_frame, FaceOutcome, FaceResult, FrameResult, FrameStatus, Pipeline, PipelineBuilder,
    PipelineError,
};
pub use types::{
    normalize_subject, Embedding, FaceRegion, IdentityId, MatchCandidate, ReferenceEntry,
};
