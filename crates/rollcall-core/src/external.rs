//! Collaborators the pipeline consumes but does not implement: model
//! inference and persistence. Hosts supply implementations (see the
//! `rollcall-models` and `rollcall-store` crates, or [`crate::memory`]).

use crate::attendance::AttendanceRecord;
use crate::audit::AuditEntry;
use crate::types::{Embedding, FaceRegion, MatchCandidate, ReferenceEntry};
use async_trait::async_trait;
use chrono::NaiveDate;
use image::RgbImage;
use thiserror::Error;

/// Failure of a model-backed collaborator.
#[derive(Error, Debug, Clone)]
pub enum ExternalError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("inference failed: {0}")]
    Failed(String),
}

/// Failure of a persistence collaborator.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("write conflicts with an existing row")]
    Conflict,
    /// Worth one retry (busy database, dropped connection).
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store failure: {0}")]
    Backend(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Locates faces in a frame.
#[async_trait]
pub trait FaceLocalizer: Send + Sync {
    async fn detect(&self, frame: &RgbImage) -> Result<Vec<FaceRegion>, ExternalError>;
}

/// Turns a face crop into an identity embedding. Must be deterministic for
/// identical input.
#[async_trait]
pub trait EmbeddingExtractor: Send + Sync {
    async fn embed(&self, crop: &RgbImage) -> Result<Embedding, ExternalError>;
}

/// Trained binary liveness classifier.
#[async_trait]
pub trait LivenessModel: Send + Sync {
    /// Expected (width, height) of the crop passed to [`predict`](Self::predict).
    fn input_size(&self) -> (u32, u32);

    /// Probability in [0, 1] that the crop shows a live face.
    async fn predict(&self, crop: &RgbImage) -> Result<f32, ExternalError>;
}

/// Answer of the optional bulk-similarity fast path.
#[derive(Debug, Clone)]
pub enum SearchResponse {
    /// Candidates clearing the threshold, best first, one per identity.
    Ranked(Vec<MatchCandidate>),
    /// The store has no similarity backend (or it is switched off).
    Unavailable,
}

/// Read access to the enrolled reference embeddings.
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// Every reference sample, in insertion order.
    async fn all_embeddings(&self) -> Result<Vec<ReferenceEntry>, StoreError>;

    /// Bulk similarity search. Stores without a backend keep the default.
    async fn similarity_search(
        &self,
        _query: &Embedding,
        _threshold: f32,
        _top_k: usize,
    ) -> Result<SearchResponse, StoreError> {
        Ok(SearchResponse::Unavailable)
    }
}

/// Write access to the reference set, used by enrollment.
#[async_trait]
pub trait ReferenceWriter: Send + Sync {
    async fn add_reference(&self, entry: ReferenceEntry) -> Result<(), StoreError>;
}

/// Persisted attendance records.
#[async_trait]
pub trait AttendanceStore: Send + Sync {
    async fn exists(
        &self,
        identity_id: &str,
        day: NaiveDate,
        subject_context: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// Insert a record. Stores with a uniqueness constraint on
    /// (identity, day, subject) report a duplicate as [`StoreError::Conflict`].
    async fn insert(&self, record: AttendanceRecord) -> Result<AttendanceRecord, StoreError>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError>;
}
