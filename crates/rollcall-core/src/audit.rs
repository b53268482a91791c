//! Best-effort audit trail of spoof attempts and unrecognised faces.

use crate::external::AuditStore;
use crate::types::IdentityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditReason {
    LowLivenessScore,
    UnknownFace,
    AmbiguousMatch,
}

impl AuditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditReason::LowLivenessScore => "low_liveness_score",
            AuditReason::UnknownFace => "unknown_face",
            AuditReason::AmbiguousMatch => "ambiguous_match",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub identity_id: Option<IdentityId>,
    pub reason: AuditReason,
    pub liveness_score: Option<f32>,
    pub subject_context: Option<String>,
    /// Free-form qualifier, e.g. the validation stage that rejected a match.
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(reason: AuditReason, subject_context: Option<&str>) -> Self {
        Self {
            identity_id: None,
            reason,
            liveness_score: None,
            subject_context: subject_context.map(str::to_owned),
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_identity(mut self, identity_id: Option<IdentityId>) -> Self {
        self.identity_id = identity_id;
        self
    }

    pub fn with_liveness(mut self, score: f32) -> Self {
        self.liveness_score = Some(score);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    timeout: Duration,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Append `entry`. Failures are logged and swallowed.
    pub async fn record(&self, entry: AuditEntry) {
        let reason = entry.reason.as_str();
        match tokio::time::timeout(self.timeout, self.store.append(entry)).await {
            Ok(Ok(())) => tracing::debug!(reason, "audit entry recorded"),
            Ok(Err(e)) => tracing::warn!(reason, error = %e, "failed to record audit entry"),
            Err(_) => tracing::warn!(reason, timeout = ?self.timeout, "audit store timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryAuditStore;

    #[tokio::test]
    async fn test_record_appends() {
        let store = Arc::new(InMemoryAuditStore::new());
        let logger = AuditLogger::new(store.clone(), Duration::from_secs(1));

        logger
            .record(AuditEntry::new(AuditReason::LowLivenessScore, Some("math")).with_liveness(0.12))
            .await;

        let entries = store.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, AuditReason::LowLivenessScore);
        assert_eq!(entries[0].liveness_score, Some(0.12));
        assert_eq!(entries[0].subject_context.as_deref(), Some("math"));
        assert!(entries[0].identity_id.is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_swallowed() {
        let store = Arc::new(InMemoryAuditStore::new());
        store.set_failing(true);
        let logger = AuditLogger::new(store.clone(), Duration::from_secs(1));

        // Must return normally.
        logger.record(AuditEntry::new(AuditReason::UnknownFace, None)).await;
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_reason_serialises_snake_case() {
        let json = serde_json::to_string(&AuditReason::LowLivenessScore).unwrap();
        assert_eq!(json, "\"low_liveness_score\"");
    }
}
