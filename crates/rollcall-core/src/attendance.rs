//! Attendance committer: idempotent, one record per (identity, day, subject).

use crate::external::{AttendanceStore, StoreError};
use crate::types::{normalize_subject, IdentityId};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Status written with a record. A committed sighting always means present;
/// the status column exists so rows stay self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
        }
    }
}

impl FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(AttendanceStatus::Present),
            other => Err(format!("unknown attendance status {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub id: Uuid,
    pub identity_id: IdentityId,
    /// Calendar day the attendance counts for.
    pub day: NaiveDate,
    pub subject_context: Option<String>,
    pub status: AttendanceStatus,
    pub confidence: f32,
    pub marked_at: DateTime<Utc>,
}

impl AttendanceRecord {
    pub fn key(&self) -> AttendanceKey {
        AttendanceKey::new(&self.identity_id, self.day, self.subject_context.as_deref())
    }
}

/// Uniqueness key of an attendance record. The subject is normalised, so a
/// blank or `global` subject is the same key as no subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttendanceKey {
    pub identity_id: IdentityId,
    pub day: NaiveDate,
    pub subject_context: Option<String>,
}

impl AttendanceKey {
    pub fn new(identity_id: &str, day: NaiveDate, subject_context: Option<&str>) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            day,
            subject_context: normalize_subject(subject_context).map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Created(AttendanceRecord),
    /// A record for the key already exists; nothing was written.
    AlreadyExists,
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("attendance store: {0}")]
    Store(#[from] StoreError),
    #[error("attendance store timed out after {0:?}")]
    Timeout(Duration),
}

impl CommitError {
    fn is_retryable(&self) -> bool {
        match self {
            CommitError::Store(e) => e.is_transient(),
            CommitError::Timeout(_) => true,
        }
    }
}

/// Serialises commits per key in-process and relies on the store's
/// uniqueness constraint (when it has one) across processes.
pub struct AttendanceCommitter {
    store: Arc<dyn AttendanceStore>,
    locks: DashMap<AttendanceKey, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl AttendanceCommitter {
    pub fn new(store: Arc<dyn AttendanceStore>, timeout: Duration) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            timeout,
        }
    }

    /// Mark `identity_id` present for `day`, unless already marked.
    ///
    /// A transient store failure or timeout is retried once; the retry
    /// re-runs the existence check, so a first insert that landed late is
    /// reported as `AlreadyExists` rather than duplicated.
    pub async fn commit(
        &self,
        identity_id: &str,
        day: NaiveDate,
        subject_context: Option<&str>,
        confidence: f32,
    ) -> Result<CommitOutcome, CommitError> {
        let key = AttendanceKey::new(identity_id, day, subject_context);
        let lock = self.locks.entry(key.clone()).or_default().clone();

        let result = {
            let _guard = lock.lock().await;
            match self.check_then_insert(&key, confidence).await {
                Err(e) if e.is_retryable() => {
                    tracing::warn!(identity = identity_id, error = %e, "attendance commit failed; retrying once");
                    self.check_then_insert(&key, confidence).await
                }
                other => other,
            }
        };

        drop(lock);
        self.locks.remove_if(&key, |_, l| Arc::strong_count(l) == 1);

        match &result {
            Ok(CommitOutcome::Created(record)) => tracing::info!(
                identity = identity_id,
                %day,
                subject = subject_context.unwrap_or("-"),
                confidence,
                record = %record.id,
                "attendance marked"
            ),
            Ok(CommitOutcome::AlreadyExists) => {
                tracing::debug!(identity = identity_id, %day, "attendance already marked")
            }
            Err(e) => tracing::error!(identity = identity_id, %day, error = %e, "attendance commit failed"),
        }
        result
    }

    async fn check_then_insert(
        &self,
        key: &AttendanceKey,
        confidence: f32,
    ) -> Result<CommitOutcome, CommitError> {
        let exists = self
            .bounded(self.store.exists(&key.identity_id, key.day, key.subject_context.as_deref()))
            .await??;
        if exists {
            return Ok(CommitOutcome::AlreadyExists);
        }

        let record = AttendanceRecord {
            id: Uuid::new_v4(),
            identity_id: key.identity_id.clone(),
            day: key.day,
            subject_context: key.subject_context.clone(),
            status: AttendanceStatus::Present,
            confidence,
            marked_at: Utc::now(),
        };

        match self.bounded(self.store.insert(record)).await? {
            Ok(stored) => Ok(CommitOutcome::Created(stored)),
            Err(StoreError::Conflict) => Ok(CommitOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, CommitError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| CommitError::Timeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryAttendanceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()
    }

    fn committer(store: Arc<InMemoryAttendanceStore>) -> AttendanceCommitter {
        AttendanceCommitter::new(store, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_commit_is_idempotent() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let c = committer(store.clone());

        let first = c.commit("s1", day(), Some("math"), 0.91).await.unwrap();
        let CommitOutcome::Created(record) = first else {
            panic!("expected Created, got {first:?}");
        };
        assert_eq!(record.status, AttendanceStatus::Present);
        assert_eq!(record.confidence, 0.91);
        assert_eq!(record.subject_context.as_deref(), Some("math"));

        let second = c.commit("s1", day(), Some("math"), 0.95).await.unwrap();
        assert_eq!(second, CommitOutcome::AlreadyExists);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_key_components_are_distinct() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let c = committer(store.clone());
        let next_day = day().succ_opt().unwrap();

        for (id, d, subject) in [
            ("s1", day(), Some("math")),
            ("s1", day(), Some("art")),
            ("s1", day(), None),
            ("s1", next_day, Some("math")),
            ("s2", day(), Some("math")),
        ] {
            let out = c.commit(id, d, subject, 0.9).await.unwrap();
            assert!(matches!(out, CommitOutcome::Created(_)));
        }
        assert_eq!(store.records().len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_create_once() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let c = Arc::new(committer(store.clone()));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let c = Arc::clone(&c);
                tokio::spawn(async move { c.commit("s1", day(), Some("math"), 0.9).await })
            })
            .collect();

        let mut created = 0;
        let mut existing = 0;
        for t in tasks {
            match t.await.unwrap().unwrap() {
                CommitOutcome::Created(_) => created += 1,
                CommitOutcome::AlreadyExists => existing += 1,
            }
        }
        assert_eq!((created, existing), (1, 1));
        assert_eq!(store.records().len(), 1);
        assert!(c.locks.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_concurrent_commits_create_once() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let c = Arc::new(committer(store.clone()));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let c = Arc::clone(&c);
                tokio::spawn(async move { c.commit("s1", day(), None, 0.9).await })
            })
            .collect();

        let mut created = 0;
        for t in tasks {
            if let CommitOutcome::Created(_) = t.await.unwrap().unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        store.fail_next_inserts(1);
        let c = committer(store.clone());

        let out = c.commit("s1", day(), None, 0.9).await.unwrap();
        assert!(matches!(out, CommitOutcome::Created(_)));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_second_transient_failure_surfaces() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        store.fail_next_inserts(2);
        let c = committer(store.clone());

        let err = c.commit("s1", day(), None, 0.9).await.unwrap_err();
        assert!(matches!(err, CommitError::Store(StoreError::Transient(_))));
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn test_store_conflict_is_already_exists() {
        // A row written by another process between our check and insert.
        let store = Arc::new(InMemoryAttendanceStore::new());
        store.hide_existing(true);
        let c = committer(store.clone());
        c.commit("s1", day(), None, 0.9).await.unwrap();

        let out = c.commit("s1", day(), None, 0.9).await.unwrap();
        assert_eq!(out, CommitOutcome::AlreadyExists);
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn test_blank_and_global_subjects_share_a_key() {
        let store = Arc::new(InMemoryAttendanceStore::new());
        let c = committer(store.clone());

        let first = c.commit("s1", day(), None, 0.9).await.unwrap();
        assert!(matches!(first, CommitOutcome::Created(_)));
        for subject in ["", " ", "global"] {
            let out = c.commit("s1", day(), Some(subject), 0.9).await.unwrap();
            assert_eq!(out, CommitOutcome::AlreadyExists, "subject {subject:?}");
        }
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.records()[0].subject_context, None);
    }

    /// Does its work against an in-memory store, then hangs for the first
    /// `stall_*` calls so the committer's timeout fires.
    #[derive(Default)]
    struct StallingStore {
        inner: InMemoryAttendanceStore,
        stall_exists: AtomicUsize,
        stall_inserts: AtomicUsize,
        exists_calls: AtomicUsize,
    }

    impl StallingStore {
        async fn maybe_stall(counter: &AtomicUsize) {
            if counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl AttendanceStore for StallingStore {
        async fn exists(
            &self,
            identity_id: &str,
            day: NaiveDate,
            subject_context: Option<&str>,
        ) -> Result<bool, StoreError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            let found = self.inner.exists(identity_id, day, subject_context).await?;
            Self::maybe_stall(&self.stall_exists).await;
            Ok(found)
        }

        async fn insert(&self, record: AttendanceRecord) -> Result<AttendanceRecord, StoreError> {
            let stored = self.inner.insert(record).await?;
            Self::maybe_stall(&self.stall_inserts).await;
            Ok(stored)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_check_is_retried() {
        let store = Arc::new(StallingStore::default());
        store.stall_exists.store(1, Ordering::SeqCst);
        let c = AttendanceCommitter::new(store.clone(), Duration::from_secs(2));

        let out = c.commit("s1", day(), Some("math"), 0.9).await.unwrap();
        assert!(matches!(out, CommitOutcome::Created(_)));
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_insert_is_rechecked_not_duplicated() {
        // The first insert lands but its acknowledgement never arrives.
        let store = Arc::new(StallingStore::default());
        store.stall_inserts.store(1, Ordering::SeqCst);
        let c = AttendanceCommitter::new(store.clone(), Duration::from_secs(2));

        let out = c.commit("s1", day(), Some("math"), 0.9).await.unwrap();
        assert_eq!(out, CommitOutcome::AlreadyExists);
        assert_eq!(store.exists_calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.inner.records().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_timeout_surfaces() {
        let store = Arc::new(StallingStore::default());
        store.stall_exists.store(2, Ordering::SeqCst);
        let c = AttendanceCommitter::new(store.clone(), Duration::from_secs(2));

        let err = c.commit("s1", day(), None, 0.9).await.unwrap_err();
        assert!(matches!(err, CommitError::Timeout(d) if d == Duration::from_secs(2)));
        assert!(store.inner.records().is_empty());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(AttendanceStatus::Present.as_str(), "present");
        assert_eq!("present".parse::<AttendanceStatus>(), Ok(AttendanceStatus::Present));
        assert!("late".parse::<AttendanceStatus>().is_err());
    }
}
