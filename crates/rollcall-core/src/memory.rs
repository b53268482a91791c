//! In-process collaborator implementations, for embedding the pipeline
//! without a database and for tests.

use crate::attendance::{AttendanceKey, AttendanceRecord};
use crate::audit::AuditEntry;
use crate::external::{
    AttendanceStore, AuditStore, ReferenceStore, ReferenceWriter, SearchResponse, StoreError,
};
use crate::matcher;
use crate::types::{Embedding, ReferenceEntry};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// How [`InMemoryReferenceStore`] answers similarity searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Answer from an in-process index.
    Native,
    /// Report no backend.
    Unavailable,
    /// Fail every search, as a broken backend would.
    Failing,
}

pub struct InMemoryReferenceStore {
    entries: RwLock<Vec<ReferenceEntry>>,
    mode: SearchMode,
}

impl InMemoryReferenceStore {
    pub fn new(mode: SearchMode) -> Self {
        Self::with_entries(Vec::new(), mode)
    }

    pub fn with_entries(entries: Vec<ReferenceEntry>, mode: SearchMode) -> Self {
        Self {
            entries: RwLock::new(entries),
            mode,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReferenceStore for InMemoryReferenceStore {
    async fn all_embeddings(&self) -> Result<Vec<ReferenceEntry>, StoreError> {
        self.entries
            .read()
            .map(|e| e.clone())
            .map_err(|_| StoreError::Backend("reference set lock poisoned".into()))
    }

    async fn similarity_search(
        &self,
        query: &Embedding,
        threshold: f32,
        top_k: usize,
    ) -> Result<SearchResponse, StoreError> {
        match self.mode {
            SearchMode::Native => {
                let entries = self
                    .entries
                    .read()
                    .map_err(|_| StoreError::Backend("reference set lock poisoned".into()))?;
                Ok(SearchResponse::Ranked(matcher::linear_scan(
                    query, &entries, threshold, top_k,
                )))
            }
            SearchMode::Unavailable => Ok(SearchResponse::Unavailable),
            SearchMode::Failing => Err(StoreError::Backend("similarity index offline".into())),
        }
    }
}

#[async_trait]
impl ReferenceWriter for InMemoryReferenceStore {
    async fn add_reference(&self, entry: ReferenceEntry) -> Result<(), StoreError> {
        self.entries
            .write()
            .map_err(|_| StoreError::Backend("reference set lock poisoned".into()))?
            .push(entry);
        Ok(())
    }
}

/// Attendance rows with the same uniqueness rule as the SQLite schema.
#[derive(Default)]
pub struct InMemoryAttendanceStore {
    records: Mutex<Vec<AttendanceRecord>>,
    failing_inserts: AtomicUsize,
    hide_existing: AtomicBool,
}

impl InMemoryAttendanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        lock(&self.records).clone()
    }

    /// Make the next `n` inserts fail with a transient error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Make `exists` always answer `false`, so only the uniqueness rule on
    /// insert prevents duplicates.
    pub fn hide_existing(&self, hide: bool) {
        self.hide_existing.store(hide, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttendanceStore for InMemoryAttendanceStore {
    async fn exists(
        &self,
        identity_id: &str,
        day: NaiveDate,
        subject_context: Option<&str>,
    ) -> Result<bool, StoreError> {
        if self.hide_existing.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let key = AttendanceKey::new(identity_id, day, subject_context);
        Ok(lock(&self.records).iter().any(|r| r.key() == key))
    }

    async fn insert(&self, mut record: AttendanceRecord) -> Result<AttendanceRecord, StoreError> {
        let pending_failures = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending_failures.is_ok() {
            return Err(StoreError::Transient("simulated connection reset".into()));
        }

        let key = record.key();
        record.subject_context = key.subject_context.clone();
        let mut records = lock(&self.records);
        if records.iter().any(|r| r.key() == key) {
            return Err(StoreError::Conflict);
        }
        records.push(record.clone());
        Ok(record)
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<AuditEntry>>,
    failing: AtomicBool,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn append(&self, entry: AuditEntry) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("audit table unavailable".into()));
        }
        lock(&self.entries).push(entry);
        Ok(())
    }
}
