//! Temporal confirmation buffer.
//!
//! An identity is only confirmed after `required_sightings` qualifying
//! sightings of the same (identity, subject) pair inside a sliding window
//! that starts at the first sighting. Per key the buffer moves through
//! Absent → Buffering → Confirmed, and a confirmation deletes the entry so
//! the next sighting starts over.
//!
//! Entries live in a sharded concurrent map: operations on one key are
//! mutually exclusive, operations on different keys proceed in parallel.
//! Stale entries are evicted lazily when their key is next touched.

use crate::types::{normalize_subject, IdentityId, GLOBAL_SUBJECT};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.65;
const DEFAULT_REQUIRED_SIGHTINGS: u32 = 2;
const DEFAULT_WINDOW_SECONDS: f64 = 8.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// Sightings below this confidence clear the key's progress.
    pub confidence_threshold: f32,
    pub required_sightings: u32,
    /// Window measured from the first buffered sighting.
    pub window_seconds: f64,
}

impl ConfirmationConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_seconds)
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            required_sightings: DEFAULT_REQUIRED_SIGHTINGS,
            window_seconds: DEFAULT_WINDOW_SECONDS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfirmationKey {
    identity_id: IdentityId,
    subject: String,
}

impl ConfirmationKey {
    pub fn new(identity_id: &str, subject_context: Option<&str>) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            subject: normalize_subject(subject_context)
                .unwrap_or(GLOBAL_SUBJECT)
                .to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfirmationEntry {
    pub identity_id: IdentityId,
    pub subject_context: Option<String>,
    pub sighting_count: u32,
    pub first_seen_at: Instant,
}

/// Result of feeding one sighting into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Confirmation {
    /// Confidence under the buffer threshold; any progress was discarded.
    Reset,
    Buffering { sightings: u32, required: u32 },
    /// Enough sightings; the entry has been removed.
    Confirmed { sightings: u32 },
}

pub struct ConfirmationBuffer {
    entries: DashMap<ConfirmationKey, ConfirmationEntry>,
    config: ConfirmationConfig,
}

impl ConfirmationBuffer {
    pub fn new(config: ConfirmationConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &ConfirmationConfig {
        &self.config
    }

    /// Record a sighting that passed validation, timestamped now.
    pub fn observe(
        &self,
        identity_id: &str,
        subject_context: Option<&str>,
        confidence: f32,
    ) -> Confirmation {
        self.observe_at(identity_id, subject_context, confidence, Instant::now())
    }

    /// Record a sighting at `now`.
    pub fn observe_at(
        &self,
        identity_id: &str,
        subject_context: Option<&str>,
        confidence: f32,
        now: Instant,
    ) -> Confirmation {
        let key = ConfirmationKey::new(identity_id, subject_context);
        let required = self.config.required_sightings;

        if confidence < self.config.confidence_threshold {
            if self.entries.remove(&key).is_some() {
                tracing::debug!(
                    identity = identity_id,
                    confidence,
                    "confidence dropped; confirmation progress cleared"
                );
            }
            return Confirmation::Reset;
        }

        let fresh = || ConfirmationEntry {
            identity_id: identity_id.to_string(),
            subject_context: normalize_subject(subject_context).map(str::to_owned),
            sighting_count: 1,
            first_seen_at: now,
        };

        // The entry guard holds the key's shard lock for the whole transition.
        match self.entries.entry(key) {
            Entry::Vacant(slot) => {
                if required <= 1 {
                    return Confirmation::Confirmed { sightings: 1 };
                }
                slot.insert(fresh());
                tracing::debug!(identity = identity_id, required, "confirmation started");
                Confirmation::Buffering {
                    sightings: 1,
                    required,
                }
            }
            Entry::Occupied(mut slot) => {
                let age = now.saturating_duration_since(slot.get().first_seen_at);
                if age > self.config.window() {
                    tracing::debug!(identity = identity_id, ?age, "confirmation window expired; restarting");
                    if required <= 1 {
                        slot.remove();
                        return Confirmation::Confirmed { sightings: 1 };
                    }
                    slot.insert(fresh());
                    return Confirmation::Buffering {
                        sightings: 1,
                        required,
                    };
                }

                let entry = slot.get_mut();
                entry.sighting_count += 1;
                let sightings = entry.sighting_count;

                if sightings >= required {
                    slot.remove();
                    tracing::debug!(identity = identity_id, sightings, "identity confirmed");
                    Confirmation::Confirmed { sightings }
                } else {
                    Confirmation::Buffering {
                        sightings,
                        required,
                    }
                }
            }
        }
    }

    pub fn get(&self, identity_id: &str, subject_context: Option<&str>) -> Option<ConfirmationEntry> {
        self.entries
            .get(&ConfirmationKey::new(identity_id, subject_context))
            .map(|e| e.value().clone())
    }

    pub fn remove(&self, identity_id: &str, subject_context: Option<&str>) -> Option<ConfirmationEntry> {
        self.entries
            .remove(&ConfirmationKey::new(identity_id, subject_context))
            .map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
