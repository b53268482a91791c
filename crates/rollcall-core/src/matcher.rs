//! Identity matcher: ranks enrolled identities by cosine similarity.
//!
//! The reference store may offer a bulk-similarity backend. When it reports
//! itself unavailable, errors or times out, the matcher scans every
//! reference embedding itself. Both paths go through [`rank`] so their
//! output is identical.

use crate::external::{ReferenceStore, SearchResponse, StoreError};
use crate::types::{Embedding, MatchCandidate, ReferenceEntry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MATCH_THRESHOLD: f32 = 0.50;
const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Minimum cosine similarity for an identity to be a candidate.
    pub threshold: f32,
    /// Maximum number of candidates returned.
    pub top_k: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            top_k: DEFAULT_TOP_K,
        }
    }
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("reference store: {0}")]
    Store(#[from] StoreError),
    #[error("reference store timed out after {0:?}")]
    Timeout(Duration),
}

pub struct IdentityMatcher {
    store: Arc<dyn ReferenceStore>,
    config: MatchConfig,
    timeout: Duration,
}

impl IdentityMatcher {
    pub fn new(store: Arc<dyn ReferenceStore>, config: MatchConfig, timeout: Duration) -> Self {
        Self {
            store,
            config,
            timeout,
        }
    }

    /// Candidates for `query`, most similar first, at most `top_k`, empty
    /// when no identity clears the threshold.
    pub async fn find(&self, query: &Embedding) -> Result<Vec<MatchCandidate>, MatchError> {
        let threshold = self.config.threshold;
        let top_k = self.config.top_k;

        let search = self.store.similarity_search(query, threshold, top_k);
        match tokio::time::timeout(self.timeout, search).await {
            Ok(Ok(SearchResponse::Ranked(candidates))) => {
                tracing::debug!(count = candidates.len(), "similarity backend answered");
                return Ok(rank(candidates, threshold, top_k));
            }
            Ok(Ok(SearchResponse::Unavailable)) => {
                tracing::debug!("no similarity backend; scanning references");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "similarity backend failed; scanning references");
            }
            Err(_) => {
                tracing::warn!(timeout = ?self.timeout, "similarity backend timed out; scanning references");
            }
        }

        let references = tokio::time::timeout(self.timeout, self.store.all_embeddings())
            .await
            .map_err(|_| MatchError::Timeout(self.timeout))??;

        Ok(linear_scan(query, &references, threshold, top_k))
    }
}

/// Brute-force match of `query` against every reference sample.
///
/// Each identity is represented by its most similar sample; on equal
/// similarity the sample seen first wins.
pub fn linear_scan(
    query: &Embedding,
    references: &[ReferenceEntry],
    threshold: f32,
    top_k: usize,
) -> Vec<MatchCandidate> {
    let candidates = references
        .iter()
        .map(|r| MatchCandidate {
            identity_id: r.identity_id.clone(),
            similarity: query.similarity(&r.embedding),
            distance: query.euclidean_distance(&r.embedding),
        })
        .collect();
    rank(candidates, threshold, top_k)
}

/// Keep the best candidate per identity, drop those under `threshold`, sort
/// by similarity descending and truncate to `top_k`.
///
/// The sort is stable and the per-identity reduction keeps first-seen
/// order, so ties resolve by input order.
pub fn rank(candidates: Vec<MatchCandidate>, threshold: f32, top_k: usize) -> Vec<MatchCandidate> {
    let mut best: Vec<MatchCandidate> = Vec::new();
    let mut slot: HashMap<String, usize> = HashMap::new();

    for c in candidates {
        if c.similarity.is_nan() || c.similarity < threshold {
            continue;
        }
        match slot.get(&c.identity_id) {
            Some(&i) => {
                if c.similarity > best[i].similarity {
                    best[i] = c;
                }
            }
            None => {
                slot.insert(c.identity_id.clone(), best.len());
                best.push(c);
            }
        }
    }

    best.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    best.truncate(top_k);
    best
}
