//! Confidence validator: multi-stage acceptance of ranked candidates.
//!
//! Stages run in order and the first failure is reported:
//!
//! 1. **Confidence**: top score ≥ `min_confidence`.
//! 2. **Margin**: top − second ≥ `min_margin` (second = 0 if absent).
//! 3. **Dominance**: top − third ≥ `dominance_factor × min_margin`, when a
//!    third candidate exists.
//! 4. **Distance consistency**: mean distance of the `neighbor_count`
//!    nearest candidates ≤ `distance_ceiling`, when a ceiling is set.
//!
//! Raising the margin settings trades false accepts between look-alikes for
//! more false rejects.

use crate::types::{IdentityId, MatchCandidate};
use serde::{Deserialize, Serialize};

const DEFAULT_MIN_CONFIDENCE: f32 = 0.85;
const DEFAULT_MIN_MARGIN: f32 = 0.20;
const DEFAULT_DOMINANCE_FACTOR: f32 = 1.5;
const DEFAULT_NEIGHBOR_COUNT: usize = 3;
/// Absorbs f32 rounding in score differences (0.85 - 0.65 != 0.20).
const SCORE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub min_confidence: f32,
    pub min_margin: f32,
    pub dominance_factor: f32,
    /// Ceiling on mean neighbour distance. `None` disables the stage.
    pub distance_ceiling: Option<f32>,
    /// Neighbours averaged by the distance stage.
    pub neighbor_count: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            min_margin: DEFAULT_MIN_MARGIN,
            dominance_factor: DEFAULT_DOMINANCE_FACTOR,
            distance_ceiling: None,
            neighbor_count: DEFAULT_NEIGHBOR_COUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Confidence,
    Margin,
    Dominance,
    DistanceConsistency,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::Confidence => "confidence",
            ValidationStage::Margin => "margin",
            ValidationStage::Dominance => "dominance",
            ValidationStage::DistanceConsistency => "distance_consistency",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    /// Stage that rejected the match; `None` when accepted.
    pub stage: Option<ValidationStage>,
    /// Top candidate's identity, present whenever there was a candidate.
    pub identity_id: Option<IdentityId>,
    pub top_score: f32,
    pub margin: f32,
}

pub struct ConfidenceValidator {
    config: ValidatorConfig,
}

impl ConfidenceValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate candidates ranked most-similar first.
    pub fn validate(&self, candidates: &[MatchCandidate]) -> ValidationOutcome {
        let top = candidates.first().map_or(0.0, |c| c.similarity);
        let second = candidates.get(1).map_or(0.0, |c| c.similarity);
        let margin = top - second;

        let outcome = |stage: Option<ValidationStage>| ValidationOutcome {
            accepted: stage.is_none(),
            stage,
            identity_id: candidates.first().map(|c| c.identity_id.clone()),
            top_score: top,
            margin,
        };

        if candidates.is_empty() || top < self.config.min_confidence {
            return outcome(Some(ValidationStage::Confidence));
        }

        if margin + SCORE_EPSILON < self.config.min_margin {
            return outcome(Some(ValidationStage::Margin));
        }

        if let Some(third) = candidates.get(2) {
            let required = self.config.dominance_factor * self.config.min_margin;
            if top - third.similarity + SCORE_EPSILON < required {
                return outcome(Some(ValidationStage::Dominance));
            }
        }

        if let Some(ceiling) = self.config.distance_ceiling {
            let k = self.config.neighbor_count.max(1).min(candidates.len());
            let mean = candidates[..k].iter().map(|c| c.distance).sum::<f32>() / k as f32;
            if mean > ceiling {
                return outcome(Some(ValidationStage::DistanceConsistency));
            }
        }

        outcome(None)
    }
}
