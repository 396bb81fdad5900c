//! Groundedness scoring: turns a list of scored sources into a confidence level.

use crate::config::ValidationConfig;
use crate::types::{Groundedness, Source};
use serde::Serialize;

/// Result of scoring a source set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GroundednessScore {
    pub level: Groundedness,
    /// Penalty-adjusted weighted average in `[0, 1]`.
    pub avg_score: f64,
    /// `round(avg_score * 100)`.
    pub confidence: u32,
}

impl GroundednessScore {
    pub fn ungrounded() -> Self {
        Self {
            level: Groundedness::Ungrounded,
            avg_score: 0.0,
            confidence: 0,
        }
    }
}

/// Scores source sets with a quadratic-weighted average.
#[derive(Debug, Clone)]
pub struct GroundednessCalculator {
    high: f64,
    medium: f64,
    low: f64,
    low_source_penalty: f64,
}

impl Default for GroundednessCalculator {
    fn default() -> Self {
        Self::new(&ValidationConfig::default())
    }
}

impl GroundednessCalculator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            high: config.high_threshold,
            medium: config.medium_threshold,
            low: config.low_threshold,
            low_source_penalty: config.low_source_penalty,
        }
    }

    /// Score a source set. Never fails: empty input is `ungrounded/0/0`.
    pub fn calculate(&self, sources: &[Source]) -> GroundednessScore {
        let scores: Vec<f64> = sources
            .iter()
            .map(|s| {
                if s.score.is_finite() {
                    s.score.clamp(0.0, 1.0)
                } else {
                    0.0
                }
            })
            .collect();
        if scores.is_empty() {
            return GroundednessScore::ungrounded();
        }

        // Weight each score by its square so strong hits dominate.
        let weight_sum: f64 = scores.iter().map(|s| s * s).sum();
        let weighted = if weight_sum > 0.0 {
            scores.iter().map(|s| s * s * s).sum::<f64>() / weight_sum
        } else {
            0.0
        };

        let adjusted = if scores.len() < 2 {
            (weighted - self.low_source_penalty).clamp(0.0, 1.0)
        } else {
            weighted.clamp(0.0, 1.0)
        };

        GroundednessScore {
            level: self.level_for(adjusted, scores.len()),
            avg_score: adjusted,
            confidence: (adjusted * 100.0).round() as u32,
        }
    }

    fn level_for(&self, score: f64, source_count: usize) -> Groundedness {
        if score >= self.high && source_count >= 2 {
            Groundedness::High
        } else if score >= self.medium {
            Groundedness::Medium
        } else if score >= self.low {
            Groundedness::Low
        } else {
            Groundedness::Ungrounded
        }
    }
}
