//! Running validation metrics: counters plus derived rates.
//!
//! One [`ValidationMetrics`] lives inside the audit system for the whole
//! process; it is only reset on request.

use crate::sanitizer::SanitizationAction;
use crate::types::HallucinationType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One validated turn, as seen by the counters.
#[derive(Debug, Clone)]
pub struct TurnSample<'a> {
    pub action: SanitizationAction,
    /// Confidence 0-100.
    pub confidence: u32,
    pub response_time_ms: u64,
    pub hallucinations: &'a [(HallucinationType, f64)],
}

#[derive(Debug, Default, Clone)]
pub struct ValidationMetrics {
    pub total_queries: u64,
    pub queries_with_hallucinations: u64,
    pub hallucinations_detected: u64,
    pub responses_blocked: u64,
    pub responses_modified: u64,
    pub responses_passed: u64,
    pub hallucinations_by_type: BTreeMap<String, u64>,
    confidence_sum: u64,
    severity_sum: f64,
    response_time_sum_ms: u64,
}

impl ValidationMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one turn.
    pub fn record(&mut self, sample: &TurnSample<'_>) {
        self.total_queries += 1;
        self.confidence_sum += u64::from(sample.confidence.min(100));
        self.response_time_sum_ms += sample.response_time_ms;

        match sample.action {
            SanitizationAction::Blocked => self.responses_blocked += 1,
            SanitizationAction::Redacted | SanitizationAction::Warned => {
                self.responses_modified += 1
            }
            SanitizationAction::Passed => self.responses_passed += 1,
        }

        if !sample.hallucinations.is_empty() {
            self.queries_with_hallucinations += 1;
        }
        for (kind, severity) in sample.hallucinations {
            self.hallucinations_detected += 1;
            self.severity_sum += severity.clamp(0.0, 1.0);
            *self
                .hallucinations_by_type
                .entry(kind.as_str().to_string())
                .or_insert(0) += 1;
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let per_query = |count: u64| ratio(count as f64, self.total_queries);
        MetricsSnapshot {
            total_queries: self.total_queries,
            hallucinations_detected: self.hallucinations_detected,
            responses_blocked: self.responses_blocked,
            responses_modified: self.responses_modified,
            responses_passed: self.responses_passed,
            hallucinations_by_type: self.hallucinations_by_type.clone(),
            hallucination_rate: per_query(self.queries_with_hallucinations),
            block_rate: per_query(self.responses_blocked),
            modification_rate: per_query(self.responses_modified),
            pass_rate: per_query(self.responses_passed),
            avg_confidence: ratio(self.confidence_sum as f64, self.total_queries),
            avg_severity: ratio(self.severity_sum, self.hallucinations_detected),
            avg_response_time_ms: ratio(self.response_time_sum_ms as f64, self.total_queries),
        }
    }
}

fn ratio(numerator: f64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator / denominator as f64
    }
}

/// Immutable snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub hallucinations_detected: u64,
    pub responses_blocked: u64,
    pub responses_modified: u64,
    pub responses_passed: u64,
    pub hallucinations_by_type: BTreeMap<String, u64>,
    /// Share of queries with at least one hallucination.
    pub hallucination_rate: f64,
    pub block_rate: f64,
    pub modification_rate: f64,
    pub pass_rate: f64,
    /// 0-100.
    pub avg_confidence: f64,
    /// Mean severity over all detected hallucinations.
    pub avg_severity: f64,
    pub avg_response_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_default() {
        let snapshot = ValidationMetrics::new().snapshot();
        assert_eq!(snapshot.total_queries, 0);
        assert_eq!(snapshot.hallucination_rate, 0.0);
        assert_eq!(snapshot.avg_severity, 0.0);
    }

    #[test]
    fn test_record_and_rates() {
        let mut m = ValidationMetrics::new();
        m.record(&TurnSample {
            action: SanitizationAction::Passed,
            confidence: 90,
            response_time_ms: 100,
            hallucinations: &[],
        });
        m.record(&TurnSample {
            action: SanitizationAction::Blocked,
            confidence: 50,
            response_time_ms: 300,
            hallucinations: &[
                (HallucinationType::FabricatedEndpoint, 1.0),
                (HallucinationType::FabricatedPrice, 0.8),
            ],
        });
        m.record(&TurnSample {
            action: SanitizationAction::Warned,
            confidence: 70,
            response_time_ms: 200,
            hallucinations: &[(HallucinationType::FabricatedPrice, 0.3)],
        });

        let s = m.snapshot();
        assert_eq!(s.total_queries, 3);
        assert_eq!(s.hallucinations_detected, 3);
        assert_eq!(s.responses_blocked, 1);
        assert_eq!(s.responses_modified, 1);
        assert_eq!(s.responses_passed, 1);
        assert_eq!(s.hallucinations_by_type["fabricated_price"], 2);
        assert!((s.hallucination_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((s.block_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((s.avg_confidence - 70.0).abs() < 1e-9);
        assert!((s.avg_severity - 0.7).abs() < 1e-9);
        assert!((s.avg_response_time_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let mut m = ValidationMetrics::new();
        m.record(&TurnSample {
            action: SanitizationAction::Redacted,
            confidence: 10,
            response_time_ms: 5,
            hallucinations: &[(HallucinationType::ConflictingInfo, 0.6)],
        });
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(ValidationMetrics::new().snapshot()).unwrap();
        assert!(json.get("totalQueries").is_some());
        assert!(json.get("hallucinationsByType").is_some());
        assert!(json.get("avgResponseTimeMs").is_some());
    }
}
