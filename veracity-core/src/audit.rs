//! Audit trail for validated chat turns.
//!
//! Every turn is logged as a privacy-filtered [`AuditEntry`], folded into the
//! running [`ValidationMetrics`], tracked as an incident when hallucinations
//! were found, and checked against alert thresholds. Entries sit in a bounded
//! in-memory ring until [`AuditSystem::flush`] persists them.

use crate::config::{AuditConfig, PrivacyConfig};
use crate::error::AuditError;
use crate::metrics::{MetricsSnapshot, TurnSample, ValidationMetrics};
use crate::persistence::{atomic_write_json, load_json, quarantine};
use crate::redact::{SharedRedactor, redactor_for};
use crate::sanitizer::SanitizationAction;
use crate::text::{sha256_hex, truncate_chars};
use crate::types::{Hallucination, HallucinationType, Source};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 200;
const MAX_RECENT_ALERTS: usize = 50;
const MAX_ENTRY_SOURCES: usize = 3;
const PATTERN_HASH_CHARS: usize = 16;

// ---------------------------------------------------------------------------
// Records and entries
// ---------------------------------------------------------------------------

/// Everything the pipeline knows about a finished turn.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub session_id: String,
    pub query: String,
    pub response: String,
    pub hallucinations: Vec<Hallucination>,
    pub action: SanitizationAction,
    /// Retrieval confidence, 0-100.
    pub confidence: u32,
    pub response_time_ms: u64,
    pub sources: Vec<Source>,
}

/// A flagged fragment as stored in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditHallucination {
    #[serde(rename = "type")]
    pub kind: HallucinationType,
    pub severity: f64,
    /// Redacted fragment.
    pub value: String,
    /// Hash of the raw, lowercased fragment. Stable across redaction.
    pub value_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetrics {
    pub confidence: u32,
    pub response_time_ms: u64,
    pub hallucination_count: usize,
    pub max_severity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySource {
    pub title: String,
    pub score: f64,
}

/// One persisted line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Redacted query text, or its SHA-256 when `query_hashed` is set.
    pub query: String,
    #[serde(default)]
    pub query_hashed: bool,
    pub response_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_preview: Option<String>,
    pub hallucinations: Vec<AuditHallucination>,
    pub action: SanitizationAction,
    pub metrics: EntryMetrics,
    pub sources: Vec<EntrySource>,
}

// ---------------------------------------------------------------------------
// Incidents and patterns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub entry_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub hallucinations: Vec<AuditHallucination>,
    pub max_severity: f64,
    pub action: SanitizationAction,
}

/// How often one `(type, fragment)` pair has been seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pattern {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: HallucinationType,
    /// Redacted example of the fragment.
    pub example: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// `type:hash-prefix` key of the pattern table.
pub fn pattern_key(kind: HallucinationType, value_hash: &str) -> String {
    let prefix: String = value_hash.chars().take(PATTERN_HASH_CHARS).collect();
    format!("{}:{prefix}", kind.as_str())
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighHallucinationRate,
    HighBlockRate,
    HighAverageSeverity,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertKind::HighHallucinationRate => "high_hallucination_rate",
            AlertKind::HighBlockRate => "high_block_rate",
            AlertKind::HighAverageSeverity => "high_average_severity",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub value: f64,
    pub threshold: f64,
    pub total_queries: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filter over audit entries. Every `Some` field must match.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub session_id: Option<String>,
    pub min_action: Option<SanitizationAction>,
    pub with_hallucinations: Option<bool>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    /// Entries whose action is at least this strict.
    pub fn min_action(mut self, action: SanitizationAction) -> Self {
        self.min_action = Some(action);
        self
    }

    pub fn flagged(mut self) -> Self {
        self.with_hallucinations = Some(true);
        self
    }

    pub fn clean(mut self) -> Self {
        self.with_hallucinations = Some(false);
        self
    }

    pub fn since(mut self, dt: DateTime<Utc>) -> Self {
        self.since = Some(dt);
        self
    }

    pub fn until(mut self, dt: DateTime<Utc>) -> Self {
        self.until = Some(dt);
        self
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(sid) = &self.session_id
            && &entry.session_id != sid
        {
            return false;
        }
        if let Some(min) = self.min_action
            && entry.action < min
        {
            return false;
        }
        if let Some(flagged) = self.with_hallucinations
            && entry.hallucinations.is_empty() == flagged
        {
            return false;
        }
        if let Some(since) = self.since
            && entry.timestamp < since
        {
            return false;
        }
        if let Some(until) = self.until
            && entry.timestamp > until
        {
            return false;
        }
        true
    }

    /// Apply the query to a slice of entries, preserving order.
    pub fn filter<'a>(&self, entries: &'a [AuditEntry]) -> Vec<&'a AuditEntry> {
        entries.iter().filter(|e| self.matches(e)).collect()
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeCount {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub generated_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    /// Most frequent first.
    pub hallucination_types: Vec<TypeCount>,
    pub recurring_patterns: Vec<Pattern>,
    pub incident_count: usize,
    pub recent_alerts: Vec<Alert>,
    pub pending_entries: usize,
}

// ---------------------------------------------------------------------------
// Audit system
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct AuditState {
    entries: VecDeque<AuditEntry>,
    /// Number of newest entries in `entries` not yet persisted. Stays zero
    /// when no log path is configured.
    unflushed: usize,
    metrics: ValidationMetrics,
    incidents: VecDeque<Incident>,
    patterns: HashMap<String, Pattern>,
    recent_alerts: VecDeque<Alert>,
    active_alerts: BTreeSet<AlertKind>,
}

/// Process-wide audit service. Construct once and share behind an `Arc`.
pub struct AuditSystem {
    config: AuditConfig,
    privacy: PrivacyConfig,
    redactor: SharedRedactor,
    state: Mutex<AuditState>,
    flush_lock: tokio::sync::Mutex<()>,
    alerts: broadcast::Sender<Alert>,
}

impl AuditSystem {
    pub fn new(config: AuditConfig, privacy: PrivacyConfig) -> Self {
        let (alerts, _) = broadcast::channel(256);
        Self {
            redactor: redactor_for(&privacy),
            config,
            privacy,
            state: Mutex::new(AuditState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            alerts,
        }
    }

    /// Replace the PII redactor.
    pub fn with_redactor(mut self, redactor: SharedRedactor) -> Self {
        self.redactor = redactor;
        self
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, AuditState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receive alert events as they fire.
    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.alerts.subscribe()
    }

    /// Log a finished turn. Returns the stored entry.
    pub fn record(&self, record: AuditRecord) -> AuditEntry {
        let entry = self.build_entry(&record);
        let fired = {
            let mut state = self.state();
            let max = self.config.max_memory_entries.max(1);
            state.entries.push_back(entry.clone());
            while state.entries.len() > max {
                state.entries.pop_front();
            }
            if self.config.log_path.is_some() {
                state.unflushed += 1;
                if state.unflushed > state.entries.len() {
                    let dropped = state.unflushed - state.entries.len();
                    tracing::warn!(dropped, "Audit buffer full; oldest unflushed entries dropped");
                    state.unflushed = state.entries.len();
                }
            }
            self.absorb(&mut state, &entry);
            self.check_alerts(&mut state)
        };

        for alert in fired {
            tracing::warn!(
                kind = %alert.kind,
                value = alert.value,
                threshold = alert.threshold,
                "Validation alert"
            );
            // No subscribers is fine.
            let _ = self.alerts.send(alert);
        }
        entry
    }

    fn build_entry(&self, record: &AuditRecord) -> AuditEntry {
        let (query, query_hashed) = if self.privacy.hash_queries {
            (sha256_hex(&record.query), true)
        } else {
            (self.redactor.redact(&record.query), false)
        };
        let response_preview = (!self.privacy.hash_responses).then(|| {
            let redacted = self.redactor.redact(&record.response);
            truncate_chars(&redacted, PREVIEW_CHARS).to_string()
        });

        let hallucinations: Vec<AuditHallucination> = record
            .hallucinations
            .iter()
            .map(|h| AuditHallucination {
                kind: h.kind,
                severity: h.effective_severity(),
                value: self.redactor.redact(&h.detected),
                value_hash: sha256_hex(&h.detected.to_lowercase()),
            })
            .collect();

        AuditEntry {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id: record.session_id.clone(),
            query,
            query_hashed,
            response_hash: sha256_hex(&record.response),
            response_preview,
            metrics: EntryMetrics {
                confidence: record.confidence.min(100),
                response_time_ms: record.response_time_ms,
                hallucination_count: hallucinations.len(),
                max_severity: crate::types::max_severity(&record.hallucinations),
            },
            hallucinations,
            action: record.action,
            sources: record
                .sources
                .iter()
                .take(MAX_ENTRY_SOURCES)
                .map(|s| EntrySource {
                    title: s.title.clone(),
                    score: s.score,
                })
                .collect(),
        }
    }

    /// Fold an entry into metrics, incidents and patterns.
    fn absorb(&self, state: &mut AuditState, entry: &AuditEntry) {
        let samples: Vec<(HallucinationType, f64)> = entry
            .hallucinations
            .iter()
            .map(|h| (h.kind, h.severity))
            .collect();
        state.metrics.record(&TurnSample {
            action: entry.action,
            confidence: entry.metrics.confidence,
            response_time_ms: entry.metrics.response_time_ms,
            hallucinations: &samples,
        });

        if entry.hallucinations.is_empty() {
            return;
        }

        state.incidents.push_back(Incident {
            entry_id: entry.id,
            timestamp: entry.timestamp,
            session_id: entry.session_id.clone(),
            hallucinations: entry.hallucinations.clone(),
            max_severity: entry.metrics.max_severity,
            action: entry.action,
        });
        while state.incidents.len() > self.config.max_incidents.max(1) {
            state.incidents.pop_front();
        }

        for h in &entry.hallucinations {
            let key = pattern_key(h.kind, &h.value_hash);
            let pattern = state.patterns.entry(key.clone()).or_insert_with(|| Pattern {
                key,
                kind: h.kind,
                example: h.value.clone(),
                count: 0,
                first_seen: entry.timestamp,
                last_seen: entry.timestamp,
            });
            pattern.count += 1;
            pattern.last_seen = pattern.last_seen.max(entry.timestamp);
            pattern.first_seen = pattern.first_seen.min(entry.timestamp);
            if pattern.count == self.config.recurring_threshold {
                tracing::info!(
                    pattern = %pattern.key,
                    count = pattern.count,
                    "Recurring hallucination pattern"
                );
            }
        }
    }

    /// Alerts fire when a rate crosses its threshold and re-arm once it drops back.
    fn check_alerts(&self, state: &mut AuditState) -> Vec<Alert> {
        let snapshot = state.metrics.snapshot();
        let checks = [
            (
                AlertKind::HighHallucinationRate,
                snapshot.hallucination_rate,
                self.config.hallucination_rate_alert,
            ),
            (
                AlertKind::HighBlockRate,
                snapshot.block_rate,
                self.config.block_rate_alert,
            ),
            (
                AlertKind::HighAverageSeverity,
                snapshot.avg_severity,
                self.config.avg_severity_alert,
            ),
        ];

        let mut fired = Vec::new();
        for (kind, value, threshold) in checks {
            if value > threshold {
                if state.active_alerts.insert(kind) {
                    let alert = Alert {
                        kind,
                        value,
                        threshold,
                        total_queries: snapshot.total_queries,
                        timestamp: Utc::now(),
                    };
                    state.recent_alerts.push_back(alert.clone());
                    while state.recent_alerts.len() > MAX_RECENT_ALERTS {
                        state.recent_alerts.pop_front();
                    }
                    fired.push(alert);
                }
            } else {
                state.active_alerts.remove(&kind);
            }
        }
        fired
    }

    // -- Reads ---------------------------------------------------------------

    pub fn metrics(&self) -> MetricsSnapshot {
        self.state().metrics.snapshot()
    }

    /// Newest first.
    pub fn recent_entries(&self, n: usize) -> Vec<AuditEntry> {
        self.state().entries.iter().rev().take(n).cloned().collect()
    }

    /// Newest first.
    pub fn recent_incidents(&self, n: usize) -> Vec<Incident> {
        self.state().incidents.iter().rev().take(n).cloned().collect()
    }

    /// In-memory entries matching `query`, oldest first.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEntry> {
        self.state()
            .entries
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect()
    }

    /// Patterns seen at least `recurring_threshold` times, most frequent first.
    pub fn recurring_patterns(&self) -> Vec<Pattern> {
        let state = self.state();
        let mut patterns: Vec<Pattern> = state
            .patterns
            .values()
            .filter(|p| p.count >= self.config.recurring_threshold)
            .cloned()
            .collect();
        patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
        patterns
    }

    pub fn pending_entries(&self) -> usize {
        self.state().unflushed
    }

    pub fn report(&self) -> AuditReport {
        let recurring_patterns = self.recurring_patterns();
        let state = self.state();
        let metrics = state.metrics.snapshot();
        let mut hallucination_types: Vec<TypeCount> = metrics
            .hallucinations_by_type
            .iter()
            .map(|(kind, count)| TypeCount {
                kind: kind.clone(),
                count: *count,
            })
            .collect();
        hallucination_types.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));

        AuditReport {
            generated_at: Utc::now(),
            metrics,
            hallucination_types,
            recurring_patterns,
            incident_count: state.incidents.len(),
            recent_alerts: state.recent_alerts.iter().cloned().collect(),
            pending_entries: state.unflushed,
        }
    }

    /// Clear metrics, incidents, patterns and alerts. Unflushed entries are kept.
    pub fn reset(&self) {
        let mut state = self.state();
        state.metrics.reset();
        state.incidents.clear();
        state.patterns.clear();
        state.recent_alerts.clear();
        state.active_alerts.clear();
    }

    /// Rebuild metrics and patterns from a persisted log. Replayed entries
    /// count as already flushed and do not raise alerts.
    ///
    /// The log predates anything recorded in this process, so replayed
    /// entries go in front of the in-memory ring and pending entries stay
    /// the newest ones.
    pub fn replay(&self, entries: Vec<AuditEntry>) {
        let mut state = self.state();
        let max = self.config.max_memory_entries.max(1);
        for entry in &entries {
            self.absorb(&mut state, entry);
        }
        let pending = std::mem::take(&mut state.entries);
        let mut ring: VecDeque<AuditEntry> = entries.into();
        ring.extend(pending);
        if ring.len() > max {
            ring.drain(..ring.len() - max);
        }
        state.entries = ring;
        state.unflushed = state.unflushed.min(state.entries.len());
    }

    // -- Persistence ---------------------------------------------------------

    /// Append unflushed entries to the durable log.
    ///
    /// Returns how many entries were written. On failure the entries stay
    /// queued for the next attempt.
    pub async fn flush(&self) -> Result<usize, AuditError> {
        let Some(path) = self.config.log_path.clone() else {
            return Ok(0);
        };
        let _guard = self.flush_lock.lock().await;

        let batch: Vec<AuditEntry> = {
            let state = self.state();
            let skip = state.entries.len() - state.unflushed;
            state.entries.iter().skip(skip).cloned().collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        let max = self.config.max_memory_entries.max(1);
        let write_path = path.clone();
        let written = tokio::task::spawn_blocking(move || merge_into_log(&write_path, batch, max))
            .await
            .map_err(|e| AuditError::Io(format!("flush task failed: {e}")))
            .and_then(|r| r);

        match written {
            Ok(total) => {
                let mut state = self.state();
                state.unflushed = state.unflushed.saturating_sub(count);
                tracing::debug!(
                    path = %path.display(),
                    flushed = count,
                    total,
                    "Audit log flushed"
                );
                Ok(count)
            }
            Err(e) => {
                tracing::error!(
                    path = %path.display(),
                    error = %e,
                    pending = count,
                    "Audit flush failed; entries retained"
                );
                Err(e)
            }
        }
    }

    /// Flush every `flush_interval_secs` until `cancel` fires, then flush once more.
    pub fn spawn_flush_task(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.flush_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = self.flush().await {
                            tracing::error!(error = %e, "Final audit flush failed");
                        }
                        break;
                    }
                    _ = ticker.tick() => {
                        // Failures are logged inside flush and retried next tick.
                        let _ = self.flush().await;
                    }
                }
            }
        })
    }
}

/// Load the on-disk log, append `batch`, keep the newest `max`, write back.
fn merge_into_log(path: &Path, batch: Vec<AuditEntry>, max: usize) -> Result<usize, AuditError> {
    let mut entries: Vec<AuditEntry> = match load_json(path) {
        Ok(existing) => existing.unwrap_or_default(),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            let moved = quarantine(path).map_err(|e| AuditError::Io(e.to_string()))?;
            tracing::warn!(
                moved_to = %moved.display(),
                error = %e,
                "Unreadable audit log moved aside"
            );
            Vec::new()
        }
        Err(e) => return Err(AuditError::Io(e.to_string())),
    };
    entries.extend(batch);
    if entries.len() > max {
        entries.drain(..entries.len() - max);
    }
    atomic_write_json(path, &entries).map_err(|e| AuditError::Io(e.to_string()))?;
    Ok(entries.len())
}

/// Read a persisted audit log. Missing files read as empty.
pub fn load_log(path: &Path) -> Result<Vec<AuditEntry>, AuditError> {
    match load_json(path) {
        Ok(entries) => Ok(entries.unwrap_or_default()),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            Err(AuditError::Serialization(e.to_string()))
        }
        Err(e) => Err(AuditError::Io(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn system() -> AuditSystem {
        AuditSystem::new(AuditConfig::default(), PrivacyConfig::default())
    }

    /// A system with a log path under `dir`, so recorded entries queue for flushing.
    fn durable(dir: &TempDir, max_memory_entries: usize) -> AuditSystem {
        AuditSystem::new(
            AuditConfig {
                log_path: Some(dir.path().join("audit.json")),
                max_memory_entries,
                ..Default::default()
            },
            PrivacyConfig::default(),
        )
    }

    fn record(action: SanitizationAction, hallucinations: Vec<Hallucination>) -> AuditRecord {
        AuditRecord {
            session_id: "s-1".into(),
            query: "What does /v2/colombian-citizens cost? mail ana@example.com".into(),
            response: "It costs $0.25 per lookup.".into(),
            hallucinations,
            action,
            confidence: 80,
            response_time_ms: 120,
            sources: vec![
                Source::new("a", "Citizens API", "", 0.9),
                Source::new("b", "Pricing", "", 0.8),
                Source::new("c", "Countries", "", 0.7),
                Source::new("d", "Extra", "", 0.6),
            ],
        }
    }

    fn endpoint(value: &str, severity: f64) -> Hallucination {
        Hallucination::new(HallucinationType::FabricatedEndpoint, value, "", severity)
    }

    #[test]
    fn test_record_builds_private_entry() {
        let audit = system();
        let entry = audit.record(record(SanitizationAction::Passed, vec![]));

        assert!(!entry.query_hashed);
        assert!(entry.query.contains("[REDACTED:EMAIL]"));
        assert!(!entry.query.contains("ana@example.com"));
        assert_eq!(entry.response_hash, sha256_hex("It costs $0.25 per lookup."));
        assert!(entry.response_preview.is_none());
        assert_eq!(entry.sources.len(), 3);
        assert_eq!(entry.metrics.hallucination_count, 0);
    }

    #[test]
    fn test_query_hashing_and_preview() {
        let audit = AuditSystem::new(
            AuditConfig::default(),
            PrivacyConfig {
                hash_queries: true,
                hash_responses: false,
                redact_pii: true,
            },
        );
        let rec = record(SanitizationAction::Passed, vec![]);
        let expected = sha256_hex(&rec.query);
        let entry = audit.record(rec);
        assert!(entry.query_hashed);
        assert_eq!(entry.query, expected);
        assert_eq!(entry.response_preview.as_deref(), Some("It costs $0.25 per lookup."));
    }

    #[test]
    fn test_memory_ring_is_bounded() {
        let dir = TempDir::new().unwrap();
        let audit = durable(&dir, 3);
        for _ in 0..5 {
            audit.record(record(SanitizationAction::Passed, vec![]));
        }
        assert_eq!(audit.recent_entries(10).len(), 3);
        assert_eq!(audit.pending_entries(), 3);
        assert_eq!(audit.metrics().total_queries, 5);
    }

    #[test]
    fn test_nothing_pends_without_log_path() {
        let audit = AuditSystem::new(
            AuditConfig {
                max_memory_entries: 3,
                ..Default::default()
            },
            PrivacyConfig::default(),
        );
        for _ in 0..5 {
            audit.record(record(SanitizationAction::Passed, vec![]));
        }
        assert_eq!(audit.recent_entries(10).len(), 3);
        assert_eq!(audit.pending_entries(), 0);
        assert_eq!(audit.report().pending_entries, 0);
        assert_eq!(audit.metrics().total_queries, 5);
    }

    #[test]
    fn test_replay_keeps_pending_entries_newest() {
        let dir = TempDir::new().unwrap();
        let history = {
            let old = system();
            (0..3)
                .map(|_| old.record(record(SanitizationAction::Passed, vec![])))
                .collect::<Vec<_>>()
        };

        let audit = durable(&dir, 4);
        let live = audit.record(record(
            SanitizationAction::Blocked,
            vec![endpoint("/v99/fake", 1.0)],
        ));
        audit.replay(history.clone());

        // Newest first.
        let recent = audit.recent_entries(10);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].id, live.id);
        assert_eq!(recent[3].id, history[0].id);
        assert_eq!(audit.pending_entries(), 1);
        assert_eq!(audit.metrics().total_queries, 4);

        // Over capacity, the oldest replayed entries fall off first.
        audit.replay(history);
        let recent = audit.recent_entries(10);
        assert_eq!(recent.len(), 4);
        assert_eq!(recent[0].id, live.id);
        assert_eq!(audit.pending_entries(), 1);
    }

    #[test]
    fn test_incidents_only_with_hallucinations() {
        let audit = system();
        audit.record(record(SanitizationAction::Passed, vec![]));
        audit.record(record(
            SanitizationAction::Blocked,
            vec![endpoint("/v99/fake-endpoint", 1.0)],
        ));
        let incidents = audit.recent_incidents(10);
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].action, SanitizationAction::Blocked);
        assert_eq!(incidents[0].max_severity, 1.0);
    }

    #[test]
    fn test_recurring_pattern_threshold() {
        let audit = system();
        for _ in 0..2 {
            audit.record(record(
                SanitizationAction::Blocked,
                vec![endpoint("/v99/fake-endpoint", 1.0)],
            ));
        }
        assert!(audit.recurring_patterns().is_empty());

        // Case differences hash to the same pattern.
        audit.record(record(
            SanitizationAction::Blocked,
            vec![endpoint("/V99/Fake-Endpoint", 1.0)],
        ));
        let recurring = audit.recurring_patterns();
        assert_eq!(recurring.len(), 1);
        assert_eq!(recurring[0].count, 3);
        assert!(recurring[0].key.starts_with("fabricated_endpoint:"));
    }

    #[test]
    fn test_incident_list_bounded() {
        let audit = AuditSystem::new(
            AuditConfig {
                max_incidents: 2,
                ..Default::default()
            },
            PrivacyConfig::default(),
        );
        for i in 0..4 {
            audit.record(record(
                SanitizationAction::Warned,
                vec![endpoint(&format!("/v{i}/x"), 0.3)],
            ));
        }
        assert_eq!(audit.recent_incidents(10).len(), 2);
    }

    #[tokio::test]
    async fn test_alerts_fire_once_per_crossing() {
        let audit = system();
        let mut rx = audit.subscribe();

        audit.record(record(
            SanitizationAction::Blocked,
            vec![endpoint("/v99/fake", 1.0)],
        ));
        let mut kinds = Vec::new();
        while let Ok(alert) = rx.try_recv() {
            kinds.push(alert.kind);
        }
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                AlertKind::HighHallucinationRate,
                AlertKind::HighBlockRate,
                AlertKind::HighAverageSeverity
            ]
        );

        // Still above threshold: no repeat.
        audit.record(record(
            SanitizationAction::Blocked,
            vec![endpoint("/v98/fake", 1.0)],
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(audit.report().recent_alerts.len(), 3);
    }

    #[test]
    fn test_report_ranks_types() {
        let dir = TempDir::new().unwrap();
        let audit = durable(&dir, 100);
        audit.record(record(
            SanitizationAction::Blocked,
            vec![
                endpoint("/v1/a", 1.0),
                endpoint("/v1/b", 1.0),
                Hallucination::new(HallucinationType::FabricatedPrice, "$9", "", 0.8),
            ],
        ));
        let report = audit.report();
        assert_eq!(report.hallucination_types[0].kind, "fabricated_endpoint");
        assert_eq!(report.hallucination_types[0].count, 2);
        assert_eq!(report.incident_count, 1);
        assert_eq!(report.pending_entries, 1);
    }

    #[test]
    fn test_reset_keeps_pending_entries() {
        let dir = TempDir::new().unwrap();
        let audit = durable(&dir, 100);
        audit.record(record(
            SanitizationAction::Blocked,
            vec![endpoint("/v99/fake", 1.0)],
        ));
        audit.reset();
        assert_eq!(audit.metrics().total_queries, 0);
        assert!(audit.recent_incidents(10).is_empty());
        assert_eq!(audit.pending_entries(), 1);
    }

    #[test]
    fn test_audit_query_filters() {
        let audit = system();
        audit.record(record(SanitizationAction::Passed, vec![]));
        let mut other = record(SanitizationAction::Redacted, vec![endpoint("/v1/x", 0.6)]);
        other.session_id = "s-2".into();
        audit.record(other);

        assert_eq!(audit.query(&AuditQuery::new().for_session("s-2")).len(), 1);
        assert_eq!(audit.query(&AuditQuery::new().flagged()).len(), 1);
        assert_eq!(audit.query(&AuditQuery::new().clean()).len(), 1);
        assert_eq!(
            audit
                .query(&AuditQuery::new().min_action(SanitizationAction::Warned))
                .len(),
            1
        );
        let future = Utc::now() + chrono::Duration::hours(1);
        assert!(audit.query(&AuditQuery::new().since(future)).is_empty());
    }

    #[tokio::test]
    async fn test_flush_without_log_path_is_noop() {
        let audit = system();
        audit.record(record(SanitizationAction::Passed, vec![]));
        assert_eq!(audit.flush().await.unwrap(), 0);
        assert_eq!(audit.pending_entries(), 0);
        assert_eq!(audit.recent_entries(1).len(), 1);
    }

    #[tokio::test]
    async fn test_flush_merges_and_trims() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit").join("log.json");
        let config = AuditConfig {
            log_path: Some(path.clone()),
            max_memory_entries: 3,
            ..Default::default()
        };

        let first = AuditSystem::new(config.clone(), PrivacyConfig::default());
        first.record(record(SanitizationAction::Passed, vec![]));
        first.record(record(SanitizationAction::Passed, vec![]));
        assert_eq!(first.flush().await.unwrap(), 2);
        assert_eq!(first.pending_entries(), 0);
        assert_eq!(first.flush().await.unwrap(), 0);

        let second = AuditSystem::new(config, PrivacyConfig::default());
        second.record(record(SanitizationAction::Blocked, vec![endpoint("/v9/x", 1.0)]));
        second.record(record(SanitizationAction::Passed, vec![]));
        second.flush().await.unwrap();

        let log = load_log(&path).unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].action, SanitizationAction::Blocked);
    }

    #[tokio::test]
    async fn test_flush_failure_retains_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        // A directory where the log file should be makes every write fail.
        std::fs::create_dir(&path).unwrap();

        let audit = AuditSystem::new(
            AuditConfig {
                log_path: Some(path.clone()),
                ..Default::default()
            },
            PrivacyConfig::default(),
        );
        audit.record(record(SanitizationAction::Passed, vec![]));
        assert!(audit.flush().await.is_err());
        assert_eq!(audit.pending_entries(), 1);

        std::fs::remove_dir(&path).unwrap();
        assert_eq!(audit.flush().await.unwrap(), 1);
        assert_eq!(audit.pending_entries(), 0);
        assert_eq!(load_log(&path).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flush_quarantines_corrupt_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        std::fs::write(&path, "[{broken").unwrap();

        let audit = AuditSystem::new(
            AuditConfig {
                log_path: Some(path.clone()),
                ..Default::default()
            },
            PrivacyConfig::default(),
        );
        audit.record(record(SanitizationAction::Passed, vec![]));
        assert_eq!(audit.flush().await.unwrap(), 1);
        assert_eq!(load_log(&path).unwrap().len(), 1);
        let moved = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(moved);
    }

    #[tokio::test]
    async fn test_flush_task_flushes_on_cancel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.json");
        let audit = Arc::new(AuditSystem::new(
            AuditConfig {
                log_path: Some(path.clone()),
                flush_interval_secs: 3600,
                ..Default::default()
            },
            PrivacyConfig::default(),
        ));
        let cancel = CancellationToken::new();
        let handle = audit.clone().spawn_flush_task(cancel.clone());

        audit.record(record(SanitizationAction::Passed, vec![]));
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(audit.pending_entries(), 0);
        assert_eq!(load_log(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_replay_rebuilds_patterns() {
        let source = system();
        for _ in 0..3 {
            source.record(record(
                SanitizationAction::Blocked,
                vec![endpoint("/v99/fake", 1.0)],
            ));
        }
        let mut entries = source.recent_entries(10);
        entries.reverse();

        let replayed = system();
        let mut rx = replayed.subscribe();
        replayed.replay(entries);
        assert_eq!(replayed.metrics().total_queries, 3);
        assert_eq!(replayed.recurring_patterns().len(), 1);
        assert_eq!(replayed.pending_entries(), 0);
        assert!(rx.try_recv().is_err());
    }
}
