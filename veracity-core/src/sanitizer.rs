//! Response sanitizer: the severity-driven policy ladder.
//!
//! The highest hallucination severity picks one of four actions. Blocking
//! replaces the answer with a fallback, redaction swaps flagged fragments for
//! safe placeholders, warning marks them inline, and passing leaves the text
//! alone apart from an optional citation footer.

use crate::config::SanitizerConfig;
use crate::types::{Groundedness, Hallucination, HallucinationType, Source, max_severity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};

pub const FALLBACK_MESSAGE: &str = "I couldn't verify this answer against the available \
documentation, so I'm not showing it to avoid giving you incorrect information. \
Please check the official documentation or try rephrasing your question.";

pub const RELATED_SOURCES_HEADER: &str = "You may find these documentation pages helpful:";

pub const WARNING_FOOTER: &str = "**Note:** Some details in this answer could not be verified \
against the documentation. Please confirm them before relying on them.";

pub const CITATIONS_HEADER: &str = "**Sources:**";

pub const UNVERIFIED_MARKER: &str = "[unverified] ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SanitizationAction {
    Passed,
    Warned,
    Redacted,
    Blocked,
}

impl fmt::Display for SanitizationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SanitizationAction::Passed => write!(f, "passed"),
            SanitizationAction::Warned => write!(f, "warned"),
            SanitizationAction::Redacted => write!(f, "redacted"),
            SanitizationAction::Blocked => write!(f, "blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationMetadata {
    pub max_severity: f64,
    pub hallucination_count: usize,
    pub groundedness: Groundedness,
    pub citations_added: usize,
    pub original_length: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationResult {
    pub content: String,
    pub action: SanitizationAction,
    pub modifications: Vec<String>,
    pub was_modified: bool,
    pub metadata: SanitizationMetadata,
}

/// Per-action counters since construction or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizerStats {
    pub passed: u64,
    pub warned: u64,
    pub redacted: u64,
    pub blocked: u64,
}

impl SanitizerStats {
    pub fn total(&self) -> u64 {
        self.passed + self.warned + self.redacted + self.blocked
    }
}

/// Safe replacement text for a redacted fragment.
pub fn placeholder(kind: HallucinationType) -> &'static str {
    match kind {
        HallucinationType::FabricatedEndpoint => "[endpoint not found in the documentation]",
        HallucinationType::FabricatedPrice => {
            "[pricing information not available - please check the official pricing page]"
        }
        HallucinationType::FabricatedParameter => "[parameter not documented]",
        HallucinationType::UnsupportedCountry => "[country coverage not confirmed]",
        HallucinationType::IncorrectMethod => "[HTTP method not confirmed by the documentation]",
        HallucinationType::FabricatedFeature => "[feature not confirmed by the documentation]",
        HallucinationType::ConflictingInfo => "[conflicting information removed]",
    }
}

#[derive(Debug, Default)]
pub struct ResponseSanitizer {
    config: SanitizerConfig,
    passed: AtomicU64,
    warned: AtomicU64,
    redacted: AtomicU64,
    blocked: AtomicU64,
}

impl ResponseSanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &SanitizerConfig {
        &self.config
    }

    /// Map a maximum severity onto the action ladder.
    pub fn decide_action(&self, max_severity: f64) -> SanitizationAction {
        if max_severity >= self.config.block_threshold {
            SanitizationAction::Blocked
        } else if max_severity >= self.config.redact_threshold {
            SanitizationAction::Redacted
        } else if max_severity >= self.config.warn_threshold {
            SanitizationAction::Warned
        } else {
            SanitizationAction::Passed
        }
    }

    pub fn sanitize(
        &self,
        content: &str,
        hallucinations: &[Hallucination],
        groundedness: Groundedness,
        sources: &[Source],
    ) -> SanitizationResult {
        let max = max_severity(hallucinations);
        let mut metadata = SanitizationMetadata {
            max_severity: max,
            hallucination_count: hallucinations.len(),
            groundedness,
            citations_added: 0,
            original_length: content.len(),
        };

        // Disabled sanitizers and empty answers pass through untouched.
        let bypass = !self.config.enabled || content.trim().is_empty();
        let action = if bypass {
            SanitizationAction::Passed
        } else {
            self.decide_action(max)
        };

        let mut modifications = Vec::new();
        let sanitized = if bypass {
            content.to_string()
        } else {
            match action {
                SanitizationAction::Blocked => {
                    modifications.push(format!(
                        "Blocked response (max severity {max:.2}); replaced with fallback message"
                    ));
                    self.fallback(sources)
                }
                SanitizationAction::Redacted => {
                    let mut text = redact(content, hallucinations, &mut modifications);
                    text = self.with_footer(text, &mut modifications);
                    self.with_citations(text, sources, &mut metadata, &mut modifications)
                }
                SanitizationAction::Warned => {
                    let mut text = mark_unverified(content, hallucinations, &mut modifications);
                    text = self.with_footer(text, &mut modifications);
                    self.with_citations(text, sources, &mut metadata, &mut modifications)
                }
                SanitizationAction::Passed => self.with_citations(
                    content.to_string(),
                    sources,
                    &mut metadata,
                    &mut modifications,
                ),
            }
        };

        self.record(action);
        match action {
            SanitizationAction::Blocked | SanitizationAction::Redacted => tracing::info!(
                %action,
                max_severity = max,
                hallucinations = hallucinations.len(),
                "Sanitized response"
            ),
            _ => tracing::debug!(%action, max_severity = max, "Sanitized response"),
        }

        SanitizationResult {
            was_modified: sanitized != content,
            content: sanitized,
            action,
            modifications,
            metadata,
        }
    }

    fn fallback(&self, sources: &[Source]) -> String {
        let related: Vec<&str> = sources
            .iter()
            .map(|s| s.title.trim())
            .filter(|t| !t.is_empty())
            .take(self.config.max_related_sources)
            .collect();
        let mut text = FALLBACK_MESSAGE.to_string();
        if !related.is_empty() {
            text.push_str("\n\n");
            text.push_str(RELATED_SOURCES_HEADER);
            for title in related {
                text.push_str("\n- ");
                text.push_str(title);
            }
        }
        text
    }

    fn with_footer(&self, mut text: String, modifications: &mut Vec<String>) -> String {
        if !text.contains(WARNING_FOOTER) {
            text.push_str("\n\n---\n");
            text.push_str(WARNING_FOOTER);
            modifications.push("Appended verification warning".into());
        }
        text
    }

    fn with_citations(
        &self,
        mut text: String,
        sources: &[Source],
        metadata: &mut SanitizationMetadata,
        modifications: &mut Vec<String>,
    ) -> String {
        if !self.config.append_citations || text.contains(CITATIONS_HEADER) {
            return text;
        }
        let cited: Vec<&Source> = sources
            .iter()
            .filter(|s| s.score >= self.config.min_citation_score)
            .take(self.config.max_citations)
            .collect();
        if cited.is_empty() {
            return text;
        }

        text.push_str("\n\n");
        text.push_str(CITATIONS_HEADER);
        for source in &cited {
            let title = if source.title.trim().is_empty() {
                source.id.as_str()
            } else {
                source.title.trim()
            };
            let pct = (source.score * 100.0).round();
            match source.url.as_deref().filter(|u| !u.is_empty()) {
                Some(url) => text.push_str(&format!("\n- [{title}]({url}) ({pct}% match)")),
                None => text.push_str(&format!("\n- {title} ({pct}% match)")),
            }
        }
        metadata.citations_added = cited.len();
        modifications.push(format!("Appended {} source citation(s)", cited.len()));
        text
    }

    fn record(&self, action: SanitizationAction) {
        let counter = match action {
            SanitizationAction::Passed => &self.passed,
            SanitizationAction::Warned => &self.warned,
            SanitizationAction::Redacted => &self.redacted,
            SanitizationAction::Blocked => &self.blocked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SanitizerStats {
        SanitizerStats {
            passed: self.passed.load(Ordering::Relaxed),
            warned: self.warned.load(Ordering::Relaxed),
            redacted: self.redacted.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        for counter in [&self.passed, &self.warned, &self.redacted, &self.blocked] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Flagged fragments with a positive severity, most severe first.
fn by_severity(hallucinations: &[Hallucination]) -> Vec<&Hallucination> {
    let mut ordered: Vec<&Hallucination> = hallucinations
        .iter()
        .filter(|h| h.effective_severity() > 0.0 && !h.detected.trim().is_empty())
        .collect();
    ordered.sort_by(|a, b| b.effective_severity().total_cmp(&a.effective_severity()));
    ordered
}

/// Characters that glue a neighbour onto a fragment: `$5` inside `$50`,
/// `/v2/users` inside `/v2/users/7`, `Peru` inside `Peruvian`.
fn joins_token(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '/' | '-' | '$')
}

/// Byte ranges where `fragment` stands on its own in `text`. A trailing
/// `.` or `,` only ends the token when no digit or letter follows it, so
/// `$5` does not match inside `$5.00`.
fn standalone_matches(text: &str, fragment: &str) -> Vec<Range<usize>> {
    text.match_indices(fragment)
        .map(|(start, _)| start..start + fragment.len())
        .filter(|span| {
            let before = text[..span.start].chars().next_back();
            let mut after = text[span.end..].chars();
            let next = after.next();
            let continues_number = matches!(next, Some('.' | ','))
                && after.next().is_some_and(char::is_alphanumeric);
            !before.is_some_and(joins_token)
                && !next.is_some_and(joins_token)
                && !continues_number
        })
        .collect()
}

fn redact(
    content: &str,
    hallucinations: &[Hallucination],
    modifications: &mut Vec<String>,
) -> String {
    let mut text = content.to_string();
    for h in by_severity(hallucinations) {
        let fragment = h.detected.trim();
        let spans = standalone_matches(&text, fragment);
        if spans.is_empty() {
            continue;
        }
        for span in spans.iter().rev() {
            text.replace_range(span.clone(), placeholder(h.kind));
        }
        modifications.push(format!("Redacted {} '{}' ({}x)", h.kind, fragment, spans.len()));
    }
    text
}

fn mark_unverified(
    content: &str,
    hallucinations: &[Hallucination],
    modifications: &mut Vec<String>,
) -> String {
    let mut text = content.to_string();
    for h in by_severity(hallucinations) {
        let fragment = h.detected.trim();
        let Some(span) = standalone_matches(&text, fragment).into_iter().next() else {
            continue;
        };
        if text[..span.start].ends_with(UNVERIFIED_MARKER) {
            continue;
        }
        text.insert_str(span.start, UNVERIFIED_MARKER);
        modifications.push(format!("Marked {} '{}' as unverified", h.kind, fragment));
    }
    text
}
