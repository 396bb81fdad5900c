//! PII redaction for audit records.
//!
//! Queries, response previews and flagged fragments pass through an
//! [`OutputRedactor`] before they reach the audit trail. The built-in
//! [`PiiRedactor`] replaces matches with `[REDACTED:<KIND>]` markers.

use crate::config::PrivacyConfig;
use regex::Regex;
use std::sync::Arc;

/// Strips personal data from text before it is stored.
pub trait OutputRedactor: Send + Sync {
    fn redact(&self, text: &str) -> String;
}

/// Passes text through unchanged. Used when `redact_pii` is off.
pub struct NoOpRedactor;

impl OutputRedactor for NoOpRedactor {
    fn redact(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Fixed-pattern redactor for emails, card numbers, SSNs, phone numbers and
/// 6-10 digit document IDs.
pub struct PiiRedactor {
    patterns: Vec<(Regex, &'static str)>,
}

impl PiiRedactor {
    pub fn new() -> Self {
        // Order matters: card numbers before document IDs, and bare digit
        // runs claimed as document IDs before the phone pattern.
        let specs: [(&str, &'static str); 5] = [
            (r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}", "EMAIL"),
            (r"\b(?:\d[ \-]?){12,18}\d\b", "CARD_NUMBER"),
            (r"\b\d{3}-\d{2}-\d{4}\b", "SSN"),
            (r"\b\d{6,10}\b", "DOCUMENT_ID"),
            (
                r"(?:\+\d{1,3}[\s.\-]?)?\(?\b\d{3}\)?[\s.\-]?\d{3}[\s.\-]?\d{4}\b",
                "PHONE",
            ),
        ];
        let patterns = specs
            .into_iter()
            .filter_map(|(pattern, name)| match Regex::new(pattern) {
                Ok(re) => Some((re, name)),
                Err(e) => {
                    tracing::warn!(pattern = name, error = %e, "Failed to compile PII pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }
}

impl Default for PiiRedactor {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputRedactor for PiiRedactor {
    fn redact(&self, text: &str) -> String {
        let mut result = text.to_string();
        for (pattern, name) in &self.patterns {
            result = pattern
                .replace_all(&result, format!("[REDACTED:{name}]").as_str())
                .into_owned();
        }
        result
    }
}

pub type SharedRedactor = Arc<dyn OutputRedactor>;

/// Redactor matching the privacy settings.
pub fn redactor_for(privacy: &PrivacyConfig) -> SharedRedactor {
    if privacy.redact_pii {
        Arc::new(PiiRedactor::new())
    } else {
        Arc::new(NoOpRedactor)
    }
}
