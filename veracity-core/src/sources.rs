//! Source tracking: filters, cleans, deduplicates and ranks retrieved passages.

use crate::config::ValidationConfig;
use crate::text::slugify;
use crate::types::{RawResult, Source};
use std::collections::HashMap;
use std::path::Path;

/// Boilerplate prefixes that indexers leave on chunk titles.
const TITLE_PREFIXES: &[&str] = &[
    "Documentation - ",
    "Documentation: ",
    "Docs - ",
    "Docs: ",
    "API Reference - ",
    "API Reference: ",
    "Untitled - ",
    "# ",
    "## ",
    "### ",
];

/// Section names too generic to be worth linking to.
const GENERIC_SECTIONS: &[&str] = &[
    "intro",
    "introduction",
    "overview",
    "response",
    "responses",
    "parameters",
    "request",
    "example",
    "examples",
    "summary",
];

/// Ranked, deduplicated view of one retrieval.
#[derive(Debug, Clone, Default)]
pub struct SourceTracker {
    sources: Vec<Source>,
    total_considered: usize,
}

impl SourceTracker {
    /// Track a retrieval using the thresholds and base URL from `config`.
    pub fn track(results: &[RawResult], config: &ValidationConfig) -> Self {
        let min_score = config.min_score_threshold;
        let base_url = config.docs_base_url.as_deref();

        let mut by_key: HashMap<String, Source> = HashMap::new();
        for result in results {
            let score = if result.score.is_finite() {
                result.score.clamp(0.0, 1.0)
            } else {
                0.0
            };
            if score < min_score {
                continue;
            }

            let mut source = result.chunk.clone();
            source.score = score;
            if source.id.is_empty() {
                source.id = result.id.clone();
            }
            source.title = clean_title(&source.title, &source.source_path);
            if source.url.as_deref().is_none_or(str::is_empty) {
                source.url = base_url.and_then(|base| docs_url(base, &source));
            }

            let key = dedup_key(&source);
            match by_key.get(&key) {
                Some(existing) if existing.score >= source.score => {}
                _ => {
                    by_key.insert(key, source);
                }
            }
        }

        let mut sources: Vec<Source> = by_key.into_values().collect();
        sources.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.title.cmp(&b.title))
        });

        Self {
            sources,
            total_considered: results.len(),
        }
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn into_sources(self) -> Vec<Source> {
        self.sources
    }

    /// At least one source survived filtering.
    pub fn has_sufficient_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// Number of hits before filtering and deduplication.
    pub fn total_considered(&self) -> usize {
        self.total_considered
    }
}

fn dedup_key(source: &Source) -> String {
    if let Some(url) = source.url.as_deref().filter(|u| !u.is_empty()) {
        return url.to_string();
    }
    if !source.title.is_empty() {
        return source.title.to_lowercase();
    }
    source.id.clone()
}

/// Strip boilerplate prefixes; fall back to the prettified file name.
pub fn clean_title(title: &str, source_path: &str) -> String {
    let mut cleaned = title.trim_start();
    loop {
        let before = cleaned;
        for prefix in TITLE_PREFIXES {
            if let Some(rest) = cleaned.strip_prefix(prefix) {
                cleaned = rest.trim_start();
            }
        }
        if cleaned == before {
            break;
        }
    }
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        prettify_path(source_path)
    } else {
        cleaned.to_string()
    }
}

/// `docs/api/rate-limits.md` -> `Rate Limits`.
pub fn prettify_path(source_path: &str) -> String {
    let stem = Path::new(source_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    stem.split(['-', '_', ' '])
        .filter(|w| !w.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Anchor from the trailing `Page - Section` / `Page > Section` segment.
pub fn section_anchor(title: &str) -> Option<String> {
    let idx = [" - ", " > "]
        .iter()
        .filter_map(|sep| title.rfind(sep).map(|i| i + sep.len()))
        .max()?;
    let section = title[idx..].trim();
    if section.is_empty() || GENERIC_SECTIONS.contains(&section.to_lowercase().as_str()) {
        return None;
    }
    let slug = slugify(section);
    (!slug.is_empty()).then_some(slug)
}

fn docs_url(base: &str, source: &Source) -> Option<String> {
    let path = source
        .source_path
        .trim_start_matches("./")
        .trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let path = match path.rfind('.') {
        Some(dot) if !path[dot..].contains('/') => &path[..dot],
        _ => path,
    };
    let mut url = format!("{}/{}", base.trim_end_matches('/'), path);
    if let Some(anchor) = section_anchor(&source.title) {
        url.push('#');
        url.push_str(&anchor);
    }
    Some(url)
}
