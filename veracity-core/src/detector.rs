//! Pattern-based hallucination detection.
//!
//! A [`KnowledgeBase`] is built fresh for every request from that request's
//! sources: structured fields first, then a scan of the free-text content.
//! The [`HallucinationDetector`] matches technical patterns in the generated
//! answer against it.

use crate::claims::PARAMETER_RE;
use crate::text::surrounding_context;
use crate::types::{DetectionSource, Hallucination, HallucinationType, RawResult, Source};
use regex::{Match, Regex};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

const CONTEXT_RADIUS: usize = 50;
const MIN_ENDPOINT_LEN: usize = 5;
const PRICE_TOLERANCE: f64 = 0.01;

pub const SEVERITY_FABRICATED_ENDPOINT: f64 = 1.0;
pub const SEVERITY_FABRICATED_PRICE: f64 = 0.8;
pub const SEVERITY_UNSUPPORTED_COUNTRY: f64 = 0.9;
pub const SEVERITY_INCORRECT_METHOD: f64 = 0.7;

/// Path-like tokens, optionally with a scheme and host.
pub(crate) static ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:https?://[A-Za-z0-9.\-]+(?::\d+)?)?/[A-Za-z0-9_{}:.\-<>/~%]+(?:\?[^\s)`'\x22]*)?")
        .expect("valid pattern")
});

/// An HTTP verb directly followed by a path.
pub(crate) static METHOD_ENDPOINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(GET|POST|PUT|PATCH|DELETE|HEAD|OPTIONS)\s+`?((?:https?://[A-Za-z0-9.\-]+(?::\d+)?)?/[A-Za-z0-9_{}:.\-<>/~%]+)")
        .expect("valid pattern")
});

/// `$12.50`, `$1,000`, `12.50 USD`, `3 dollars`.
pub(crate) static PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\$\s?(\d[\d,]*(?:\.\d+)?)|\b(\d[\d,]*(?:\.\d+)?)\s?(?:USD|dollars?)\b")
        .expect("valid pattern")
});

/// Reference list of country names the detector knows how to spot.
pub const COUNTRIES: &[&str] = &[
    "Argentina",
    "Australia",
    "Bolivia",
    "Brazil",
    "Canada",
    "Chile",
    "China",
    "Colombia",
    "Costa Rica",
    "Ecuador",
    "France",
    "Germany",
    "Guatemala",
    "India",
    "Italy",
    "Japan",
    "Kenya",
    "Mexico",
    "Netherlands",
    "Nigeria",
    "Panama",
    "Paraguay",
    "Peru",
    "Portugal",
    "South Africa",
    "South Korea",
    "Spain",
    "United Kingdom",
    "United States",
    "Uruguay",
    "Venezuela",
];

pub(crate) static COUNTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    let names: Vec<String> = COUNTRIES
        .iter()
        .map(|c| c.split(' ').map(regex::escape).collect::<Vec<_>>().join(r"\s+"))
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", names.join("|"))).expect("valid pattern")
});

/// Lowercase and collapse internal whitespace: `United  States` -> `united states`.
pub(crate) fn canonical_country(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Path-like matches that are not the tail of another word (`and/or`, `24/7`).
pub(crate) fn endpoint_matches(text: &str) -> impl Iterator<Item = Match<'_>> {
    ENDPOINT_RE.find_iter(text).filter(move |m| {
        !text[..m.start()]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || matches!(c, ':' | '/' | '.' | '_' | '-' | '~'))
    })
}

/// Strip host, query and fragment; lowercase; collapse path parameters to `{param}`.
pub fn normalize_endpoint(raw: &str) -> String {
    let mut path = raw.trim().trim_matches('`');
    if let Some(rest) = path
        .strip_prefix("https://")
        .or_else(|| path.strip_prefix("http://"))
    {
        path = rest.find('/').map_or("", |i| &rest[i..]);
    }
    let path = path.split(['?', '#']).next().unwrap_or_default();
    let path =
        path.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | ')' | '/'));

    path.split('/')
        .map(|segment| {
            if is_path_param(segment) {
                "{param}".to_string()
            } else {
                segment.to_lowercase()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_path_param(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    (segment.starts_with('{') && segment.ends_with('}'))
        || (segment.starts_with('<') && segment.ends_with('>'))
        || (segment.starts_with(':') && segment.len() > 1)
        || segment.chars().all(|c| c.is_ascii_digit())
        || is_uuid(segment)
}

fn is_uuid(segment: &str) -> bool {
    segment.len() == 36
        && segment.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_hexdigit(),
        })
}

fn parse_amount(raw: &str) -> Option<f64> {
    raw.replace(',', "").parse::<f64>().ok().filter(|v| v.is_finite())
}

fn price_value(caps: &regex::Captures<'_>) -> Option<f64> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| parse_amount(m.as_str()))
}

/// Amount of the first price mention in `text`.
pub(crate) fn parse_price(text: &str) -> Option<f64> {
    PRICE_RE.captures(text).and_then(|caps| price_value(&caps))
}

fn trim_fragment(fragment: &str) -> &str {
    fragment.trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!'))
}

/// Facts the current request's sources actually state.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    endpoints: HashSet<String>,
    prices: Vec<f64>,
    parameters: HashSet<String>,
    methods: HashMap<String, HashSet<String>>,
    countries: HashSet<String>,
}

impl KnowledgeBase {
    pub fn from_sources<'a>(sources: impl IntoIterator<Item = &'a Source>) -> Self {
        let mut kb = Self::default();
        for source in sources {
            kb.absorb_fields(source);
            kb.absorb_content(&source.content);
        }
        kb
    }

    fn absorb_fields(&mut self, source: &Source) {
        if let Some(endpoint) = source.endpoint.as_deref().filter(|e| !e.is_empty()) {
            let normalized = normalize_endpoint(endpoint);
            if let Some(method) = source.method.as_deref().filter(|m| !m.is_empty()) {
                self.methods
                    .entry(normalized.clone())
                    .or_default()
                    .insert(method.trim().to_uppercase());
            }
            self.endpoints.insert(normalized);
        }
        if let Some(price) = source.price.filter(|p| p.is_finite()) {
            self.prices.push(price);
        }
        for parameter in &source.parameters {
            self.parameters.insert(parameter.trim().to_lowercase());
        }
        if let Some(country) = source.country.as_deref().filter(|c| !c.trim().is_empty()) {
            self.countries.insert(canonical_country(country));
        }
    }

    fn absorb_content(&mut self, content: &str) {
        for m in endpoint_matches(content) {
            self.endpoints.insert(normalize_endpoint(m.as_str()));
        }
        for caps in METHOD_ENDPOINT_RE.captures_iter(content) {
            let endpoint = normalize_endpoint(&caps[2]);
            self.methods
                .entry(endpoint.clone())
                .or_default()
                .insert(caps[1].to_string());
            self.endpoints.insert(endpoint);
        }
        for caps in PRICE_RE.captures_iter(content) {
            if let Some(value) = price_value(&caps) {
                self.prices.push(value);
            }
        }
        for caps in PARAMETER_RE.captures_iter(content) {
            self.parameters.insert(caps[1].to_lowercase());
        }
        for m in COUNTRY_RE.find_iter(content) {
            self.countries.insert(canonical_country(m.as_str()));
        }
    }

    pub fn knows_endpoint(&self, normalized: &str) -> bool {
        self.endpoints.contains(normalized)
    }

    pub fn knows_price(&self, value: f64) -> bool {
        self.prices
            .iter()
            .any(|known| (known - value).abs() < PRICE_TOLERANCE + 1e-9)
    }

    pub fn knows_parameter(&self, name: &str) -> bool {
        self.parameters.contains(&name.to_lowercase())
    }

    /// Methods documented for an endpoint, if any source pairs them.
    pub fn documented_methods(&self, normalized: &str) -> Option<&HashSet<String>> {
        self.methods.get(normalized).filter(|m| !m.is_empty())
    }

    pub fn knows_country(&self, name: &str) -> bool {
        self.countries.contains(&canonical_country(name))
    }

    /// True once at least one source has stated a country.
    pub fn has_country_context(&self) -> bool {
        !self.countries.is_empty()
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn price_count(&self) -> usize {
        self.prices.len()
    }
}

/// Flags fabricated endpoints, prices, methods and countries in an answer.
#[derive(Debug, Clone)]
pub struct HallucinationDetector {
    kb: KnowledgeBase,
}

impl HallucinationDetector {
    pub fn new(results: &[RawResult]) -> Self {
        Self {
            kb: KnowledgeBase::from_sources(results.iter().map(|r| &r.chunk)),
        }
    }

    pub fn from_sources(sources: &[Source]) -> Self {
        Self {
            kb: KnowledgeBase::from_sources(sources),
        }
    }

    pub fn knowledge_base(&self) -> &KnowledgeBase {
        &self.kb
    }

    /// Detect unsupported claims. Text without technical patterns yields nothing.
    pub fn detect(&self, answer: &str) -> Vec<Hallucination> {
        let mut found = Vec::new();
        self.check_endpoints(answer, &mut found);
        self.check_methods(answer, &mut found);
        self.check_prices(answer, &mut found);
        self.check_countries(answer, &mut found);

        let mut seen = HashSet::new();
        found.retain(|h| seen.insert((h.kind, h.detected.to_lowercase())));

        if !found.is_empty() {
            tracing::debug!(
                count = found.len(),
                known_endpoints = self.kb.endpoint_count(),
                "Pattern detector flagged answer"
            );
        }
        found
    }

    fn check_endpoints(&self, answer: &str, found: &mut Vec<Hallucination>) {
        for m in endpoint_matches(answer) {
            let normalized = normalize_endpoint(m.as_str());
            if normalized.len() <= MIN_ENDPOINT_LEN || self.kb.knows_endpoint(&normalized) {
                continue;
            }
            found.push(flag(
                HallucinationType::FabricatedEndpoint,
                trim_fragment(m.as_str()),
                surrounding_context(answer, m.start(), m.end(), CONTEXT_RADIUS),
                SEVERITY_FABRICATED_ENDPOINT,
            ));
        }
    }

    fn check_methods(&self, answer: &str, found: &mut Vec<Hallucination>) {
        for caps in METHOD_ENDPOINT_RE.captures_iter(answer) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let normalized = normalize_endpoint(&caps[2]);
            let Some(documented) = self.kb.documented_methods(&normalized) else {
                continue;
            };
            if documented.contains(&caps[1]) {
                continue;
            }
            found.push(flag(
                HallucinationType::IncorrectMethod,
                trim_fragment(whole.as_str()),
                surrounding_context(answer, whole.start(), whole.end(), CONTEXT_RADIUS),
                SEVERITY_INCORRECT_METHOD,
            ));
        }
    }

    fn check_prices(&self, answer: &str, found: &mut Vec<Hallucination>) {
        for caps in PRICE_RE.captures_iter(answer) {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let Some(value) = price_value(&caps) else {
                continue;
            };
            if self.kb.knows_price(value) {
                continue;
            }
            found.push(flag(
                HallucinationType::FabricatedPrice,
                trim_fragment(whole.as_str()),
                surrounding_context(answer, whole.start(), whole.end(), CONTEXT_RADIUS),
                SEVERITY_FABRICATED_PRICE,
            ));
        }
    }

    fn check_countries(&self, answer: &str, found: &mut Vec<Hallucination>) {
        if !self.kb.has_country_context() {
            return;
        }
        for m in COUNTRY_RE.find_iter(answer) {
            if self.kb.knows_country(m.as_str()) {
                continue;
            }
            found.push(flag(
                HallucinationType::UnsupportedCountry,
                m.as_str(),
                surrounding_context(answer, m.start(), m.end(), CONTEXT_RADIUS),
                SEVERITY_UNSUPPORTED_COUNTRY,
            ));
        }
    }
}

fn flag(kind: HallucinationType, detected: &str, context: &str, severity: f64) -> Hallucination {
    Hallucination::new(kind, detected, context, severity)
        .with_source(DetectionSource::PatternDetector)
}
