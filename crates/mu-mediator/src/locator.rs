//! Resolve the real resource locator of a content item.
//!
//! Lazy-loading pages park the true source in one of many attributes and
//! keep a placeholder in `src`.  Attributes are consulted in priority order;
//! the first usable value wins.

use std::collections::BTreeMap;

use url::Url;

/// Attribute names in the order they are consulted.
pub const DEFAULT_PRIORITY: &[&str] = &[
    "data-src",
    "data-original",
    "data-lazy-src",
    "data-url",
    "data-srcset",
    "srcset",
    "current-src",
    "src",
];

#[derive(Debug, Clone)]
pub struct LocatorResolver {
    priority: Vec<String>,
    base: Option<Url>,
}

impl Default for LocatorResolver {
    fn default() -> Self {
        Self::new(DEFAULT_PRIORITY.iter().map(|s| s.to_string()).collect())
    }
}

impl LocatorResolver {
    pub fn new(priority: Vec<String>) -> Self {
        Self {
            priority,
            base: None,
        }
    }

    /// Relative values are joined against `base` (the document URL).
    pub fn with_base(mut self, base: &str) -> Self {
        self.base = Url::parse(base).ok();
        self
    }

    pub fn set_base(&mut self, base: &str) {
        self.base = Url::parse(base).ok();
    }

    pub fn resolve(&self, attrs: &BTreeMap<String, String>) -> Option<String> {
        let mut inline_fallback = None;
        for name in &self.priority {
            let Some(raw) = attrs.get(name) else {
                continue;
            };
            let value = if name.ends_with("srcset") {
                match largest_srcset_candidate(raw) {
                    Some(v) => v,
                    None => continue,
                }
            } else {
                raw.trim().to_string()
            };
            if value.is_empty() || is_placeholder(&value) {
                continue;
            }
            if value.starts_with("data:") {
                // Inline payloads are only used when nothing better exists.
                inline_fallback.get_or_insert(value);
                continue;
            }
            if let Some(resolved) = self.absolutize(&value) {
                return Some(resolved);
            }
        }
        inline_fallback
    }

    fn absolutize(&self, value: &str) -> Option<String> {
        if let Ok(url) = Url::parse(value) {
            return match url.scheme() {
                "http" | "https" | "blob" | "file" => Some(url.to_string()),
                _ => None,
            };
        }
        let base = self.base.as_ref()?;
        base.join(value).ok().map(|u| u.to_string())
    }
}

fn is_placeholder(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower == "about:blank"
        || lower == "#"
        || lower.starts_with("data:image/gif;base64,r0lgod")
        || lower.starts_with("data:image/svg+xml")
}

/// Pick the candidate with the largest width (`480w`) or density (`2x`)
/// descriptor.  Candidates without a descriptor count as `1x`.
fn largest_srcset_candidate(srcset: &str) -> Option<String> {
    srcset
        .split(',')
        .filter_map(|candidate| {
            let mut parts = candidate.split_whitespace();
            let url = parts.next()?;
            let weight = match parts.next() {
                Some(d) if d.ends_with('w') => d.trim_end_matches('w').parse::<f64>().ok()?,
                Some(d) if d.ends_with('x') => d.trim_end_matches('x').parse::<f64>().ok()? * 1000.0,
                Some(_) => return None,
                None => 1000.0,
            };
            Some((url.to_string(), weight))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(url, _)| url)
}

/// Host part of a locator, if it has one.
pub fn locator_host(locator: &str) -> Option<String> {
    Url::parse(locator)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}
