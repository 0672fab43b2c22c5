//! Deterministic auto-tagging. Runs inside the insert transaction for every
//! new log row: the union of the originating service, the lowercased level,
//! and any keyword-matched tags from the fixed table below. Manual tag
//! endpoints mutate the stored set without re-running these rules.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

/// Keyword table. Matches are case-insensitive substrings, except `db`
/// which is word-bounded so it does not fire inside unrelated words.
static KEYWORD_TAGS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        ("traefik", Regex::new(r"(?i)traefik|gateway|routing|proxy").unwrap()),
        ("docker", Regex::new(r"(?i)docker|container|image|build").unwrap()),
        ("frontend", Regex::new(r"(?i)react|vite|npm|javascript|jsx").unwrap()),
        ("backend", Regex::new(r"(?i)gin|golang|api|handler").unwrap()),
        ("database", Regex::new(r"(?i)postgres|sql|migration|query|\bdb\b").unwrap()),
        ("auth", Regex::new(r"(?i)oauth|jwt|token|login|authentication").unwrap()),
        ("ai", Regex::new(r"(?i)ollama|anthropic|openai|claude|model").unwrap()),
    ]
});

/// Computes the tag set for a log entry. Output is sorted and deduplicated,
/// so the same input always produces the identical set.
pub fn auto_tags(service: &str, level: &str, message: &str) -> Vec<String> {
    let mut tags = BTreeSet::new();
    if !service.is_empty() {
        tags.insert(service.to_lowercase());
    }
    tags.insert(level.to_lowercase());
    for (tag, pattern) in KEYWORD_TAGS.iter() {
        if pattern.is_match(message) {
            tags.insert((*tag).to_string());
        }
    }
    tags.into_iter().collect()
}
