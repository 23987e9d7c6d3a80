//! Wildcard address patterns.

use regex::Regex;
use tracing::warn;

/// Upper bound on the compiled size of a single pattern.
const PATTERN_SIZE_LIMIT: usize = 64 * 1024;

/// An address pattern where `*` matches any run of characters.
///
/// Literal segments are escaped and the whole pattern is anchored, so
/// `10.0.0.*` matches `10.0.0.5` but not `210.0.0.5`.
#[derive(Debug, Clone)]
pub struct AddressPattern {
    source: String,
    regex: Regex,
}

impl AddressPattern {
    /// Compile a pattern. Returns `None` for a pattern that cannot be
    /// compiled; callers treat that as a pattern that never matches.
    pub fn compile(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");

        match regex::RegexBuilder::new(&format!("^(?:{body})$"))
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
        {
            Ok(regex) => Some(Self {
                source: pattern.to_string(),
                regex,
            }),
            Err(e) => {
                warn!(pattern, error = %e, "Ignoring invalid address pattern");
                None
            }
        }
    }

    /// Whether `address` matches the whole pattern.
    pub fn matches(&self, address: &str) -> bool {
        self.regex.is_match(address)
    }

    /// The pattern as written in configuration.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}
