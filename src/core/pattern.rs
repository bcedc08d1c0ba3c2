//! Byte patterns searched for in console captures
//!
//! Consoles carry arbitrary bytes, so regular expressions use
//! `regex::bytes` and literals are compared as raw bytes; either can
//! match invalid UTF-8.

use super::error::ExpectError;
use regex::bytes::{Captures, Regex, RegexBuilder};
use std::collections::BTreeMap;
use std::fmt;

/// How a pattern is matched
#[derive(Debug, Clone)]
enum Matcher {
    Literal(Vec<u8>),
    Regex { regex: Regex, source: String },
}

/// Literal bytes or a compiled regular expression
#[derive(Debug, Clone)]
pub struct Pattern {
    matcher: Matcher,
}

/// A pattern hit inside a searched window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    /// Start, relative to the window
    pub start: usize,
    /// End (exclusive), relative to the window
    pub end: usize,
    /// Named capture groups that participated in the match
    pub groups: BTreeMap<String, Vec<u8>>,
}

impl Pattern {
    /// Match the exact bytes given
    pub fn literal(text: impl AsRef<[u8]>) -> Self {
        Self {
            matcher: Matcher::Literal(text.as_ref().to_vec()),
        }
    }

    /// Compile a regular expression; `^`/`$` match at line boundaries
    pub fn regex(pattern: &str) -> Result<Self, ExpectError> {
        let regex = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|source| ExpectError::InvalidPattern {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(Self {
            matcher: Matcher::Regex {
                regex,
                source: pattern.to_string(),
            },
        })
    }

    /// Whether this is a literal
    pub fn is_literal(&self) -> bool {
        matches!(self.matcher, Matcher::Literal(_))
    }

    /// Literal bytes, if this is a literal
    pub fn literal_bytes(&self) -> Option<&[u8]> {
        match &self.matcher {
            Matcher::Literal(bytes) => Some(bytes),
            Matcher::Regex { .. } => None,
        }
    }

    /// Find the first hit in `haystack`
    pub fn find(&self, haystack: &[u8]) -> Option<PatternHit> {
        match &self.matcher {
            Matcher::Literal(bytes) => {
                let start = if bytes.is_empty() {
                    0
                } else {
                    haystack.windows(bytes.len()).position(|w| w == bytes.as_slice())?
                };
                Some(PatternHit {
                    start,
                    end: start + bytes.len(),
                    groups: BTreeMap::new(),
                })
            }
            Matcher::Regex { regex, .. } => {
                let captures = regex.captures(haystack)?;
                let whole = captures.get(0)?;
                Some(PatternHit {
                    start: whole.start(),
                    end: whole.end(),
                    groups: named_groups(regex, &captures),
                })
            }
        }
    }

    /// Name made out of the pattern, safe for reports and file names
    pub fn safe_name(&self) -> String {
        self.to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect()
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            Matcher::Literal(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => write!(f, "{text}"),
                Err(_) => write!(f, "hex:{}", hex::encode(bytes)),
            },
            Matcher::Regex { source, .. } => write!(f, "{source}"),
        }
    }
}

fn named_groups(regex: &Regex, captures: &Captures<'_>) -> BTreeMap<String, Vec<u8>> {
    regex
        .capture_names()
        .flatten()
        .filter_map(|name| {
            captures
                .name(name)
                .map(|m| (name.to_string(), m.as_bytes().to_vec()))
        })
        .collect()
}

impl From<&str> for Pattern {
    fn from(text: &str) -> Self {
        Self::literal(text)
    }
}
