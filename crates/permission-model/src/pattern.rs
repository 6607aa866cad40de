//! Endpoint path patterns.
//!
//! A pattern is a `/`-separated list of segments:
//!
//! | Segment | Matches |
//! |---------|---------|
//! | `users` | exactly `users` |
//! | `{id}`, `*` | any single non-empty segment |
//! | `**` | every remaining segment, including none (last position only) |
//!
//! Empty segments are ignored on both sides, so `/users/` and `/users` are the
//! same path. A query string on the request path is not part of the match.
//!
//! Paths whose meaning depends on later normalization match nothing: `.` and
//! `..` segments, backslashes, and percent-encoded `/`, `\` or `.`. Such a
//! request falls through to default-deny.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One parsed pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text, compared case-sensitively
    Literal(String),
    /// Single-segment wildcard (`{name}` or `*`)
    Param,
    /// Trailing multi-segment wildcard (`**`)
    Rest,
}

/// A compiled endpoint path pattern.
///
/// Serializes as the raw pattern string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a pattern. Every string is a valid pattern; a `**` that is not
    /// the last segment behaves like a single-segment wildcard.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let parts: Vec<&str> = split_path(raw).collect();
        let last = parts.len().saturating_sub(1);
        let segments = parts
            .iter()
            .enumerate()
            .map(|(i, part)| match *part {
                "**" if i == last => Segment::Rest,
                "*" | "**" => Segment::Param,
                p if p.starts_with('{') && p.ends_with('}') && p.len() > 2 => Segment::Param,
                p => Segment::Literal(p.to_string()),
            })
            .collect();

        Self {
            raw: raw.to_string(),
            segments,
        }
    }

    /// The pattern as written
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Parsed segments
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Check whether a request path matches this pattern
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        if is_ambiguous(path) {
            return false;
        }
        let mut parts = split_path(path);

        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return false;
                    }
                }
                Segment::Param => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
            }
        }

        parts.next().is_none()
    }

    /// Ordering key used to pick the most specific of several matching
    /// patterns: more literal segments first, then more segments, then
    /// patterns without a trailing `**`.
    #[must_use]
    pub fn specificity(&self) -> (usize, usize, bool) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        let has_rest = matches!(self.segments.last(), Some(Segment::Rest));
        (literals, self.segments.len(), !has_rest)
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Encoded separators and dots that a backend may decode after matching
const ENCODED_HAZARDS: [&str; 3] = ["%2f", "%5c", "%2e"];

/// Whether `path` could resolve to a different route than it spells
#[must_use]
pub fn is_ambiguous(path: &str) -> bool {
    if path.contains('\\') || path.split('/').any(|s| s == "." || s == "..") {
        return true;
    }
    let lower = path.to_ascii_lowercase();
    ENCODED_HAZARDS.iter().any(|h| lower.contains(h))
}

impl From<String> for PathPattern {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<PathPattern> for String {
    fn from(pattern: PathPattern) -> Self {
        pattern.raw
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({:?})", self.raw)
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
