//! Invalidation path parsing and normalization

use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

/// Slash-delimited address in the invalidation tree.
///
/// Segments are maximal runs of characters that are neither `/` nor
/// whitespace, normalized to NFC. The empty path addresses the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct EventPath {
    segments: Vec<String>,
}

impl EventPath {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parse(path: &str) -> Self {
        let segments = path
            .split(|c: char| c == '/' || c.is_whitespace())
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.nfc().collect::<String>())
            .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Append a segment, normalizing it the same way `parse` does.
    pub fn join(mut self, segment: &str) -> Self {
        self.segments.extend(EventPath::parse(segment).segments);
        self
    }

    pub fn starts_with(&self, prefix: &EventPath) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for EventPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl From<&str> for EventPath {
    fn from(path: &str) -> Self {
        EventPath::parse(path)
    }
}

impl From<String> for EventPath {
    fn from(path: String) -> Self {
        EventPath::parse(&path)
    }
}

impl From<EventPath> for String {
    fn from(path: EventPath) -> Self {
        path.to_string()
    }
}
