//! `*`-wildcard patterns used by peer rules and chaincode event filters.

use serde::{Deserialize, Serialize};

/// Glob-style pattern where `*` matches any run of characters (including none).
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pattern(String);

impl Pattern {
    /// Creates a pattern from its textual form.
    #[must_use]
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    /// Returns the textual form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true when `candidate` matches the whole pattern.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let mut segments = self.0.split('*');
        let Some(head) = segments.next() else {
            return candidate.is_empty();
        };
        let Some(mut rest) = candidate.strip_prefix(head) else {
            return false;
        };
        let tail_segments: Vec<&str> = segments.collect();
        let Some((last, middle)) = tail_segments.split_last() else {
            // No wildcard at all: exact match.
            return rest.is_empty();
        };
        for segment in middle {
            match rest.find(segment) {
                Some(index) => rest = &rest[index.saturating_add(segment.len())..],
                None => return false,
            }
        }
        rest.len() >= last.len() && rest.ends_with(last)
    }
}

impl From<&str> for Pattern {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_requires_full_match() {
        let pattern = Pattern::new("peer0.org1:7051");
        assert!(pattern.matches("peer0.org1:7051"));
        assert!(!pattern.matches("peer0.org1:70511"));
        assert!(!pattern.matches("xpeer0.org1:7051"));
    }

    #[test]
    fn wildcards_match_prefix_suffix_and_middle() {
        assert!(Pattern::new("*").matches(""));
        assert!(Pattern::new("*").matches("anything"));
        assert!(Pattern::new("peer*.org1*").matches("peer3.org1.example.com:7051"));
        assert!(Pattern::new("*.org2.*").matches("peer0.org2.example.com"));
        assert!(!Pattern::new("*.org2.*").matches("peer0.org1.example.com"));
        assert!(Pattern::new("a*b*c").matches("abc"));
        assert!(!Pattern::new("a*bc*c").matches("abc"));
    }
}
