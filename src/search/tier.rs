//! Confidence tiers for similarity matches

use serde::{Deserialize, Serialize};

/// How much a match can be trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    /// Similarity at or above the auto threshold
    AutoAccept,
    /// Between the thresholds; a person should confirm
    Review,
    /// Below the minimum threshold
    NoMatch,
}

impl MatchTier {
    /// Tier for a similarity score
    ///
    /// Both thresholds are inclusive lower bounds. Callers are expected to
    /// pass `auto_threshold > min_threshold`.
    pub fn classify(similarity: f32, auto_threshold: f32, min_threshold: f32) -> Self {
        if similarity >= auto_threshold {
            MatchTier::AutoAccept
        } else if similarity >= min_threshold {
            MatchTier::Review
        } else {
            MatchTier::NoMatch
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MatchTier::AutoAccept => "auto_accept",
            MatchTier::Review => "review",
            MatchTier::NoMatch => "no_match",
        }
    }
}

impl std::fmt::Display for MatchTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
