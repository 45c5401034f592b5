//! Sentiment events delivered by the scoring collaborator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TradeError;

/// Sentiment score on the 0..=10 scale, 5 being neutral.
///
/// Construction validates the range, so a `Score` that exists is always
/// usable by the risk calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Score(u8);

impl Score {
    pub fn new(value: i64) -> Result<Self, TradeError> {
        if (0..=10).contains(&value) {
            Ok(Score(value as u8))
        } else {
            Err(TradeError::InvalidScore(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Distance from neutral, 0..=5.
    pub fn intensity(self) -> u8 {
        self.0.abs_diff(5)
    }
}

impl TryFrom<i64> for Score {
    type Error = TradeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Score::new(value)
    }
}

impl From<Score> for i64 {
    fn from(score: Score) -> Self {
        score.0 as i64
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scored post. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentimentEvent {
    /// External post identifier, used for replay protection
    pub source_post_id: String,

    pub score: Score,

    #[serde(default = "Utc::now")]
    pub observed_at: DateTime<Utc>,
}

impl SentimentEvent {
    #[cfg(test)]
    pub fn new(source_post_id: impl Into<String>, score: Score) -> Self {
        Self {
            source_post_id: source_post_id.into(),
            score,
            observed_at: Utc::now(),
        }
    }
}
