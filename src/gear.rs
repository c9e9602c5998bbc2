//! Gear ladder: the ordered concurrency levels the governor moves between.
//!
//! Index 0 is the most aggressive gear (highest concurrency). Moving to a
//! higher index is a *downshift* (more conservative), moving to a lower
//! index is an *upshift*.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::LadderError;

/// Strictly descending, non-empty list of concurrency caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u32>", into = "Vec<u32>")]
pub struct GearLadder {
    levels: Vec<u32>,
}

impl GearLadder {
    /// Build a ladder, rejecting empty, zero-valued or non-descending input.
    pub fn new(levels: Vec<u32>) -> Result<Self, LadderError> {
        if levels.is_empty() {
            return Err(LadderError::Empty);
        }
        if let Some(pos) = levels.iter().position(|&l| l == 0) {
            return Err(LadderError::ZeroLevel { index: pos });
        }
        for (i, pair) in levels.windows(2).enumerate() {
            if pair[1] >= pair[0] {
                return Err(LadderError::NotDescending {
                    index: i + 1,
                    previous: pair[0],
                    value: pair[1],
                });
            }
        }
        Ok(Self { levels })
    }

    /// Parse a comma-separated ladder such as `"32,16,8"`.
    pub fn parse(s: &str) -> Result<Self, LadderError> {
        let levels = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>().map_err(|_| LadderError::InvalidLevel {
                    value: part.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(levels)
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn len(&self) -> usize {
        self.levels.len()
    }

    /// A constructed ladder is never empty.
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    /// Concurrency at `index`. Panics on an out-of-range index, which the
    /// governor never produces because it only moves via `downshift`/`upshift`.
    pub fn concurrency(&self, index: usize) -> u32 {
        self.levels[index]
    }

    pub fn last_index(&self) -> usize {
        self.levels.len() - 1
    }

    /// Next more conservative gear, or `None` at the bottom of the ladder.
    pub fn downshift(&self, index: usize) -> Option<usize> {
        if index < self.last_index() {
            Some(index + 1)
        } else {
            None
        }
    }

    /// Next more aggressive gear, or `None` at gear 0.
    pub fn upshift(&self, index: usize) -> Option<usize> {
        index.checked_sub(1)
    }
}

impl TryFrom<Vec<u32>> for GearLadder {
    type Error = LadderError;

    fn try_from(levels: Vec<u32>) -> Result<Self, Self::Error> {
        Self::new(levels)
    }
}

impl From<GearLadder> for Vec<u32> {
    fn from(ladder: GearLadder) -> Self {
        ladder.levels
    }
}

impl fmt::Display for GearLadder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.levels.iter().map(|l| l.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
