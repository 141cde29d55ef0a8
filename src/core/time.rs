//! State timestamps.
//!
//! A state timestamp totally orders the writes on a single branch. Comparing
//! timestamps across branches is meaningless without first projecting both
//! onto a common branch.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position along a branch.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTimestamp(u64);

impl StateTimestamp {
    pub const ZERO: StateTimestamp = StateTimestamp(0);

    /// Past every real write on a branch. Used when projecting "the furthest
    /// point on this branch" through the branch history.
    pub const MAX: StateTimestamp = StateTimestamp(u64::MAX);

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(
            self.0
                .checked_add(1)
                .expect("state timestamp overflow computing next"),
        )
    }
}

impl fmt::Debug for StateTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateTimestamp({})", self.0)
    }
}

impl fmt::Display for StateTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<StateTimestamp> for u64 {
    fn from(value: StateTimestamp) -> u64 {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_order_by_value() {
        let a = StateTimestamp::new(3);
        let b = StateTimestamp::new(5);
        assert!(a < b);
        assert_eq!(a.next(), StateTimestamp::new(4));
        assert!(StateTimestamp::MAX > b);
    }
}
