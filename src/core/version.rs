//! Versions: a point on a branch.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::identity::BranchId;
use super::time::StateTimestamp;

/// A (branch, timestamp) pair naming how far along a branch some data has
/// reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Self { branch, timestamp }
    }

    /// The pristine state, before any write on any branch.
    pub fn zero() -> Self {
        Self {
            branch: BranchId::nil(),
            timestamp: StateTimestamp::ZERO,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn zero_version_lives_on_the_nil_branch() {
        let zero = Version::zero();
        assert!(zero.is_zero());
        assert!(zero.branch.is_nil());
        assert!(!Version::new(BranchId::new(Uuid::from_u128(1)), StateTimestamp::ZERO).is_zero());
    }
}
