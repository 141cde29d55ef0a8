//! Regions of the key space.
//!
//! A region is a half-open hash-bucket interval crossed with a half-open key
//! range. Hash buckets live in a fixed universe of `HASH_SPACE_SIZE` values;
//! the universe is further carved into `CPU_SHARDING_FACTOR` equal slabs so
//! that downstream execution can be partitioned per cpu shard.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of the hash-bucket universe. Hash intervals are half-open over
/// `[0, HASH_SPACE_SIZE)`.
pub const HASH_SPACE_SIZE: u64 = 1 << 63;

/// Number of equal hash slabs downstream execution is partitioned into.
pub const CPU_SHARDING_FACTOR: usize = 8;

const CPU_SLAB_WIDTH: u64 = HASH_SPACE_SIZE / CPU_SHARDING_FACTOR as u64;

/// A key in the store.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The smallest key.
    pub fn min() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreKey({:?})", self.0)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open key interval `[left, right)`. A `right` of `None` means the
/// interval extends to the end of the key space.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub left: StoreKey,
    pub right: Option<StoreKey>,
}

impl KeyRange {
    pub fn new(left: StoreKey, right: Option<StoreKey>) -> Self {
        Self { left, right }
    }

    pub fn universe() -> Self {
        Self {
            left: StoreKey::min(),
            right: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.right {
            Some(right) => right <= &self.left,
            None => false,
        }
    }

    /// Largest range contained in both; may be empty.
    pub fn intersect(&self, other: &KeyRange) -> KeyRange {
        let left = std::cmp::max(&self.left, &other.left).clone();
        let right = match (&self.right, &other.right) {
            (None, None) => None,
            (Some(r), None) | (None, Some(r)) => Some(r.clone()),
            (Some(a), Some(b)) => Some(a.min(b).clone()),
        };
        KeyRange { left, right }
    }

    pub fn contains_key(&self, key: &StoreKey) -> bool {
        *key >= self.left
            && match &self.right {
                Some(right) => key < right,
                None => true,
            }
    }

    pub fn contains_range(&self, other: &KeyRange) -> bool {
        other.left >= self.left
            && match (&self.right, &other.right) {
                (None, _) => true,
                (Some(_), None) => false,
                (Some(ours), Some(theirs)) => theirs <= ours,
            }
    }
}

impl PartialOrd for KeyRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyRange {
    fn cmp(&self, other: &Self) -> Ordering {
        // An unbounded right end sorts after every bounded one.
        self.left.cmp(&other.left).then_with(|| {
            match (&self.right, &other.right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            }
        })
    }
}

/// Half-open hash interval crossed with a key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub hash_beg: u64,
    pub hash_end: u64,
    pub keys: KeyRange,
}

impl Region {
    pub fn new(hash_beg: u64, hash_end: u64, keys: KeyRange) -> Self {
        Self {
            hash_beg,
            hash_end,
            keys,
        }
    }

    /// The whole key space.
    pub fn universe() -> Self {
        Self::new(0, HASH_SPACE_SIZE, KeyRange::universe())
    }

    /// A key range crossed with the full hash universe.
    pub fn with_keys(keys: KeyRange) -> Self {
        Self::new(0, HASH_SPACE_SIZE, keys)
    }

    pub fn is_empty(&self) -> bool {
        self.hash_beg >= self.hash_end || self.keys.is_empty()
    }

    /// Largest region contained in both. Empty intersections are not
    /// errors; callers skip them.
    pub fn intersect(a: &Region, b: &Region) -> Region {
        Region {
            hash_beg: a.hash_beg.max(b.hash_beg),
            hash_end: a.hash_end.min(b.hash_end),
            keys: a.keys.intersect(&b.keys),
        }
    }

    pub fn contains(&self, other: &Region) -> bool {
        other.hash_beg >= self.hash_beg
            && other.hash_end <= self.hash_end
            && self.keys.contains_range(&other.keys)
    }
}

impl PartialOrd for Region {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Region {
    fn cmp(&self, other: &Self) -> Ordering {
        self.keys
            .cmp(&other.keys)
            .then_with(|| self.hash_beg.cmp(&other.hash_beg))
            .then_with(|| self.hash_end.cmp(&other.hash_end))
    }
}

/// The hash slab owned by the given cpu shard, over the full key space.
pub fn cpu_sharding_subspace(index: usize) -> Region {
    assert!(
        index < CPU_SHARDING_FACTOR,
        "cpu shard index {index} out of range"
    );
    Region::new(
        index as u64 * CPU_SLAB_WIDTH,
        (index as u64 + 1) * CPU_SLAB_WIDTH,
        KeyRange::universe(),
    )
}

/// The cpu shard a region starts in. Only meaningful for regions that do not
/// span slabs; used for log prefixes.
pub fn cpu_shard_of(region: &Region) -> usize {
    (region.hash_beg / CPU_SLAB_WIDTH) as usize
}
