//! Region maps.
//!
//! A `RegionMap<V>` associates every point of a region with a value, stored
//! as a union of maximal sub-regions with equal value: key-range columns in
//! ascending key order, each column a stack of contiguous hash runs in
//! ascending hash order. Adjacent runs with equal values are coalesced on
//! every mutation, so the runs a traversal sees are always maximal.
//!
//! Traversal order is contractual, not incidental: `visit` and `map_multi`
//! yield sub-regions first in key-range order, then in hash order within
//! each key range. Callers (the contract driver's log prefixes) rely on it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::region::{KeyRange, Region, StoreKey};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMap<V> {
    hash_beg: u64,
    hash_end: u64,
    columns: Vec<Column<V>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Column<V> {
    keys: KeyRange,
    runs: Vec<HashRun<V>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct HashRun<V> {
    beg: u64,
    end: u64,
    value: V,
}

/// A fragment list that cannot be assembled into a region map. Reaching one
/// of these from `from_fragments` is a programming error and aborts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FragmentError {
    #[error("no fragments supplied")]
    Empty,
    #[error("fragment covers an empty region")]
    EmptyFragment,
    #[error("fragments overlap in the hash interval at {hash}")]
    Overlap { hash: u64 },
    #[error("fragments leave a hash gap at {hash}")]
    Gap { hash: u64 },
    #[error("no fragment covers keys from {left}")]
    UncoveredKeys { left: StoreKey },
}

impl<V> RegionMap<V> {
    /// Map the whole of `region` to a single value.
    pub fn new(region: Region, value: V) -> Self {
        assert!(!region.is_empty(), "region map over an empty region");
        Self {
            hash_beg: region.hash_beg,
            hash_end: region.hash_end,
            columns: vec![Column {
                keys: region.keys,
                runs: vec![HashRun {
                    beg: region.hash_beg,
                    end: region.hash_end,
                    value,
                }],
            }],
        }
    }

    /// The region this map covers.
    pub fn region(&self) -> Region {
        let first = self.columns.first().expect("region map has no columns");
        let last = self.columns.last().expect("region map has no columns");
        Region::new(
            self.hash_beg,
            self.hash_end,
            KeyRange::new(first.keys.left.clone(), last.keys.right.clone()),
        )
    }

    /// Iterate over all (sub-region, value) runs in key-then-hash order.
    pub fn iter(&self) -> impl Iterator<Item = (Region, &V)> + '_ {
        self.columns.iter().flat_map(|col| {
            col.runs
                .iter()
                .map(|run| (Region::new(run.beg, run.end, col.keys.clone()), &run.value))
        })
    }

    /// Invoke `f(sub_region, value)` for each maximal constant sub-region of
    /// the map intersected with `region`, in key-then-hash order.
    pub fn visit(&self, region: &Region, mut f: impl FnMut(Region, &V)) {
        for col in &self.columns {
            let keys = col.keys.intersect(&region.keys);
            if keys.is_empty() {
                continue;
            }
            for run in &col.runs {
                let beg = run.beg.max(region.hash_beg);
                let end = run.end.min(region.hash_end);
                if beg >= end {
                    continue;
                }
                f(Region::new(beg, end, keys.clone()), &run.value);
            }
        }
    }

    /// Value at a single point, if the point is inside the map.
    pub fn lookup(&self, hash: u64, key: &StoreKey) -> Option<&V> {
        if hash < self.hash_beg || hash >= self.hash_end {
            return None;
        }
        let col = self.columns.iter().find(|col| col.keys.contains_key(key))?;
        col.runs
            .iter()
            .find(|run| run.beg <= hash && hash < run.end)
            .map(|run| &run.value)
    }

    pub fn into_fragments(self) -> Vec<(Region, V)> {
        self.columns
            .into_iter()
            .flat_map(|col| {
                let keys = col.keys;
                col.runs.into_iter().map(move |run| {
                    (Region::new(run.beg, run.end, keys.clone()), run.value)
                })
            })
            .collect()
    }
}

impl<V: Clone + PartialEq> RegionMap<V> {
    /// Reassemble a map from an unordered list of disjoint fragments.
    /// Fragment lists that do not tile their bounding region are a
    /// programming error.
    pub fn from_fragments(fragments: Vec<(Region, V)>) -> Self {
        match Self::try_from_fragments(fragments) {
            Ok(map) => map,
            Err(err) => panic!("fragment list does not tile a region: {err}"),
        }
    }

    /// Fallible form of `from_fragments`, for validating externally supplied
    /// state.
    pub fn try_from_fragments(fragments: Vec<(Region, V)>) -> Result<Self, FragmentError> {
        if fragments.is_empty() {
            return Err(FragmentError::Empty);
        }

        let mut hash_beg = u64::MAX;
        let mut hash_end = 0;
        let mut key_right: Option<StoreKey> = None;
        let mut unbounded_right = false;
        for (region, _) in &fragments {
            if region.is_empty() {
                return Err(FragmentError::EmptyFragment);
            }
            hash_beg = hash_beg.min(region.hash_beg);
            hash_end = hash_end.max(region.hash_end);
            match &region.keys.right {
                Some(right) => {
                    key_right = Some(match key_right {
                        Some(current) => current.max(right.clone()),
                        None => right.clone(),
                    });
                }
                None => unbounded_right = true,
            }
        }
        let key_right = if unbounded_right { None } else { key_right };

        // Atomic key columns: every fragment edge becomes a boundary, so a
        // fragment either covers a column's key span entirely or misses it.
        let mut bounds: std::collections::BTreeSet<StoreKey> = std::collections::BTreeSet::new();
        for (region, _) in &fragments {
            bounds.insert(region.keys.left.clone());
            if let Some(right) = &region.keys.right {
                bounds.insert(right.clone());
            }
        }
        let bounds: Vec<StoreKey> = bounds.into_iter().collect();

        let mut columns = Vec::new();
        for (i, left) in bounds.iter().enumerate() {
            let right = match bounds.get(i + 1) {
                Some(next) => Some(next.clone()),
                None => key_right.clone(),
            };
            let keys = KeyRange::new(left.clone(), right);
            if keys.is_empty() {
                continue;
            }

            let mut runs: Vec<HashRun<V>> = Vec::new();
            for (region, value) in &fragments {
                if region.keys.intersect(&keys).is_empty() {
                    continue;
                }
                debug_assert!(region.keys.contains_range(&keys));
                runs.push(HashRun {
                    beg: region.hash_beg,
                    end: region.hash_end,
                    value: value.clone(),
                });
            }
            if runs.is_empty() {
                return Err(FragmentError::UncoveredKeys { left: left.clone() });
            }
            runs.sort_by_key(|run| run.beg);
            if runs[0].beg != hash_beg {
                return Err(FragmentError::Gap { hash: hash_beg });
            }
            for pair in runs.windows(2) {
                if pair[0].end > pair[1].beg {
                    return Err(FragmentError::Overlap { hash: pair[1].beg });
                }
                if pair[0].end < pair[1].beg {
                    return Err(FragmentError::Gap { hash: pair[0].end });
                }
            }
            let last_end = runs.last().map(|run| run.end).unwrap_or(hash_beg);
            if last_end != hash_end {
                return Err(FragmentError::Gap { hash: last_end });
            }
            columns.push(Column { keys, runs });
        }

        let mut map = Self {
            hash_beg,
            hash_end,
            columns,
        };
        map.coalesce();
        Ok(map)
    }

    /// Like `visit`, but `f` may replace values. Runs are split at the query
    /// boundary so that a partial overlap never mutates points outside
    /// `region`, and re-coalesced on return.
    pub fn visit_mut(&mut self, region: &Region, mut f: impl FnMut(&Region, &mut V)) {
        let query = Region::intersect(&self.region(), region);
        if query.is_empty() {
            return;
        }
        self.split_columns_at(&query.keys.left);
        if let Some(right) = query.keys.right.clone() {
            self.split_columns_at(&right);
        }
        self.split_runs_at(query.hash_beg);
        self.split_runs_at(query.hash_end);

        for col in &mut self.columns {
            if !query.keys.contains_range(&col.keys) {
                continue;
            }
            for run in &mut col.runs {
                if run.beg >= query.hash_beg && run.end <= query.hash_end {
                    let sub = Region::new(run.beg, run.end, col.keys.clone());
                    f(&sub, &mut run.value);
                }
            }
        }
        self.coalesce();
    }

    /// Produce a new map of the same shape over the intersection with
    /// `region`.
    pub fn map<W: Clone + PartialEq>(
        &self,
        region: &Region,
        mut f: impl FnMut(&Region, &V) -> W,
    ) -> RegionMap<W> {
        let query = Region::intersect(&self.region(), region);
        assert!(!query.is_empty(), "mapping a region map over an empty region");
        let mut columns = Vec::new();
        for col in &self.columns {
            let keys = col.keys.intersect(&query.keys);
            if keys.is_empty() {
                continue;
            }
            let mut runs = Vec::new();
            for run in &col.runs {
                let beg = run.beg.max(query.hash_beg);
                let end = run.end.min(query.hash_end);
                if beg >= end {
                    continue;
                }
                let sub = Region::new(beg, end, keys.clone());
                runs.push(HashRun {
                    beg,
                    end,
                    value: f(&sub, &run.value),
                });
            }
            columns.push(Column { keys, runs });
        }
        let mut out = RegionMap {
            hash_beg: query.hash_beg,
            hash_end: query.hash_end,
            columns,
        };
        out.coalesce();
        out
    }

    /// Re-key several regions at once: `f` returns a whole region map for
    /// each input run, and the results are reassembled into one map.
    pub fn map_multi<W: Clone + PartialEq>(
        &self,
        region: &Region,
        mut f: impl FnMut(&Region, &V) -> RegionMap<W>,
    ) -> RegionMap<W> {
        let mut fragments = Vec::new();
        self.visit(region, |sub, value| {
            let piece = f(&sub, value);
            assert!(
                piece.region() == sub,
                "map_multi callback returned a map over {:?} instead of {:?}",
                piece.region(),
                sub
            );
            fragments.extend(piece.into_fragments());
        });
        RegionMap::from_fragments(fragments)
    }

    /// Split any column that strictly contains `key` into two.
    fn split_columns_at(&mut self, key: &StoreKey) {
        for i in 0..self.columns.len() {
            let col = &self.columns[i];
            let inside_left = col.keys.left < *key;
            let inside_right = match &col.keys.right {
                Some(right) => key < right,
                None => true,
            };
            if inside_left && inside_right {
                let mut upper = col.clone();
                upper.keys.left = key.clone();
                self.columns[i].keys.right = Some(key.clone());
                self.columns.insert(i + 1, upper);
                return;
            }
        }
    }

    /// Split any run that strictly contains `hash` into two, in every
    /// column. Splits in untouched columns are undone by coalescing.
    fn split_runs_at(&mut self, hash: u64) {
        if hash <= self.hash_beg || hash >= self.hash_end {
            return;
        }
        for col in &mut self.columns {
            for i in 0..col.runs.len() {
                if col.runs[i].beg < hash && hash < col.runs[i].end {
                    let mut upper = col.runs[i].clone();
                    upper.beg = hash;
                    col.runs[i].end = hash;
                    col.runs.insert(i + 1, upper);
                    break;
                }
            }
        }
    }

    /// Merge adjacent equal-valued hash runs, then adjacent columns whose
    /// run stacks compare equal.
    fn coalesce(&mut self) {
        for col in &mut self.columns {
            col.runs.dedup_by(|later, earlier| {
                if earlier.end == later.beg && earlier.value == later.value {
                    earlier.end = later.end;
                    true
                } else {
                    false
                }
            });
        }
        self.columns.dedup_by(|later, earlier| {
            if earlier.runs == later.runs {
                earlier.keys.right = later.keys.right.clone();
                true
            } else {
                false
            }
        });
    }
}
