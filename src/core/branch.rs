//! Branch history: the tree of write lineages.
//!
//! Every branch except the nil root has a birth certificate recording where
//! it diverged: a region map of the versions its data had on the parent
//! branches at creation time, plus the timestamp the new branch starts at.
//!
//! Projection onto a canonical branch is the safety hinge of the ack
//! fragmenter: a replica whose last write sits on a sibling branch must not
//! appear up to date on the canonical one.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::identity::BranchId;
use super::region::Region;
use super::region_map::RegionMap;
use super::time::StateTimestamp;
use super::version::Version;

/// Where and when a branch diverged from its parents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchBirthCertificate {
    /// The region the branch covers.
    pub region: Region,
    /// The version each point had on the parent branch at creation time.
    pub origin: RegionMap<Version>,
    /// The timestamp the branch starts at. Writes on the branch carry
    /// timestamps at or after this.
    pub initial_timestamp: StateTimestamp,
}

/// All known birth certificates, keyed by branch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHistory {
    branches: BTreeMap<BranchId, BranchBirthCertificate>,
}

impl BranchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, branch: BranchId, certificate: BranchBirthCertificate) {
        assert!(!branch.is_nil(), "the nil branch has no birth certificate");
        self.branches.insert(branch, certificate);
    }

    pub fn get(&self, branch: &BranchId) -> Option<&BranchBirthCertificate> {
        self.branches.get(branch)
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }
}

/// In-memory lookup of birth certificates. The coordinator never fetches
/// history lazily; everything it needs is already resident (an unknown
/// branch is a bug in whoever assembled the inputs).
pub trait BranchHistoryReader {
    fn branch_birth_certificate(&self, branch: &BranchId) -> &BranchBirthCertificate;

    fn is_branch_known(&self, branch: &BranchId) -> bool;
}

impl BranchHistoryReader for BranchHistory {
    fn branch_birth_certificate(&self, branch: &BranchId) -> &BranchBirthCertificate {
        self.branches
            .get(branch)
            .unwrap_or_else(|| panic!("branch {branch} is missing from the branch history"))
    }

    fn is_branch_known(&self, branch: &BranchId) -> bool {
        self.branches.contains_key(branch)
    }
}

/// Read-only composition of the authoritative history with an ack-private
/// snippet. Neither side is mutated; lookups prefer the authoritative copy.
pub struct CombinedBranchHistoryReader<'a> {
    authoritative: &'a BranchHistory,
    snippet: &'a BranchHistory,
}

impl<'a> CombinedBranchHistoryReader<'a> {
    pub fn new(authoritative: &'a BranchHistory, snippet: &'a BranchHistory) -> Self {
        Self {
            authoritative,
            snippet,
        }
    }
}

impl BranchHistoryReader for CombinedBranchHistoryReader<'_> {
    fn branch_birth_certificate(&self, branch: &BranchId) -> &BranchBirthCertificate {
        self.authoritative
            .get(branch)
            .or_else(|| self.snippet.get(branch))
            .unwrap_or_else(|| panic!("branch {branch} is missing from the branch history"))
    }

    fn is_branch_known(&self, branch: &BranchId) -> bool {
        self.authoritative.is_branch_known(branch) || self.snippet.is_branch_known(branch)
    }
}

/// For each point in `region`, the latest version on `branch` that `version`
/// has reached: the common ancestor of `version` and the furthest point on
/// `branch`.
pub fn version_project_onto_branch<R: BranchHistoryReader + ?Sized>(
    reader: &R,
    version: Version,
    branch: BranchId,
    region: &Region,
) -> RegionMap<Version> {
    if version.branch == branch {
        return RegionMap::new(region.clone(), version);
    }
    version_find_common(
        reader,
        version,
        Version::new(branch, StateTimestamp::MAX),
        region,
    )
}

/// Common ancestor of two versions over a region, walking birth
/// certificates. The walk descends whichever side's branch was born later;
/// once both sides land on the same branch the answer is the earlier of the
/// two timestamps.
pub fn version_find_common<R: BranchHistoryReader + ?Sized>(
    reader: &R,
    v1: Version,
    v2: Version,
    region: &Region,
) -> RegionMap<Version> {
    if v1.branch == v2.branch {
        let common = Version::new(v1.branch, v1.timestamp.min(v2.timestamp));
        return RegionMap::new(region.clone(), common);
    }
    let (walk, keep) = if descend_first(reader, v1, v2) {
        (v1, v2)
    } else {
        (v2, v1)
    };
    let certificate = reader.branch_birth_certificate(&walk.branch);
    certificate
        .origin
        .map_multi(region, |sub, origin| {
            version_find_common(reader, *origin, keep, sub)
        })
}

/// True if the walk should descend `v1` rather than `v2`. The nil branch is
/// never descended. On equal birth timestamps, descend the side the other's
/// origin names, so a child is never mistaken for its parent's ancestor.
fn descend_first<R: BranchHistoryReader + ?Sized>(reader: &R, v1: Version, v2: Version) -> bool {
    if v1.branch.is_nil() {
        return false;
    }
    if v2.branch.is_nil() {
        return true;
    }
    let c1 = reader.branch_birth_certificate(&v1.branch);
    let c2 = reader.branch_birth_certificate(&v2.branch);
    if c1.initial_timestamp != c2.initial_timestamp {
        return c1.initial_timestamp > c2.initial_timestamp;
    }
    !c2.origin.iter().any(|(_, origin)| origin.branch == v1.branch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::region::{HASH_SPACE_SIZE, KeyRange, StoreKey};
    use uuid::Uuid;

    fn branch(seed: u128) -> BranchId {
        BranchId::new(Uuid::from_u128(seed))
    }

    fn ts(value: u64) -> StateTimestamp {
        StateTimestamp::new(value)
    }

    /// nil ── X(born 0) ─┬─ Y(born 10)
    ///                   └─ Z(born 5)
    fn sibling_history() -> (BranchHistory, BranchId, BranchId, BranchId) {
        let (x, y, z) = (branch(1), branch(2), branch(3));
        let mut history = BranchHistory::new();
        history.insert(
            x,
            BranchBirthCertificate {
                region: Region::universe(),
                origin: RegionMap::new(Region::universe(), Version::zero()),
                initial_timestamp: ts(0),
            },
        );
        history.insert(
            y,
            BranchBirthCertificate {
                region: Region::universe(),
                origin: RegionMap::new(Region::universe(), Version::new(x, ts(10))),
                initial_timestamp: ts(10),
            },
        );
        history.insert(
            z,
            BranchBirthCertificate {
                region: Region::universe(),
                origin: RegionMap::new(Region::universe(), Version::new(x, ts(5))),
                initial_timestamp: ts(5),
            },
        );
        (history, x, y, z)
    }

    #[test]
    fn same_branch_projects_to_itself() {
        let (history, x, _, _) = sibling_history();
        let projected = version_project_onto_branch(
            &history,
            Version::new(x, ts(7)),
            x,
            &Region::universe(),
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::min()),
            Some(&Version::new(x, ts(7)))
        );
    }

    #[test]
    fn child_projects_onto_parent_at_divergence() {
        let (history, x, y, _) = sibling_history();
        let projected = version_project_onto_branch(
            &history,
            Version::new(y, ts(15)),
            x,
            &Region::universe(),
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::min()),
            Some(&Version::new(x, ts(10)))
        );
    }

    #[test]
    fn parent_projects_onto_child_up_to_divergence() {
        let (history, x, y, _) = sibling_history();
        // A write at 4 on X happened before Y diverged at 10, so Y carries
        // it; the common point is on X.
        let projected = version_project_onto_branch(
            &history,
            Version::new(x, ts(4)),
            y,
            &Region::universe(),
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::min()),
            Some(&Version::new(x, ts(4)))
        );
    }

    #[test]
    fn sibling_projects_through_the_fork_point() {
        let (history, x, y, z) = sibling_history();
        // Z diverged from X at 5; nothing after that is on Y's lineage.
        let projected = version_project_onto_branch(
            &history,
            Version::new(z, ts(9)),
            y,
            &Region::universe(),
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::min()),
            Some(&Version::new(x, ts(5)))
        );
    }

    #[test]
    fn zero_version_projects_to_zero() {
        let (history, _, y, _) = sibling_history();
        let projected =
            version_project_onto_branch(&history, Version::zero(), y, &Region::universe());
        assert_eq!(projected.lookup(0, &StoreKey::min()), Some(&Version::zero()));
    }

    #[test]
    fn projection_splits_on_region_dependent_origins() {
        let (mut history, x, _, _) = sibling_history();
        // W diverged from X at 20 on the left half of the key space and at
        // 30 on the right half.
        let w = branch(4);
        let m = StoreKey::new("m");
        let left = Region::new(
            0,
            HASH_SPACE_SIZE,
            KeyRange::new(StoreKey::min(), Some(m.clone())),
        );
        let right = Region::new(0, HASH_SPACE_SIZE, KeyRange::new(m.clone(), None));
        history.insert(
            w,
            BranchBirthCertificate {
                region: Region::universe(),
                origin: RegionMap::from_fragments(vec![
                    (left, Version::new(x, ts(20))),
                    (right, Version::new(x, ts(30))),
                ]),
                initial_timestamp: ts(30),
            },
        );
        let projected = version_project_onto_branch(
            &history,
            Version::new(w, ts(40)),
            x,
            &Region::universe(),
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::new("a")),
            Some(&Version::new(x, ts(20)))
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::new("z")),
            Some(&Version::new(x, ts(30)))
        );
    }

    #[test]
    fn combined_reader_prefers_either_source() {
        let (history, x, _, _) = sibling_history();
        let mut snippet = BranchHistory::new();
        let private = branch(9);
        snippet.insert(
            private,
            BranchBirthCertificate {
                region: Region::universe(),
                origin: RegionMap::new(Region::universe(), Version::new(x, ts(12))),
                initial_timestamp: ts(12),
            },
        );
        let combined = CombinedBranchHistoryReader::new(&history, &snippet);
        assert!(combined.is_branch_known(&x));
        assert!(combined.is_branch_known(&private));
        let projected = version_project_onto_branch(
            &combined,
            Version::new(private, ts(13)),
            x,
            &Region::universe(),
        );
        assert_eq!(
            projected.lookup(0, &StoreKey::min()),
            Some(&Version::new(x, ts(12)))
        );
    }

    #[test]
    #[should_panic(expected = "missing from the branch history")]
    fn unknown_branch_is_a_programming_error() {
        let history = BranchHistory::new();
        let _ = version_project_onto_branch(
            &history,
            Version::new(branch(42), ts(1)),
            branch(43),
            &Region::universe(),
        );
    }
}
