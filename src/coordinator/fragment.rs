//! Ack fragmentation.
//!
//! A `ContractAck` is not necessarily homogeneous: its version map may name
//! different versions for different sub-regions, and a sub-region with a
//! single version may still need splitting once the branch history is
//! consulted. The per-region calculator assumes homogeneous input, so acks
//! are first broken into fragments, each carrying a single projected
//! timestamp instead of a version map.

use crate::core::branch::{BranchHistory, CombinedBranchHistoryReader, version_project_onto_branch};
use crate::core::contract::{AckState, ContractAck};
use crate::core::identity::BranchId;
use crate::core::region::Region;
use crate::core::region_map::RegionMap;
use crate::core::time::StateTimestamp;

/// Homogeneous projection of an ack over one sub-region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckFragment {
    pub state: AckState,
    /// How far along the sub-region's current branch the replica has
    /// reached, when the ack carried a version map.
    pub version: Option<StateTimestamp>,
    pub branch: Option<BranchId>,
}

/// Convert an ack into a homogeneous region map of fragments over `region`.
///
/// Fragments split first on the current branch, then on the ack's version
/// within each branch run; each version is projected onto the canonical
/// branch through the authoritative history combined with the ack's private
/// snippet. Without that projection a replica whose last write sits on a
/// sibling branch would appear up to date when it is not.
pub fn break_ack_into_fragments(
    region: &Region,
    ack: &ContractAck,
    current_branches: &RegionMap<BranchId>,
    branch_history: &BranchHistory,
) -> RegionMap<AckFragment> {
    let base = AckFragment {
        state: ack.state,
        version: None,
        branch: ack.branch,
    };
    let Some(ack_version) = &ack.version else {
        return RegionMap::new(region.clone(), base);
    };
    let combined = CombinedBranchHistoryReader::new(branch_history, &ack.branch_history);
    current_branches.map_multi(region, |branch_reg, branch| {
        ack_version.map_multi(branch_reg, |reg, version| {
            version_project_onto_branch(&combined, *version, *branch, reg).map(
                reg,
                |_, on_canonical| AckFragment {
                    state: ack.state,
                    version: Some(on_canonical.timestamp),
                    branch: ack.branch,
                },
            )
        })
    })
}
