//! The all-contracts driver.
//!
//! `calculate_all_contracts` slices the key space into pieces across which
//! every input is homogeneous, runs the per-region calculator on each piece,
//! coalesces the results, and emits a minimal diff against the previous
//! contract generation. Contract ids survive exactly when the contract is
//! unchanged over the identical region.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::connectivity::ConnectivityMap;
use crate::core::contract::{AckState, Contract, ContractAck};
use crate::core::identity::{BranchId, ContractId, ServerId};
use crate::core::region::{CPU_SHARDING_FACTOR, HASH_SPACE_SIZE, Region, cpu_shard_of,
    cpu_sharding_subspace};
use crate::core::region_map::RegionMap;
use crate::core::table::TableState;

use super::calculate::calculate_contract;
use super::fragment::{AckFragment, break_ack_into_fragments};

/// The coordinator's output: applied atomically by the log layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContractsDiff {
    pub remove_contracts: BTreeSet<ContractId>,
    pub add_contracts: BTreeMap<ContractId, (Region, Contract)>,
    /// New branches to record as current, keyed by the region they cover.
    /// This is the only channel by which branches enter the authoritative
    /// state, and it only opens while primary continuity is preserved.
    pub register_current_branches: BTreeMap<Region, BranchId>,
}

impl ContractsDiff {
    pub fn is_empty(&self) -> bool {
        self.remove_contracts.is_empty()
            && self.add_contracts.is_empty()
            && self.register_current_branches.is_empty()
    }
}

/// Compute the next contract generation.
///
/// `acks` maps `(server, contract id)` to that server's ack for that
/// contract; acks for contracts no longer in `state` are ignored.
pub fn calculate_all_contracts(
    state: &TableState,
    acks: &BTreeMap<(ServerId, ContractId), ContractAck>,
    connectivity: &ConnectivityMap,
    log_prefix: &str,
) -> ContractsDiff {
    let mut diff = ContractsDiff::default();
    let mut new_fragments: Vec<(Region, Contract)> = Vec::new();

    for (contract_id, (contract_region, old_contract)) in &state.contracts {
        for (shard_index, shard_config) in state.config.shards.iter().enumerate() {
            let shard_region =
                Region::with_keys(state.config.shard_scheme.shard_range(shard_index));
            let region = Region::intersect(contract_region, &shard_region);
            if region.is_empty() {
                continue;
            }

            // Collect this contract's acks, fragmenting the region as the
            // ack versions demand. The map starts homogeneous and splits as
            // fragments land.
            let mut frags_by_server: RegionMap<BTreeMap<ServerId, AckFragment>> =
                RegionMap::new(region.clone(), BTreeMap::new());
            for ((server, ack_contract_id), ack) in acks {
                if ack_contract_id != contract_id {
                    continue;
                }
                let frags = break_ack_into_fragments(
                    &region,
                    ack,
                    &state.current_branches,
                    &state.branch_history,
                );
                frags.visit(&region, |frag_region, frag| {
                    frags_by_server.visit_mut(&frag_region, |_, acks_map| {
                        let previous = acks_map.insert(*server, frag.clone());
                        assert!(
                            previous.is_none(),
                            "server {server} contributed two ack fragments for one sub-region"
                        );
                    });
                });
            }

            // Inputs are now homogeneous per sub-region. The visit order is
            // key range first, hash second, which is what lets a full-height
            // hash run mark the end of a subshard for the log prefix.
            let mut subshard_index = 0usize;
            frags_by_server.visit(&region, |sub_region, acks_map| {
                let log_subprefix = if log_prefix.is_empty() {
                    String::new()
                } else {
                    let prefix = format!(
                        "{log_prefix}: shard {shard_index}.{subshard_index}.{}",
                        cpu_shard_of(&sub_region)
                    );
                    if sub_region.hash_end == HASH_SPACE_SIZE {
                        subshard_index += 1;
                    }
                    prefix
                };

                let new_contract = calculate_contract(
                    old_contract,
                    shard_config,
                    acks_map,
                    connectivity,
                    &log_subprefix,
                );

                // A primary that kept its role across the transition may ask
                // for a branch to be registered.
                if let (Some(old_primary), Some(new_primary)) =
                    (&old_contract.primary, &new_contract.primary)
                {
                    if old_primary.server == new_primary.server {
                        if let Some(frag) = acks_map.get(&old_primary.server) {
                            if frag.state == AckState::PrimaryNeedBranch {
                                let branch = frag
                                    .branch
                                    .expect("a need-branch ack names the branch to register");
                                let previous = diff
                                    .register_current_branches
                                    .insert(sub_region.clone(), branch);
                                assert!(
                                    previous.is_none(),
                                    "two branch registrations for one sub-region"
                                );
                            }
                        }
                    }
                }

                new_fragments.push((sub_region, new_contract));
            });
        }
    }

    // Coalesce adjacent regions that ended up with identical contracts, then
    // slice the result so no contract spans more than one cpu shard or user
    // shard; downstream execution is partitioned on both axes.
    let new_contract_map = RegionMap::from_fragments(new_fragments);
    let mut sliced: BTreeMap<Region, Contract> = BTreeMap::new();
    for cpu_shard in 0..CPU_SHARDING_FACTOR {
        let slab = cpu_sharding_subspace(cpu_shard);
        for shard_index in 0..state.config.shards.len() {
            let query = Region::new(
                slab.hash_beg,
                slab.hash_end,
                state.config.shard_scheme.shard_range(shard_index),
            );
            new_contract_map.visit(&query, |sub_region, contract| {
                sliced.insert(sub_region, contract.clone());
            });
        }
    }

    // Diff against the old generation, preserving ids of unchanged
    // contracts.
    for (old_id, (old_region, old_contract)) in &state.contracts {
        match sliced.get(old_region) {
            Some(contract) if contract == old_contract => {
                sliced.remove(old_region);
            }
            _ => {
                diff.remove_contracts.insert(*old_id);
            }
        }
    }
    for (region, contract) in sliced {
        diff.add_contracts.insert(ContractId::mint(), (region, contract));
    }

    diff
}
