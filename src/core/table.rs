//! Table configuration and the log-replicated table state.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::branch::BranchHistory;
use super::contract::{Contract, ContractError};
use super::identity::{BranchId, ContractId, ServerId};
use super::region::{KeyRange, Region, StoreKey};
use super::region_map::{FragmentError, RegionMap};

/// User-specified replica placement for one shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub all_replicas: BTreeSet<ServerId>,
    #[serde(default)]
    pub nonvoting_replicas: BTreeSet<ServerId>,
    /// Nil when the user has not designated a primary; the coordinator then
    /// elects the most up-to-date eligible replica.
    #[serde(default = "ServerId::nil")]
    pub primary_replica: ServerId,
}

impl ShardConfig {
    pub fn voting_replicas(&self) -> BTreeSet<ServerId> {
        self.all_replicas
            .difference(&self.nonvoting_replicas)
            .copied()
            .collect()
    }
}

/// Sorted split points carving the key space into shard ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardScheme {
    split_points: Vec<StoreKey>,
}

impl ShardScheme {
    pub fn new(split_points: Vec<StoreKey>) -> Self {
        Self { split_points }
    }

    pub fn one_shard() -> Self {
        Self::default()
    }

    pub fn shard_count(&self) -> usize {
        self.split_points.len() + 1
    }

    /// Half-open key range of the given shard.
    pub fn shard_range(&self, index: usize) -> KeyRange {
        assert!(index < self.shard_count(), "shard index {index} out of range");
        let left = if index == 0 {
            StoreKey::min()
        } else {
            self.split_points[index - 1].clone()
        };
        let right = self.split_points.get(index).cloned();
        KeyRange::new(left, right)
    }

    /// The shard a key falls into.
    pub fn shard_for_key(&self, key: &StoreKey) -> usize {
        self.split_points.partition_point(|split| split <= key)
    }
}

/// The user-facing table configuration: one entry per shard, in key order,
/// plus the shard scheme naming each shard's key range.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableConfig {
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub shard_scheme: ShardScheme,
}

impl TableConfig {
    /// Parse and validate a TOML table config.
    pub fn from_toml_str(input: &str) -> Result<Self, TableConfigError> {
        let config: TableConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TableConfigError> {
        if self.shards.is_empty() {
            return Err(TableConfigError::NoShards);
        }
        if self.shard_scheme.shard_count() != self.shards.len() {
            return Err(TableConfigError::SplitPointMismatch {
                split_points: self.shard_scheme.split_points.len(),
                shards: self.shards.len(),
            });
        }
        for pair in self.shard_scheme.split_points.windows(2) {
            if pair[0] >= pair[1] {
                return Err(TableConfigError::UnorderedSplitPoints);
            }
        }
        if let Some(first) = self.shard_scheme.split_points.first() {
            if *first <= StoreKey::min() {
                return Err(TableConfigError::UnorderedSplitPoints);
            }
        }
        for (index, shard) in self.shards.iter().enumerate() {
            if shard.all_replicas.is_empty() {
                return Err(TableConfigError::EmptyShard { index });
            }
            for server in &shard.nonvoting_replicas {
                if !shard.all_replicas.contains(server) {
                    return Err(TableConfigError::NonvotingNotReplica {
                        index,
                        server: *server,
                    });
                }
            }
            let voting = shard.voting_replicas();
            if voting.is_empty() {
                return Err(TableConfigError::NoVoters { index });
            }
            if !shard.primary_replica.is_nil() && !voting.contains(&shard.primary_replica) {
                return Err(TableConfigError::PrimaryNotVoter {
                    index,
                    server: shard.primary_replica,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableConfigError {
    #[error("table config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("table config has no shards")]
    NoShards,
    #[error("shard scheme has {split_points} split points for {shards} shards")]
    SplitPointMismatch { split_points: usize, shards: usize },
    #[error("shard scheme split points are not strictly ascending")]
    UnorderedSplitPoints,
    #[error("shard {index} has no replicas")]
    EmptyShard { index: usize },
    #[error("shard {index}: nonvoting replica {server} is not in all_replicas")]
    NonvotingNotReplica { index: usize, server: ServerId },
    #[error("shard {index} has no voting replicas")]
    NoVoters { index: usize },
    #[error("shard {index}: primary {server} is not a voting replica")]
    PrimaryNotVoter { index: usize, server: ServerId },
}

/// Snapshot of the log-replicated table state the coordinator reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    pub contracts: BTreeMap<ContractId, (Region, Contract)>,
    pub config: TableConfig,
    pub current_branches: RegionMap<BranchId>,
    pub branch_history: BranchHistory,
}

impl TableState {
    /// Check the structural invariants of a snapshot: every contract is
    /// well-formed, the contract regions partition the key space, and the
    /// current-branch map covers all of it.
    pub fn validate(&self) -> Result<(), TableStateError> {
        for (id, (_, contract)) in &self.contracts {
            contract
                .validate()
                .map_err(|source| TableStateError::InvalidContract { id: *id, source })?;
        }
        let fragments: Vec<(Region, ContractId)> = self
            .contracts
            .iter()
            .map(|(id, (region, _))| (region.clone(), *id))
            .collect();
        let covered = RegionMap::try_from_fragments(fragments)?;
        if covered.region() != Region::universe() {
            return Err(TableStateError::IncompleteCover {
                covered: covered.region(),
            });
        }
        if self.current_branches.region() != Region::universe() {
            return Err(TableStateError::IncompleteCover {
                covered: self.current_branches.region(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum TableStateError {
    #[error("contract {id}: {source}")]
    InvalidContract {
        id: ContractId,
        source: ContractError,
    },
    #[error("contracts do not partition the key space: {0}")]
    BrokenPartition(#[from] FragmentError),
    #[error("state covers {covered:?} instead of the whole key space")]
    IncompleteCover { covered: Region },
}
