//! Contracts and contract acknowledgements.
//!
//! A contract is the durable instruction telling each replica what role it
//! plays for one region: data holder, voter, phased-in voter, or primary.
//! Replicas answer with acknowledgements describing how far they have come
//! in carrying the contract out.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::branch::BranchHistory;
use super::identity::{BranchId, ServerId};
use super::region_map::RegionMap;
use super::version::Version;

/// The primary assignment inside a contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimarySpec {
    pub server: ServerId,
    /// When set, the primary has been asked to wind down in favour of this
    /// server: it keeps serving writes but must backfill the target and then
    /// report `PrimaryReady`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hand_over: Option<ServerId>,
}

impl PrimarySpec {
    pub fn new(server: ServerId) -> Self {
        Self {
            server,
            hand_over: None,
        }
    }
}

/// Per-region replica roles for the next epoch.
///
/// While `temp_voters` is present, writes must be acked by a majority of
/// both voter sets; the primary reports `PrimaryReady` only once it has also
/// backfilled every previously acked write to a majority of the new set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    /// Servers that hold data for the region.
    pub replicas: BTreeSet<ServerId>,
    /// Subset of `replicas` whose acks count toward the write quorum.
    pub voters: BTreeSet<ServerId>,
    /// Proposed future voter set being phased in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_voters: Option<BTreeSet<ServerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<PrimarySpec>,
    /// The branch this contract's writes live on.
    pub branch: BranchId,
}

impl Contract {
    /// Check the structural invariants. Callers ingesting replicated state
    /// run this before trusting a contract.
    pub fn validate(&self) -> Result<(), ContractError> {
        for server in &self.voters {
            if !self.replicas.contains(server) {
                return Err(ContractError::VoterNotReplica { server: *server });
            }
        }
        if let Some(temp_voters) = &self.temp_voters {
            for server in temp_voters {
                if !self.replicas.contains(server) {
                    return Err(ContractError::TempVoterNotReplica { server: *server });
                }
            }
        }
        if let Some(primary) = &self.primary {
            if !self.replicas.contains(&primary.server) {
                return Err(ContractError::PrimaryNotReplica {
                    server: primary.server,
                });
            }
            if let Some(target) = primary.hand_over {
                if !self.replicas.contains(&target) {
                    return Err(ContractError::HandOverNotReplica { server: target });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContractError {
    #[error("voter {server} is not in the replica set")]
    VoterNotReplica { server: ServerId },
    #[error("temp voter {server} is not in the replica set")]
    TempVoterNotReplica { server: ServerId },
    #[error("primary {server} is not in the replica set")]
    PrimaryNotReplica { server: ServerId },
    #[error("hand-over target {server} is not in the replica set")]
    HandOverNotReplica { server: ServerId },
}

/// Where a replica has got to in executing a contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    /// The primary is up but needs a branch registered before accepting
    /// writes.
    PrimaryNeedBranch,
    /// The primary is serving writes but not yet in a steady state.
    PrimaryInProgress,
    /// The primary is in a steady state: requiring acks from every quorum
    /// the contract names, with all earlier writes backfilled.
    PrimaryReady,
    /// A secondary with no primary to stream from; reports its version so a
    /// primary can be elected.
    SecondaryNeedPrimary,
    /// A secondary catching up via backfill.
    SecondaryBackfilling,
    /// A secondary fully caught up and streaming.
    SecondaryStreaming,
    Nothing,
}

/// A replica's acknowledgement of one contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractAck {
    pub state: AckState,
    /// What data the replica holds, per sub-region. Absent when the state
    /// alone says everything (e.g. a streaming secondary).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<RegionMap<Version>>,
    /// Primary-side: the branch the primary wants registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<BranchId>,
    /// Private history snippet sufficient to resolve `version`.
    #[serde(default, skip_serializing_if = "BranchHistory::is_empty")]
    pub branch_history: BranchHistory,
}

impl ContractAck {
    pub fn new(state: AckState) -> Self {
        Self {
            state,
            version: None,
            branch: None,
            branch_history: BranchHistory::new(),
        }
    }

    pub fn with_version(mut self, version: RegionMap<Version>) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_branch(mut self, branch: BranchId) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_branch_history(mut self, branch_history: BranchHistory) -> Self {
        self.branch_history = branch_history;
        self
    }
}
