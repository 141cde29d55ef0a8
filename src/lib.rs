#![forbid(unsafe_code)]

//! # quorate
//!
//! The contract coordinator of a sharded, replicated storage cluster.
//!
//! Contracts are durable per-region instructions telling each replica what
//! role it plays: data holder, voter, phased-in voter, or primary. The
//! coordinator is a deterministic pure function layered on a replicated log:
//! given the current contracts, the user's desired configuration, the
//! replicas' acknowledgements, and a pairwise connectivity view, it computes
//! the next contract generation as a minimal diff.
//!
//! ```text
//! state change ──> calculate_all_contracts
//!                      │  per (contract × shard × homogeneous sub-region)
//!                      ├─> break_ack_into_fragments
//!                      ├─> calculate_contract
//!                      └─> coalesce, re-slice, diff
//!                             │
//!                             ▼
//!        (remove set, add map, branch registrations) ──> replicated log
//! ```
//!
//! The decisions are the safety-critical ones: when to begin and commit a
//! replica-set change, when to fail over, when to hand primary ownership
//! over, and when to register a new data branch. Each proceeds in phases so
//! that no acked write is lost across a quorum or primary change.
//!
//! The crate owns no I/O: the log transport, the per-shard runtime, storage,
//! and the query layer are external collaborators that feed it snapshots.

pub mod coordinator;
pub mod core;
pub mod error;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience.
pub use crate::coordinator::{
    AckFragment, ContractsDiff, break_ack_into_fragments, calculate_all_contracts,
    calculate_contract,
};
pub use crate::core::{
    AckState, BranchBirthCertificate, BranchHistory, BranchHistoryReader, BranchId,
    CombinedBranchHistoryReader, ConnectivityMap, Contract, ContractAck, ContractError,
    ContractId, CPU_SHARDING_FACTOR, FragmentError, HASH_SPACE_SIZE, KeyRange, PrimarySpec,
    Region, RegionMap, ServerId, ShardConfig, ShardScheme, StateTimestamp, StoreKey, TableConfig,
    TableConfigError, TableState, TableStateError, Version, cpu_shard_of, cpu_sharding_subspace,
    version_find_common, version_project_onto_branch,
};
