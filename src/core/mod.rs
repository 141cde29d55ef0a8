//! Core domain types for the contract coordinator.
//!
//! Module hierarchy follows type dependency order:
//! - identity: ServerId, BranchId, ContractId
//! - time: StateTimestamp
//! - region: StoreKey, KeyRange, Region, cpu sharding
//! - region_map: RegionMap
//! - version: Version
//! - branch: birth certificates, history readers, projection
//! - contract: Contract, ContractAck
//! - table: ShardConfig, TableConfig, TableState
//! - connectivity: ConnectivityMap

pub mod branch;
pub mod connectivity;
pub mod contract;
pub mod identity;
pub mod region;
pub mod region_map;
pub mod table;
pub mod time;
pub mod version;

pub use branch::{
    BranchBirthCertificate, BranchHistory, BranchHistoryReader, CombinedBranchHistoryReader,
    version_find_common, version_project_onto_branch,
};
pub use connectivity::ConnectivityMap;
pub use contract::{AckState, Contract, ContractAck, ContractError, PrimarySpec};
pub use identity::{BranchId, ContractId, ServerId};
pub use region::{
    CPU_SHARDING_FACTOR, HASH_SPACE_SIZE, KeyRange, Region, StoreKey, cpu_shard_of,
    cpu_sharding_subspace,
};
pub use region_map::{FragmentError, RegionMap};
pub use table::{
    ShardConfig, ShardScheme, TableConfig, TableConfigError, TableState, TableStateError,
};
pub use time::StateTimestamp;
pub use version::Version;
