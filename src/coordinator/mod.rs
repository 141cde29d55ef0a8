//! Contract decision logic.
//!
//! The coordinator is a pure transformation: given the replicated table
//! state, the replicas' contract acks, and the connectivity view, it decides
//! the next contract generation. It runs serialised on a single logical
//! worker, never suspends, and is re-invoked whenever an input changes;
//! re-invocation is the only retry loop.

pub mod calculate;
pub mod fragment;
pub mod plan;

pub use calculate::calculate_contract;
pub use fragment::{AckFragment, break_ack_into_fragments};
pub use plan::{ContractsDiff, calculate_all_contracts};
