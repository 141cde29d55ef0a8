//! Crate-level error type.
//!
//! The coordinator itself never fails; it reacts conservatively to missing
//! input. Errors arise only at the edges, when ingesting configuration or
//! replicated state assembled by others. Violated internal invariants are
//! programming errors and panic instead.

use thiserror::Error;

use crate::core::contract::ContractError;
use crate::core::table::{TableConfigError, TableStateError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] TableConfigError),
    #[error(transparent)]
    Contract(#[from] ContractError),
    #[error(transparent)]
    State(#[from] TableStateError),
}
