//! Crate-level error type.
//!
//! `CoreError` covers failures in the core's own API surface (bad input,
//! illegal state transitions, programmer errors). It is distinct from
//! [`crate::types::StructuredError`], which is the spec's data vocabulary
//! surfaced to the inference engine for recoverable navigation/perception/
//! action failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("intent must not be empty")]
    EmptyIntent,

    #[error("startUrl must not be empty")]
    EmptyStartUrl,

    #[error("tunable '{name}' out of range: {detail}")]
    InvalidTunable { name: &'static str, detail: String },

    #[error("illegal state transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: crate::types::TaskState,
        to: crate::types::TaskState,
    },

    #[error("programmer error: {0}")]
    ProgrammerError(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
