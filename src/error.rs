//! The orchestrator's closed error-kind set.
//!
//! Every failure surfaced to `main.rs` is one of these four kinds so the CLI
//! can map it to a stable exit code (§6/§7 of the design): plan problems and
//! run-not-found style issues exit 2, a lock conflict exits 3, anything else
//! bubbles up as an `Os` error.

use std::fmt;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum OrchError {
    #[error("{0}")]
    Plan(String),

    #[error("{0}")]
    State(String),

    #[error("{0}")]
    RunConflict(String),

    #[error(transparent)]
    Os(#[from] io::Error),
}

impl OrchError {
    pub fn plan(msg: impl fmt::Display) -> Self {
        OrchError::Plan(msg.to_string())
    }

    pub fn state(msg: impl fmt::Display) -> Self {
        OrchError::State(msg.to_string())
    }

    pub fn run_conflict(msg: impl fmt::Display) -> Self {
        OrchError::RunConflict(msg.to_string())
    }

    pub fn os(msg: impl fmt::Display) -> Self {
        OrchError::Os(io::Error::other(msg.to_string()))
    }
}

pub type OrchResult<T> = Result<T, OrchError>;
