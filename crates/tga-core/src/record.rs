//! Execution records and the state vocabulary of the governance log.
//!
//! A trace moves through PENDING, AUTHORIZED, EXECUTING and ends in one of
//! the terminal states COMPLETED, REJECTED or FAILED. Records are written
//! exactly once and never mutated; the string form of a state exists only
//! for persistence.
//!
//! # Invariants
//!
//! - Terminal states have no outgoing transitions
//! - A trace's projected state sequence is a valid machine path
//! - A record's hash covers every field including `prev_hash`

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chain::Hash;

/// Reason codes recorded on REJECTED and FAILED records.
pub mod reason {
    /// Execution was interrupted by a crash and resolved during recovery.
    pub const RECOVERED_ORPHAN: &str = "RECOVERED_ORPHAN";

    /// The authorizing capability expired while the process was down.
    pub const CAPABILITY_EXPIRED_DURING_RECOVERY: &str = "CAPABILITY_EXPIRED_DURING_RECOVERY";

    /// The capability expired between authorization and dispatch.
    pub const EXPIRED: &str = "EXPIRED";
}

/// The state of a tool call in the execution lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ExecutionState {
    /// The call has been received; nothing is authorized yet.
    Pending,
    /// The capability was verified and constraints hold.
    Authorized,
    /// The call has been handed to the tool executor.
    Executing,
    /// The call finished and its output was recorded.
    Completed,
    /// Authorization was refused.
    Rejected,
    /// Execution failed or was resolved as failed by recovery.
    Failed,
}

/// Error returned when a persisted state string is not recognized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unrecognized execution state: {value}")]
pub struct ParseStateError {
    /// The string that failed to parse.
    pub value: String,
}

impl ExecutionState {
    /// Returns the persisted string form of the state.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Rejected => "REJECTED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses the persisted string form of a state.
    ///
    /// # Errors
    ///
    /// Returns [`ParseStateError`] if the string is not a recognized state.
    pub fn parse(value: &str) -> Result<Self, ParseStateError> {
        match value {
            "PENDING" => Ok(Self::Pending),
            "AUTHORIZED" => Ok(Self::Authorized),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETED" => Ok(Self::Completed),
            "REJECTED" => Ok(Self::Rejected),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseStateError {
                value: other.to_string(),
            }),
        }
    }

    /// Returns `true` for COMPLETED, REJECTED and FAILED.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Rejected | Self::Failed)
    }

    /// Returns `true` if `next` is a legal successor of this state.
    ///
    /// AUTHORIZED admits FAILED so recovery can resolve traces whose
    /// capability expired while the process was down.
    #[must_use]
    pub const fn is_valid_successor(&self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Authorized | Self::Rejected),
            Self::Authorized => matches!(next, Self::Executing | Self::Failed),
            Self::Executing => matches!(next, Self::Completed | Self::Failed),
            Self::Completed | Self::Rejected | Self::Failed => false,
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable entry in the execution log.
///
/// `record_hash` covers every other field including `prev_hash`, binding the
/// record to its position in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    /// Position in the global log; gap-free from 1.
    pub sequence: u64,
    /// Identifier grouping all records of one logical tool call.
    pub trace_id: String,
    /// The state entered by this record.
    pub state: ExecutionState,
    /// SHA-256 of the canonicalized capability payload, or the all-zero
    /// sentinel before authorization.
    pub capability_hash: Hash,
    /// SHA-256 of the canonicalized tool input; set from AUTHORIZED onward.
    pub input_hash: Option<Hash>,
    /// SHA-256 of the canonicalized tool output; set at COMPLETED.
    pub output_hash: Option<Hash>,
    /// The preceding record's hash, or 32 zero bytes for sequence 1.
    pub prev_hash: Hash,
    /// SHA-256 over the canonical encoding of all preceding fields.
    pub record_hash: Hash,
    /// Nanoseconds since epoch from a monotonic source.
    pub created_at_ns: u64,
    /// Short diagnostic code on REJECTED and FAILED records.
    pub reason: Option<String>,
}

/// Error describing an invalid per-trace state path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StatePathError {
    /// A trace's first record is not PENDING.
    #[error("trace must begin in PENDING, found {found}")]
    BadInitialState {
        /// The state found at the start of the trace.
        found: ExecutionState,
    },

    /// Two adjacent records form an illegal transition.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// The earlier state.
        from: ExecutionState,
        /// The later state.
        to: ExecutionState,
    },
}

/// Validates a trace's states projected in sequence order.
///
/// # Errors
///
/// Returns [`StatePathError`] if the path does not start in PENDING or
/// contains an illegal transition (including any transition out of a
/// terminal state).
pub fn validate_trace_path(states: &[ExecutionState]) -> Result<(), StatePathError> {
    let Some(first) = states.first() else {
        return Ok(());
    };

    if *first != ExecutionState::Pending {
        return Err(StatePathError::BadInitialState { found: *first });
    }

    for pair in states.windows(2) {
        if !pair[0].is_valid_successor(pair[1]) {
            return Err(StatePathError::IllegalTransition {
                from: pair[0],
                to: pair[1],
            });
        }
    }

    Ok(())
}
