//! Durable, crash-safe storage for the execution log.
//!
//! The store is append-only: records are inserted exactly once and never
//! modified or deleted. The concrete backend is a single SQLite file with
//! WAL journaling; [`SqliteStateStore`] enforces the sequence and hash-link
//! invariants at append time so a torn or misordered write can never reach
//! disk.

mod sqlite;

pub use sqlite::SqliteStateStore;

use thiserror::Error;

use crate::chain::Hash;
use crate::record::{ExecutionRecord, ExecutionState};

/// Current schema version written to new stores.
pub const SCHEMA_VERSION: i64 = 1;

/// Errors from the state store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during store operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The appended record's sequence is not exactly `tail + 1`.
    #[error("sequence conflict: expected {expected}, got {actual}")]
    SequenceConflict {
        /// The next sequence number the log accepts.
        expected: u64,
        /// The sequence number that was offered.
        actual: u64,
    },

    /// The appended record's `prev_hash` does not match the tail.
    #[error("hash link mismatch at sequence {sequence}: prev_hash does not match the log tail")]
    HashLinkMismatch {
        /// The sequence number of the rejected record.
        sequence: u64,
    },

    /// The store file is readable by other users or cannot be restricted.
    #[error("insecure permissions on state store: {path}")]
    InsecurePermissions {
        /// The offending path.
        path: String,
    },

    /// The store was written by a newer schema than this build supports.
    #[error("unsupported schema version {found} (this build supports up to {supported})")]
    UnsupportedSchemaVersion {
        /// The version found in the store.
        found: i64,
        /// The newest version this build understands.
        supported: i64,
    },

    /// A persisted row does not decode into a record.
    #[error("corrupt row at sequence {sequence}: {detail}")]
    CorruptRow {
        /// The sequence number of the damaged row.
        sequence: u64,
        /// What failed to decode.
        detail: String,
    },
}

impl StoreError {
    /// The externally surfaced error code for store failures.
    ///
    /// Append-time conflicts surface as `STATE_COMMIT_FAILED`; corrupt rows
    /// are integrity damage and surface as `HASH_CHAIN_BROKEN`.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::CorruptRow { .. } => "HASH_CHAIN_BROKEN",
            _ => "STATE_COMMIT_FAILED",
        }
    }
}

/// A session binding persisted at the AUTHORIZED transition.
///
/// Bindings let recovery decide whether an AUTHORIZED trace may continue
/// after a restart; the in-memory session cache is never rebuilt from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    /// The session handle returned to the caller.
    pub session_id: String,
    /// Hash of the authorizing capability payload.
    pub capability_hash: Hash,
    /// Unix timestamp (seconds) the capability stops being valid.
    pub expires_at: u64,
    /// The trace this session authorized.
    pub trace_id: String,
    /// Nanoseconds since epoch the binding was created.
    pub created_at_ns: u64,
}

/// Contract for durable execution-log storage.
///
/// Implementations must provide per-call atomicity, durability before
/// returning from [`append`](StateStore::append), and a single-writer
/// discipline.
pub trait StateStore: Send + Sync {
    /// Atomically persists one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SequenceConflict`] if the record's sequence is
    /// not exactly `tail + 1`, [`StoreError::HashLinkMismatch`] if its
    /// `prev_hash` does not equal the tail's record hash, or a database
    /// error. The record is durable before `Ok` is returned.
    fn append(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// Returns every record in ascending sequence order.
    ///
    /// Used only by recovery.
    ///
    /// # Errors
    ///
    /// Returns a database error or [`StoreError::CorruptRow`] if a row does
    /// not decode.
    fn load_all(&self) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// Returns the last record without loading the whole log.
    ///
    /// # Errors
    ///
    /// Returns a database error or [`StoreError::CorruptRow`].
    fn tail(&self) -> Result<Option<ExecutionRecord>, StoreError>;

    /// Returns the trace ids whose latest record is in `state`.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    fn traces_in_state(&self, state: ExecutionState) -> Result<Vec<String>, StoreError>;

    /// Persists a session binding.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    fn put_session(&self, binding: &SessionBinding) -> Result<(), StoreError>;

    /// Looks up the most recent session binding for a capability.
    ///
    /// # Errors
    ///
    /// Returns a database error or [`StoreError::CorruptRow`].
    fn session_for_capability(
        &self,
        capability_hash: &Hash,
    ) -> Result<Option<SessionBinding>, StoreError>;

    /// Returns `true` if any AUTHORIZED record carries this capability hash.
    ///
    /// This is the durable side of replay protection for one-shot
    /// capabilities.
    ///
    /// # Errors
    ///
    /// Returns a database error.
    fn capability_authorized(&self, capability_hash: &Hash) -> Result<bool, StoreError>;
}
