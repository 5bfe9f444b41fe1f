//! Startup recovery: chain verification, index rebuild, orphan resolution.
//!
//! Recovery runs before any request is accepted. The log is the ground
//! truth for audit, so integrity doubt is startup-fatal: a broken chain or
//! an impossible state path refuses service rather than repairing anything.
//!
//! Traces found mid-execution are resolved, not resumed: an EXECUTING trace
//! gets a FAILED record with `RECOVERED_ORPHAN`, because the process cannot
//! know whether the tool ran. AUTHORIZED traces may continue if their
//! capability is still temporally valid; otherwise they are failed with
//! `CAPABILITY_EXPIRED_DURING_RECOVERY`. The session cache is never warmed:
//! sessions are ephemeral and require fresh authorization after a restart.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{info, warn};

use tga_core::chain::{self, ChainViolation, GENESIS_HASH};
use tga_core::clock::Clock;
use tga_core::record::{reason, ExecutionRecord, ExecutionState, StatePathError};
use tga_core::store::{StateStore, StoreError};

use crate::machine::TraceEntry;

/// Errors that refuse startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RecoveryError {
    /// The hash chain does not verify; the damaged sequence is reported.
    #[error(transparent)]
    ChainBroken(#[from] ChainViolation),

    /// A trace's projected state path is not a valid machine path.
    #[error("invalid state path for trace {trace_id} at sequence {sequence}: {source}")]
    InvalidStatePath {
        /// The trace with the impossible path.
        trace_id: String,
        /// The sequence of the record that broke the path.
        sequence: u64,
        /// The specific path violation.
        source: StatePathError,
    },

    /// The store failed while loading or resolving.
    #[error("store error during recovery")]
    Store {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },
}

impl RecoveryError {
    /// Returns the externally surfaced error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ChainBroken(violation) => violation.error_code(),
            Self::InvalidStatePath { .. } => "INVALID_STATE_PATH",
            Self::Store { source } => source.error_code(),
        }
    }
}

/// Summary of a completed recovery pass.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Number of records whose chain links verified.
    pub records_verified: u64,
    /// EXECUTING traces resolved with `RECOVERED_ORPHAN`.
    pub orphans_resolved: u32,
    /// AUTHORIZED traces failed with `CAPABILITY_EXPIRED_DURING_RECOVERY`.
    pub expired_resolved: u32,
    /// Traces left in a non-terminal state after recovery.
    pub open_traces: u32,
}

/// The state recovery hands to the runtime.
#[derive(Debug)]
pub struct RecoveredState {
    /// Per-trace latest-state index rebuilt from the log.
    pub traces: HashMap<String, TraceEntry>,
    /// Recovery statistics.
    pub report: RecoveryReport,
}

/// Verifies the log and resolves non-terminal traces.
///
/// # Errors
///
/// Returns [`RecoveryError`] on any integrity violation; the caller must
/// treat this as fatal and exit non-zero after a diagnostic.
pub fn recover(store: &dyn StateStore, clock: &dyn Clock) -> Result<RecoveredState, RecoveryError> {
    let records = store.load_all()?;

    // (I1)-(I3): gap-free sequences, intact links, stable hashes
    chain::verify(&records)?;

    // (I4): every trace's projected state path must be a valid machine path
    let mut traces = rebuild_trace_index(&records)?;

    let mut report = RecoveryReport {
        records_verified: records.len() as u64,
        ..RecoveryReport::default()
    };

    let mut tail = records
        .last()
        .map_or((0, GENESIS_HASH), |r| (r.sequence, r.record_hash));

    // Deterministic resolution order
    let mut open: Vec<String> = traces
        .iter()
        .filter(|(_, entry)| !entry.state.is_terminal())
        .map(|(trace_id, _)| trace_id.clone())
        .collect();
    open.sort();

    let now_secs = clock.now_secs();

    for trace_id in open {
        let entry = traces[&trace_id].clone();
        match entry.state {
            ExecutionState::Executing => {
                // The tool may or may not have run; resolve, never resume
                tail = append_failure(
                    store,
                    clock,
                    &mut traces,
                    &trace_id,
                    &entry,
                    tail,
                    reason::RECOVERED_ORPHAN,
                )?;
                report.orphans_resolved += 1;
                warn!(trace_id = %trace_id, "resolved orphaned execution");
            },
            ExecutionState::Authorized => {
                let still_valid = store
                    .session_for_capability(&entry.capability_hash)?
                    .is_some_and(|binding| now_secs < binding.expires_at);
                if still_valid {
                    report.open_traces += 1;
                } else {
                    tail = append_failure(
                        store,
                        clock,
                        &mut traces,
                        &trace_id,
                        &entry,
                        tail,
                        reason::CAPABILITY_EXPIRED_DURING_RECOVERY,
                    )?;
                    report.expired_resolved += 1;
                    warn!(trace_id = %trace_id, "failed authorization that expired while down");
                }
            },
            // A lone PENDING trace may still be authorized by its caller
            _ => report.open_traces += 1,
        }
    }

    info!(
        records_verified = report.records_verified,
        orphans_resolved = report.orphans_resolved,
        expired_resolved = report.expired_resolved,
        open_traces = report.open_traces,
        "recovery complete"
    );

    Ok(RecoveredState { traces, report })
}

/// Rebuilds the per-trace latest-state index, validating each state path.
fn rebuild_trace_index(
    records: &[ExecutionRecord],
) -> Result<HashMap<String, TraceEntry>, RecoveryError> {
    let mut paths: HashMap<&str, Vec<&ExecutionRecord>> = HashMap::new();
    for record in records {
        paths.entry(&record.trace_id).or_default().push(record);
    }

    let mut traces = HashMap::new();
    for (trace_id, trace_records) in paths {
        let states: Vec<ExecutionState> = trace_records.iter().map(|r| r.state).collect();
        tga_core::record::validate_trace_path(&states).map_err(|source| {
            let sequence = match &source {
                StatePathError::BadInitialState { .. } => trace_records[0].sequence,
                StatePathError::IllegalTransition { .. } => {
                    // The second record of the first offending pair
                    states
                        .windows(2)
                        .position(|pair| !pair[0].is_valid_successor(pair[1]))
                        .map_or(trace_records[0].sequence, |i| trace_records[i + 1].sequence)
                },
                _ => trace_records[0].sequence,
            };
            RecoveryError::InvalidStatePath {
                trace_id: trace_id.to_string(),
                sequence,
                source,
            }
        })?;

        let latest = trace_records[trace_records.len() - 1];
        traces.insert(
            trace_id.to_string(),
            TraceEntry {
                state: latest.state,
                sequence: latest.sequence,
                capability_hash: latest.capability_hash,
                input_hash: latest.input_hash,
            },
        );
    }

    Ok(traces)
}

/// Appends a FAILED record for one trace during recovery.
///
/// Recovery runs single-threaded before the runtime starts, so linking off
/// the remembered tail is safe.
fn append_failure(
    store: &dyn StateStore,
    clock: &dyn Clock,
    traces: &mut HashMap<String, TraceEntry>,
    trace_id: &str,
    entry: &TraceEntry,
    tail: (u64, chain::Hash),
    failure_reason: &str,
) -> Result<(u64, chain::Hash), RecoveryError> {
    let (tail_sequence, prev_hash) = tail;
    let mut record = ExecutionRecord {
        sequence: tail_sequence + 1,
        trace_id: trace_id.to_string(),
        state: ExecutionState::Failed,
        capability_hash: entry.capability_hash,
        input_hash: entry.input_hash,
        output_hash: None,
        prev_hash,
        record_hash: [0u8; 32],
        created_at_ns: clock.now_ns(),
        reason: Some(failure_reason.to_string()),
    };
    record.record_hash = chain::link(&record);

    store.append(&record)?;

    traces.insert(
        trace_id.to_string(),
        TraceEntry {
            state: ExecutionState::Failed,
            sequence: record.sequence,
            capability_hash: entry.capability_hash,
            input_hash: entry.input_hash,
        },
    );

    Ok((record.sequence, record.record_hash))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tga_core::chain::EMPTY_CAPABILITY_HASH;
    use tga_core::clock::FixedClock;
    use tga_core::store::{SessionBinding, SqliteStateStore};

    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn seed(store: &SqliteStateStore, entries: &[(&str, ExecutionState)]) {
        let clock = FixedClock::new(NOW - 100);
        let mut prev = GENESIS_HASH;
        let mut sequence = 0;
        for (trace_id, state) in entries {
            sequence += 1;
            let capability_hash = if matches!(*state, ExecutionState::Pending) {
                EMPTY_CAPABILITY_HASH
            } else {
                chain::digest_bytes(trace_id.as_bytes())
            };
            let mut record = ExecutionRecord {
                sequence,
                trace_id: (*trace_id).to_string(),
                state: *state,
                capability_hash,
                input_hash: None,
                output_hash: None,
                prev_hash: prev,
                record_hash: [0u8; 32],
                created_at_ns: clock.now_ns() + sequence,
                reason: None,
            };
            record.record_hash = chain::link(&record);
            prev = record.record_hash;
            store.append(&record).unwrap();
        }
    }

    fn bind(store: &SqliteStateStore, trace_id: &str, expires_at: u64) {
        store
            .put_session(&SessionBinding {
                session_id: format!("sess-{trace_id}"),
                capability_hash: chain::digest_bytes(trace_id.as_bytes()),
                expires_at,
                trace_id: trace_id.to_string(),
                created_at_ns: 1,
            })
            .unwrap();
    }

    #[test]
    fn test_recover_empty_store() {
        let store = SqliteStateStore::in_memory().unwrap();
        let recovered = recover(&store, &FixedClock::new(NOW)).unwrap();
        assert!(recovered.traces.is_empty());
        assert_eq!(recovered.report.records_verified, 0);
    }

    #[test]
    fn test_recover_rebuilds_latest_states() {
        let store = SqliteStateStore::in_memory().unwrap();
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Authorized),
                ("t1", ExecutionState::Executing),
                ("t1", ExecutionState::Completed),
                ("t2", ExecutionState::Pending),
                ("t2", ExecutionState::Rejected),
            ],
        );

        let recovered = recover(&store, &FixedClock::new(NOW)).unwrap();
        assert_eq!(recovered.traces["t1"].state, ExecutionState::Completed);
        assert_eq!(recovered.traces["t2"].state, ExecutionState::Rejected);
        assert_eq!(recovered.report.records_verified, 6);
        assert_eq!(recovered.report.orphans_resolved, 0);
    }

    #[test]
    fn test_recover_resolves_orphaned_execution() {
        let store = SqliteStateStore::in_memory().unwrap();
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Authorized),
                ("t1", ExecutionState::Executing),
            ],
        );
        bind(&store, "t1", NOW + 60);

        let recovered = recover(&store, &FixedClock::new(NOW)).unwrap();
        assert_eq!(recovered.report.orphans_resolved, 1);
        assert_eq!(recovered.traces["t1"].state, ExecutionState::Failed);

        let records = store.load_all().unwrap();
        let last = records.last().unwrap();
        assert_eq!(last.state, ExecutionState::Failed);
        assert_eq!(last.reason.as_deref(), Some(reason::RECOVERED_ORPHAN));
        // The chain stays clean end to end after resolution
        assert!(chain::verify(&records).is_ok());
    }

    #[test]
    fn test_recover_keeps_valid_authorized_trace() {
        let store = SqliteStateStore::in_memory().unwrap();
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Authorized),
            ],
        );
        bind(&store, "t1", NOW + 60);

        let recovered = recover(&store, &FixedClock::new(NOW)).unwrap();
        assert_eq!(recovered.traces["t1"].state, ExecutionState::Authorized);
        assert_eq!(recovered.report.open_traces, 1);
        assert_eq!(recovered.report.expired_resolved, 0);
    }

    #[test]
    fn test_recover_fails_expired_authorized_trace() {
        let store = SqliteStateStore::in_memory().unwrap();
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Authorized),
            ],
        );
        bind(&store, "t1", NOW - 10);

        let recovered = recover(&store, &FixedClock::new(NOW)).unwrap();
        assert_eq!(recovered.traces["t1"].state, ExecutionState::Failed);
        assert_eq!(recovered.report.expired_resolved, 1);

        let last = store.tail().unwrap().unwrap();
        assert_eq!(
            last.reason.as_deref(),
            Some(reason::CAPABILITY_EXPIRED_DURING_RECOVERY)
        );
    }

    #[test]
    fn test_recover_fails_authorized_trace_without_binding() {
        let store = SqliteStateStore::in_memory().unwrap();
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Authorized),
            ],
        );

        // No session binding: expiry cannot be established, fail closed
        let recovered = recover(&store, &FixedClock::new(NOW)).unwrap();
        assert_eq!(recovered.traces["t1"].state, ExecutionState::Failed);
    }

    #[test]
    fn test_recover_refuses_invalid_state_path() {
        let store = SqliteStateStore::in_memory().unwrap();
        // PENDING -> EXECUTING skips AUTHORIZED
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Executing),
            ],
        );

        let err = recover(&store, &FixedClock::new(NOW)).unwrap_err();
        assert!(matches!(
            err,
            RecoveryError::InvalidStatePath { sequence: 2, .. }
        ));
        assert_eq!(err.error_code(), "INVALID_STATE_PATH");
    }

    #[test]
    fn test_recover_is_idempotent() {
        let store = Arc::new(SqliteStateStore::in_memory().unwrap());
        seed(
            &store,
            &[
                ("t1", ExecutionState::Pending),
                ("t1", ExecutionState::Authorized),
                ("t1", ExecutionState::Executing),
            ],
        );
        bind(&store, "t1", NOW + 60);

        let first = recover(store.as_ref(), &FixedClock::new(NOW)).unwrap();
        assert_eq!(first.report.orphans_resolved, 1);

        // A second pass finds the trace already resolved
        let second = recover(store.as_ref(), &FixedClock::new(NOW)).unwrap();
        assert_eq!(second.report.orphans_resolved, 0);
        assert_eq!(second.traces["t1"].state, ExecutionState::Failed);
    }
}
