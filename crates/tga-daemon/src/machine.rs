//! The execution state machine driving tool calls through the log.
//!
//! A Moore machine: each transition appends exactly one record and the
//! observable output of a trace is the state its latest record entered.
//! PENDING leads to AUTHORIZED or REJECTED, AUTHORIZED to EXECUTING,
//! EXECUTING to COMPLETED or FAILED. Terminal traces accept no further
//! events.
//!
//! # Concurrency
//!
//! Three shared resources gate progress:
//!
//! - The store writer lock serializes tail-read, link and append, so the
//!   global sequence is totally ordered.
//! - The per-trace lock table admits one in-flight transition per trace;
//!   contention returns `TRACE_BUSY` to the caller instead of queueing.
//!   Distinct traces progress in parallel.
//! - The session cache is internally synchronized.
//!
//! # Durability vs cancellation
//!
//! A transition is durable iff its append succeeded. Deadlines are checked
//! before an append begins; once the write is in flight it always runs to
//! completion, and an elapsed deadline only changes what the caller sees,
//! never what the log records.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash as _, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

use tga_core::canonical::{self, CanonicalError};
use tga_core::capability::{
    CapabilityVerifier, Rejection, ReplayIndex, RequestContext, VerifiedCapability,
};
use tga_core::chain::{self, Hash, EMPTY_CAPABILITY_HASH, GENESIS_HASH};
use tga_core::clock::{Clock, MonotonicClock};
use tga_core::record::{reason, ExecutionRecord, ExecutionState};
use tga_core::session::{self, SessionCache};
use tga_core::store::{SessionBinding, StateStore, StoreError};

/// Number of stripes in the per-trace lock table.
const LOCK_STRIPES: usize = 64;

/// Maximum number of nonces tracked for replay protection.
const MAX_TRACKED_NONCES: usize = 4096;

/// Errors surfaced by the state machine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GovernanceError {
    /// Authorization was refused; a REJECTED record was committed.
    #[error("authorization rejected at sequence {sequence}: {rejection}")]
    Rejected {
        /// Why authorization failed.
        rejection: Rejection,
        /// The sequence of the committed REJECTED record.
        sequence: u64,
    },

    /// Another transition for this trace is in flight.
    #[error("trace {trace_id} has another transition in flight")]
    TraceBusy {
        /// The contended trace.
        trace_id: String,
    },

    /// The trace already reached a terminal state; the event was a no-op.
    #[error("trace {trace_id} is already terminal in {state}")]
    AlreadyTerminal {
        /// The trace.
        trace_id: String,
        /// Its terminal state.
        state: ExecutionState,
    },

    /// The event does not apply to the trace's current state.
    #[error("event '{event}' does not apply to trace {trace_id} in state {state}")]
    InvalidTransition {
        /// The trace.
        trace_id: String,
        /// Its current state.
        state: ExecutionState,
        /// The event that was attempted.
        event: &'static str,
    },

    /// The trace is not known to this process.
    #[error("trace {trace_id} is unknown")]
    UnknownTrace {
        /// The unknown trace id.
        trace_id: String,
    },

    /// The session handle is not in the cache; retry with the full token.
    #[error("session {session_id} is unknown or expired")]
    UnknownSession {
        /// The session handle that missed.
        session_id: String,
    },

    /// The capability expired before dispatch; a FAILED record was
    /// committed.
    #[error("capability for trace {trace_id} expired before dispatch")]
    ExpiredBeforeDispatch {
        /// The trace.
        trace_id: String,
        /// The sequence of the committed FAILED record.
        sequence: u64,
    },

    /// The tool output falls outside the canonical value grammar; a FAILED
    /// record was committed.
    #[error("tool output for trace {trace_id} is unrepresentable: {source}")]
    UnrepresentableOutput {
        /// The trace.
        trace_id: String,
        /// The sequence of the committed FAILED record.
        sequence: u64,
        /// The canonicalization failure.
        source: CanonicalError,
    },

    /// The caller's deadline elapsed before the append began; no record was
    /// written.
    #[error("deadline elapsed before the transition was committed")]
    DeadlineExceeded,

    /// The store refused or failed the append.
    #[error("transition could not be committed")]
    CommitFailed {
        /// The underlying store error.
        #[from]
        source: StoreError,
    },
}

impl GovernanceError {
    /// Returns the externally surfaced error code.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Rejected { rejection, .. } => rejection.reason_code(),
            Self::TraceBusy { .. } => "TRACE_BUSY",
            Self::AlreadyTerminal { .. } => "ALREADY_TERMINAL",
            Self::InvalidTransition { .. } | Self::UnknownTrace { .. } => "INVALID_STATE_PATH",
            Self::UnknownSession { .. } => "MISSING_CREDENTIALS",
            Self::ExpiredBeforeDispatch { .. } => "EXPIRED",
            Self::UnrepresentableOutput { .. } => "CANONICAL_UNSUPPORTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::CommitFailed { source } => source.error_code(),
        }
    }
}

/// A tool call submitted for authorization or completion.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Fully qualified tool name.
    pub tool: String,
    /// Structured tool input.
    pub input: Value,
    /// Whether the caller marks the request read-only.
    pub read_only: bool,
    /// Optional caller deadline; see the module notes on cancellation.
    pub deadline: Option<Instant>,
}

/// Successful authorization outcome.
#[derive(Debug, Clone)]
pub struct Authorized {
    /// The trace that was authorized.
    pub trace_id: String,
    /// Session handle for warm-path repeat calls.
    pub session_id: String,
    /// Sequence of the AUTHORIZED record.
    pub sequence: u64,
    /// Hash of the authorizing capability payload.
    pub capability_hash: Hash,
    /// Hash of the canonicalized input.
    pub input_hash: Hash,
}

/// Successful dispatch outcome.
#[derive(Debug, Clone)]
pub struct Dispatched {
    /// The trace now executing.
    pub trace_id: String,
    /// Sequence of the EXECUTING record.
    pub sequence: u64,
}

/// Successful completion outcome.
#[derive(Debug, Clone)]
pub struct Completed {
    /// The completed trace.
    pub trace_id: String,
    /// Sequence of the COMPLETED record.
    pub sequence: u64,
    /// Hash of the canonicalized output.
    pub output_hash: Hash,
}

/// Outcome of failing a trace.
#[derive(Debug, Clone)]
pub struct Failed {
    /// The failed trace.
    pub trace_id: String,
    /// Sequence of the FAILED record.
    pub sequence: u64,
}

/// The in-memory latest-state projection of one trace.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    /// The state the trace's latest record entered.
    pub state: ExecutionState,
    /// Sequence of that record.
    pub sequence: u64,
    /// Capability hash carried by the trace, sentinel before authorization.
    pub capability_hash: Hash,
    /// Input hash carried by the trace, set from AUTHORIZED onward.
    pub input_hash: Option<Hash>,
}

/// Striped per-trace lock table.
///
/// One lock per trace, sharded over [`LOCK_STRIPES`] stripes so distinct
/// traces never contend on a single map mutex. Acquisition never waits:
/// contention surfaces as `TRACE_BUSY`.
pub struct TraceLockTable {
    stripes: Vec<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl TraceLockTable {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn stripe(&self, trace_id: &str) -> &Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        let mut hasher = DefaultHasher::new();
        trace_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % LOCK_STRIPES;
        &self.stripes[index]
    }

    /// Tries to acquire the trace's lock without waiting.
    pub fn try_acquire(&self, trace_id: &str) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let mut map = self.stripe(trace_id).lock().unwrap();
            Arc::clone(
                map.entry(trace_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.try_lock_owned().ok()
    }

    /// Drops the lock entry for a trace that reached a terminal state.
    pub fn forget(&self, trace_id: &str) {
        self.stripe(trace_id).lock().unwrap().remove(trace_id);
    }
}

impl Default for TraceLockTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded in-memory nonce tracker for reusable capabilities.
///
/// A nonce presented by a different capability inside its issuance window
/// is a replay. Entries expire with the capability that introduced them.
struct NonceLedger {
    inner: Mutex<HashMap<String, NonceEntry>>,
}

struct NonceEntry {
    capability_hash: Hash,
    expires_at: u64,
}

impl NonceLedger {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn conflicts(&self, nonce: &str, capability_hash: &Hash, now_secs: u64) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get(nonce) {
            Some(entry) if entry.expires_at <= now_secs => {
                map.remove(nonce);
                false
            },
            Some(entry) => entry.capability_hash != *capability_hash,
            None => false,
        }
    }

    fn observe(&self, nonce: &str, capability_hash: Hash, expires_at: u64, now_secs: u64) {
        let mut map = self.inner.lock().unwrap();
        if map.len() >= MAX_TRACKED_NONCES {
            map.retain(|_, entry| entry.expires_at > now_secs);
        }
        if map.len() >= MAX_TRACKED_NONCES {
            // Still full of live entries; drop the soonest to expire
            if let Some(victim) = map
                .iter()
                .min_by_key(|(_, entry)| entry.expires_at)
                .map(|(nonce, _)| nonce.clone())
            {
                map.remove(&victim);
            }
        }
        map.insert(
            nonce.to_string(),
            NonceEntry {
                capability_hash,
                expires_at,
            },
        );
    }
}

/// Replay probe backed by the durable log and the nonce ledger.
///
/// Store failures report a conflict: replay protection fails closed.
struct ReplayGuard<'a> {
    store: &'a dyn StateStore,
    nonces: &'a NonceLedger,
    now_secs: u64,
}

impl ReplayIndex for ReplayGuard<'_> {
    fn capability_authorized(&self, capability_hash: &Hash) -> bool {
        self.store
            .capability_authorized(capability_hash)
            .unwrap_or_else(|e| {
                warn!(error = %e, "replay probe failed, failing closed");
                true
            })
    }

    fn nonce_conflicts(&self, nonce: &str, capability_hash: &Hash) -> bool {
        self.nonces.conflicts(nonce, capability_hash, self.now_secs)
    }
}

/// The governance runtime: verifier, caches, lock table and log writer.
///
/// One runtime owns the log; construct it after recovery has verified the
/// chain and rebuilt the trace index.
pub struct GovernanceRuntime {
    store: Arc<dyn StateStore>,
    verifier: CapabilityVerifier,
    sessions: SessionCache,
    locks: TraceLockTable,
    nonces: NonceLedger,
    clock: MonotonicClock,
    /// Serializes tail-read, link and append across traces.
    writer: tokio::sync::Mutex<()>,
    traces: RwLock<HashMap<String, TraceEntry>>,
}

impl GovernanceRuntime {
    /// Creates a runtime over a recovered store.
    ///
    /// `traces` is the per-trace latest-state index rebuilt by recovery;
    /// passing a stale index breaks the single-writer discipline.
    #[must_use]
    pub fn new(
        store: Arc<dyn StateStore>,
        verifier: CapabilityVerifier,
        session_cache_size: usize,
        traces: HashMap<String, TraceEntry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            verifier,
            sessions: SessionCache::new(session_cache_size),
            locks: TraceLockTable::new(),
            nonces: NonceLedger::new(),
            clock: MonotonicClock::new(clock),
            writer: tokio::sync::Mutex::new(()),
            traces: RwLock::new(traces),
        }
    }

    /// Returns the latest known state of a trace.
    #[must_use]
    pub fn trace_state(&self, trace_id: &str) -> Option<ExecutionState> {
        self.traces.read().unwrap().get(trace_id).map(|e| e.state)
    }

    /// Flushes the session cache.
    ///
    /// Called on Supervisor key rotation: session handles do not survive a
    /// rotation and every caller re-authorizes with a fresh token.
    pub async fn flush_sessions(&self) {
        self.sessions.flush().await;
    }

    /// Authorizes a tool call with a full capability token (the cold path).
    ///
    /// Appends PENDING and then AUTHORIZED or REJECTED. On success the
    /// session binding is persisted and a session handle is returned for
    /// warm-path repeat calls.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::Rejected`] when verification fails (a REJECTED
    /// record was committed), plus the lock, state and commit errors
    /// documented on [`GovernanceError`].
    pub async fn authorize(
        &self,
        trace_id: &str,
        token: &[u8],
        request: &ToolCallRequest,
    ) -> Result<Authorized, GovernanceError> {
        let _guard = self
            .locks
            .try_acquire(trace_id)
            .ok_or_else(|| GovernanceError::TraceBusy {
                trace_id: trace_id.to_string(),
            })?;

        self.begin_pending(trace_id, request.deadline).await?;

        let canonical_input = match canonical::canonical_bytes(&request.input) {
            Ok(bytes) => bytes,
            Err(e) => {
                let rejection = Rejection::Canonical(e);
                let sequence = self.commit_rejection(trace_id, &rejection, request).await?;
                return Err(GovernanceError::Rejected {
                    rejection,
                    sequence,
                });
            },
        };

        let now_secs = self.clock.now_secs();
        let ctx = RequestContext {
            tool: request.tool.clone(),
            input: request.input.clone(),
            canonical_input_len: canonical_input.len() as u64,
            read_only: request.read_only,
        };
        let replay = ReplayGuard {
            store: self.store.as_ref(),
            nonces: &self.nonces,
            now_secs,
        };

        match self.verifier.verify(token, &ctx, now_secs, &replay) {
            Ok(verified) => {
                self.commit_authorized(trace_id, &verified, &canonical_input, request)
                    .await
            },
            Err(rejection) => {
                let sequence = self.commit_rejection(trace_id, &rejection, request).await?;
                Err(GovernanceError::Rejected {
                    rejection,
                    sequence,
                })
            },
        }
    }

    /// Authorizes a repeat call through a cached session (the warm path).
    ///
    /// The capability's signature is not re-verified; expiry, tool match,
    /// constraints and replay are. A cache miss returns
    /// [`GovernanceError::UnknownSession`] and the caller falls back to the
    /// cold path with the full token.
    ///
    /// # Errors
    ///
    /// As [`authorize`](Self::authorize), plus `UnknownSession` on a miss.
    pub async fn authorize_session(
        &self,
        trace_id: &str,
        session_id: &str,
        request: &ToolCallRequest,
    ) -> Result<Authorized, GovernanceError> {
        let now_secs = self.clock.now_secs();
        let Some(capability) = self.sessions.get(session_id, now_secs).await else {
            return Err(GovernanceError::UnknownSession {
                session_id: session_id.to_string(),
            });
        };

        let _guard = self
            .locks
            .try_acquire(trace_id)
            .ok_or_else(|| GovernanceError::TraceBusy {
                trace_id: trace_id.to_string(),
            })?;

        self.begin_pending(trace_id, request.deadline).await?;

        let canonical_input = match canonical::canonical_bytes(&request.input) {
            Ok(bytes) => bytes,
            Err(e) => {
                let rejection = Rejection::Canonical(e);
                let sequence = self.commit_rejection(trace_id, &rejection, request).await?;
                return Err(GovernanceError::Rejected {
                    rejection,
                    sequence,
                });
            },
        };

        let ctx = RequestContext {
            tool: request.tool.clone(),
            input: request.input.clone(),
            canonical_input_len: canonical_input.len() as u64,
            read_only: request.read_only,
        };

        let checked = capability.check_request(&ctx, now_secs).and_then(|()| {
            let replay = ReplayGuard {
                store: self.store.as_ref(),
                nonces: &self.nonces,
                now_secs,
            };
            if capability.constraints.one_shot {
                if replay.capability_authorized(&capability.capability_hash) {
                    return Err(Rejection::Replay);
                }
            } else if replay.nonce_conflicts(&capability.claims.nonce, &capability.capability_hash)
            {
                return Err(Rejection::Replay);
            }
            Ok(())
        });

        if let Err(rejection) = checked {
            let sequence = self.commit_rejection(trace_id, &rejection, request).await?;
            return Err(GovernanceError::Rejected {
                rejection,
                sequence,
            });
        }

        self.commit_authorized(trace_id, &capability, &canonical_input, request)
            .await
    }

    /// Moves an AUTHORIZED trace to EXECUTING.
    ///
    /// Re-checks capability expiry: a trace whose capability lapsed between
    /// authorization and dispatch is failed with `EXPIRED`.
    ///
    /// # Errors
    ///
    /// The lock, state and commit errors documented on [`GovernanceError`].
    pub async fn dispatch(
        &self,
        trace_id: &str,
        deadline: Option<Instant>,
    ) -> Result<Dispatched, GovernanceError> {
        let _guard = self
            .locks
            .try_acquire(trace_id)
            .ok_or_else(|| GovernanceError::TraceBusy {
                trace_id: trace_id.to_string(),
            })?;

        let entry = self.expect_state(trace_id, ExecutionState::Authorized, "dispatch")?;

        // The wait for the trace lock may have crossed expires_at
        let now_secs = self.clock.now_secs();
        let still_valid = self
            .store
            .session_for_capability(&entry.capability_hash)?
            .is_some_and(|binding| now_secs < binding.expires_at);

        if !still_valid {
            let record = self
                .commit(
                    trace_id,
                    ExecutionState::Failed,
                    entry.capability_hash,
                    entry.input_hash,
                    None,
                    Some(reason::EXPIRED.to_string()),
                    deadline,
                )
                .await?;
            self.locks.forget(trace_id);
            return Err(GovernanceError::ExpiredBeforeDispatch {
                trace_id: trace_id.to_string(),
                sequence: record.sequence,
            });
        }

        let record = self
            .commit(
                trace_id,
                ExecutionState::Executing,
                entry.capability_hash,
                entry.input_hash,
                None,
                None,
                deadline,
            )
            .await?;

        Ok(Dispatched {
            trace_id: trace_id.to_string(),
            sequence: record.sequence,
        })
    }

    /// Records a successful tool result and completes the trace.
    ///
    /// # Errors
    ///
    /// [`GovernanceError::UnrepresentableOutput`] if the output falls
    /// outside the canonical grammar (the trace is failed), plus the lock,
    /// state and commit errors documented on [`GovernanceError`].
    pub async fn complete(
        &self,
        trace_id: &str,
        output: &Value,
        deadline: Option<Instant>,
    ) -> Result<Completed, GovernanceError> {
        let _guard = self
            .locks
            .try_acquire(trace_id)
            .ok_or_else(|| GovernanceError::TraceBusy {
                trace_id: trace_id.to_string(),
            })?;

        let entry = self.expect_state(trace_id, ExecutionState::Executing, "complete")?;

        let output_hash = match canonical::canonical_bytes(output) {
            Ok(bytes) => chain::digest_bytes(&bytes),
            Err(e) => {
                // The trace cannot stay EXECUTING with an unrecordable
                // output; resolve it as failed
                let record = self
                    .commit(
                        trace_id,
                        ExecutionState::Failed,
                        entry.capability_hash,
                        entry.input_hash,
                        None,
                        Some(e.error_code().to_string()),
                        deadline,
                    )
                    .await?;
                self.locks.forget(trace_id);
                return Err(GovernanceError::UnrepresentableOutput {
                    trace_id: trace_id.to_string(),
                    sequence: record.sequence,
                    source: e,
                });
            },
        };

        let record = self
            .commit(
                trace_id,
                ExecutionState::Completed,
                entry.capability_hash,
                entry.input_hash,
                Some(output_hash),
                None,
                deadline,
            )
            .await?;
        self.locks.forget(trace_id);

        Ok(Completed {
            trace_id: trace_id.to_string(),
            sequence: record.sequence,
            output_hash,
        })
    }

    /// Records a tool failure and fails the trace.
    ///
    /// # Errors
    ///
    /// The lock, state and commit errors documented on [`GovernanceError`].
    pub async fn fail(
        &self,
        trace_id: &str,
        failure_reason: &str,
        deadline: Option<Instant>,
    ) -> Result<Failed, GovernanceError> {
        let _guard = self
            .locks
            .try_acquire(trace_id)
            .ok_or_else(|| GovernanceError::TraceBusy {
                trace_id: trace_id.to_string(),
            })?;

        let entry = self.expect_state(trace_id, ExecutionState::Executing, "fail")?;

        let record = self
            .commit(
                trace_id,
                ExecutionState::Failed,
                entry.capability_hash,
                entry.input_hash,
                None,
                Some(failure_reason.to_string()),
                deadline,
            )
            .await?;
        self.locks.forget(trace_id);

        Ok(Failed {
            trace_id: trace_id.to_string(),
            sequence: record.sequence,
        })
    }

    /// Appends the PENDING record for a fresh trace, or resumes a trace
    /// left PENDING by an earlier interrupted authorization.
    async fn begin_pending(
        &self,
        trace_id: &str,
        deadline: Option<Instant>,
    ) -> Result<(), GovernanceError> {
        let existing = self.traces.read().unwrap().get(trace_id).cloned();
        match existing {
            None => {
                self.commit(
                    trace_id,
                    ExecutionState::Pending,
                    EMPTY_CAPABILITY_HASH,
                    None,
                    None,
                    None,
                    deadline,
                )
                .await?;
                Ok(())
            },
            Some(entry) if entry.state == ExecutionState::Pending => Ok(()),
            Some(entry) if entry.state.is_terminal() => Err(GovernanceError::AlreadyTerminal {
                trace_id: trace_id.to_string(),
                state: entry.state,
            }),
            // AUTHORIZED or EXECUTING: the trace is mid-flight
            Some(_) => Err(GovernanceError::TraceBusy {
                trace_id: trace_id.to_string(),
            }),
        }
    }

    /// Commits the AUTHORIZED record, session binding and caches.
    async fn commit_authorized(
        &self,
        trace_id: &str,
        verified: &VerifiedCapability,
        canonical_input: &[u8],
        request: &ToolCallRequest,
    ) -> Result<Authorized, GovernanceError> {
        let input_hash = chain::digest_bytes(canonical_input);
        let session_id = session::generate_session_id();

        // The binding lands before the AUTHORIZED record so recovery can
        // always resolve the capability's expiry for this trace
        self.store.put_session(&SessionBinding {
            session_id: session_id.clone(),
            capability_hash: verified.capability_hash,
            expires_at: verified.claims.expires_at,
            trace_id: trace_id.to_string(),
            created_at_ns: self.clock.now_ns(),
        })?;

        let record = self
            .commit(
                trace_id,
                ExecutionState::Authorized,
                verified.capability_hash,
                Some(input_hash),
                None,
                None,
                request.deadline,
            )
            .await?;

        self.nonces.observe(
            &verified.claims.nonce,
            verified.capability_hash,
            verified.claims.expires_at,
            self.clock.now_secs(),
        );
        self.sessions
            .insert_with_id(session_id.clone(), Arc::new(verified.clone()))
            .await;

        info!(
            trace_id = %trace_id,
            sequence = record.sequence,
            tool = %request.tool,
            "tool call authorized"
        );

        Ok(Authorized {
            trace_id: trace_id.to_string(),
            session_id,
            sequence: record.sequence,
            capability_hash: verified.capability_hash,
            input_hash,
        })
    }

    /// Commits a REJECTED record carrying the rejection's reason code.
    async fn commit_rejection(
        &self,
        trace_id: &str,
        rejection: &Rejection,
        request: &ToolCallRequest,
    ) -> Result<u64, GovernanceError> {
        let record = self
            .commit(
                trace_id,
                ExecutionState::Rejected,
                EMPTY_CAPABILITY_HASH,
                None,
                None,
                Some(rejection.reason_code().to_string()),
                request.deadline,
            )
            .await?;
        self.locks.forget(trace_id);

        info!(
            trace_id = %trace_id,
            sequence = record.sequence,
            reason = rejection.reason_code(),
            "tool call rejected"
        );

        Ok(record.sequence)
    }

    /// Reads the trace entry and requires it to be in `expected`.
    fn expect_state(
        &self,
        trace_id: &str,
        expected: ExecutionState,
        event: &'static str,
    ) -> Result<TraceEntry, GovernanceError> {
        let entry = self
            .traces
            .read()
            .unwrap()
            .get(trace_id)
            .cloned()
            .ok_or_else(|| GovernanceError::UnknownTrace {
                trace_id: trace_id.to_string(),
            })?;

        if entry.state == expected {
            return Ok(entry);
        }

        if entry.state.is_terminal() {
            Err(GovernanceError::AlreadyTerminal {
                trace_id: trace_id.to_string(),
                state: entry.state,
            })
        } else {
            Err(GovernanceError::InvalidTransition {
                trace_id: trace_id.to_string(),
                state: entry.state,
                event,
            })
        }
    }

    /// Builds, links and appends one record under the writer lock, then
    /// updates the trace index.
    ///
    /// The deadline is checked before the append begins; an in-flight
    /// append is never abandoned.
    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        trace_id: &str,
        state: ExecutionState,
        capability_hash: Hash,
        input_hash: Option<Hash>,
        output_hash: Option<Hash>,
        commit_reason: Option<String>,
        deadline: Option<Instant>,
    ) -> Result<ExecutionRecord, GovernanceError> {
        let _writer = self.writer.lock().await;

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(GovernanceError::DeadlineExceeded);
        }

        let tail = self.store.tail()?;
        let (sequence, prev_hash) = tail.map_or((1, GENESIS_HASH), |t| {
            (t.sequence + 1, t.record_hash)
        });

        let mut record = ExecutionRecord {
            sequence,
            trace_id: trace_id.to_string(),
            state,
            capability_hash,
            input_hash,
            output_hash,
            prev_hash,
            record_hash: [0u8; 32],
            created_at_ns: self.clock.now_ns(),
            reason: commit_reason,
        };
        record.record_hash = chain::link(&record);

        // Past this point the write runs to completion; cancellation only
        // affects the caller's view
        self.store.append(&record)?;

        self.traces.write().unwrap().insert(
            trace_id.to_string(),
            TraceEntry {
                state,
                sequence,
                capability_hash,
                input_hash,
            },
        );

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_table_exclusive_per_trace() {
        let table = TraceLockTable::new();

        let held = table.try_acquire("t1").unwrap();
        assert!(table.try_acquire("t1").is_none());
        // Distinct traces are unaffected
        assert!(table.try_acquire("t2").is_some());

        drop(held);
        assert!(table.try_acquire("t1").is_some());
    }

    #[test]
    fn test_lock_table_forget() {
        let table = TraceLockTable::new();
        let held = table.try_acquire("t1").unwrap();
        table.forget("t1");
        drop(held);
        assert!(table.try_acquire("t1").is_some());
    }

    #[test]
    fn test_nonce_ledger_conflicts() {
        let ledger = NonceLedger::new();
        let hash_a = [1u8; 32];
        let hash_b = [2u8; 32];
        let now = 1_000;

        ledger.observe("n1", hash_a, now + 60, now);

        assert!(!ledger.conflicts("n1", &hash_a, now));
        assert!(ledger.conflicts("n1", &hash_b, now));
        assert!(!ledger.conflicts("n2", &hash_b, now));

        // Conflicts lapse with the issuance window
        assert!(!ledger.conflicts("n1", &hash_b, now + 60));
    }

    #[test]
    fn test_nonce_ledger_bounded() {
        let ledger = NonceLedger::new();
        let now = 1_000;
        for i in 0..(MAX_TRACKED_NONCES + 10) {
            ledger.observe(&format!("n{i}"), [0u8; 32], now + 60 + i as u64, now);
        }
        assert!(ledger.inner.lock().unwrap().len() <= MAX_TRACKED_NONCES);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            GovernanceError::TraceBusy {
                trace_id: "t".into()
            }
            .error_code(),
            "TRACE_BUSY"
        );
        assert_eq!(
            GovernanceError::AlreadyTerminal {
                trace_id: "t".into(),
                state: ExecutionState::Completed,
            }
            .error_code(),
            "ALREADY_TERMINAL"
        );
        assert_eq!(
            GovernanceError::DeadlineExceeded.error_code(),
            "DEADLINE_EXCEEDED"
        );
        assert_eq!(
            GovernanceError::Rejected {
                rejection: Rejection::Replay,
                sequence: 2,
            }
            .error_code(),
            "REPLAY"
        );
    }
}
