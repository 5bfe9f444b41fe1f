//! # tga-core
//!
//! Core library for the Talos Governance Agent, the sidecar that mediates
//! tool invocations issued by an AI agent. Every invocation must present a
//! short-lived capability signed by a trusted Supervisor; the agent verifies
//! it, binds the call to a hash-chained execution record, and persists every
//! state transition before exposing a result.
//!
//! This crate holds the leaf components:
//!
//! - **Canonicalization**: deterministic JSON bytes for hashing and signing
//! - **Hash chain**: per-record digests binding each record to its
//!   predecessor, with end-to-end verification
//! - **Records**: the execution state vocabulary and immutable log entries
//! - **Capability verification**: token parsing, Ed25519 signature checks
//!   and constraint evaluation
//! - **Session cache**: the warm path for repeat calls under one
//!   authorization
//! - **State store**: the append-only `SQLite` log with crash safety
//!
//! The execution state machine and startup recovery live in `tga-daemon`.
//!
//! # Fail-closed posture
//!
//! On ambiguity or integrity doubt the agent refuses service: unknown
//! constraint keys reject, damaged hash chains refuse startup, and a missing
//! Supervisor key is fatal.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod capability;
pub mod chain;
pub mod clock;
pub mod config;
pub mod record;
pub mod session;
pub mod store;

pub use capability::{
    CapabilityClaims, CapabilityVerifier, Constraints, Rejection, ReplayIndex, RequestContext,
    VerifiedCapability, VerifierConfig,
};
pub use chain::{ChainViolation, Hash, ViolationKind};
pub use clock::{Clock, FixedClock, MonotonicClock, SystemClock};
pub use config::{ConfigError, GovernanceConfig};
pub use record::{ExecutionRecord, ExecutionState};
pub use session::SessionCache;
pub use store::{SessionBinding, SqliteStateStore, StateStore, StoreError};
