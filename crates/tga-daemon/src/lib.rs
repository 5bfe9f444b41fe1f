//! # tga-daemon
//!
//! Runtime for the Talos Governance Agent: the execution state machine that
//! drives tool calls through the hash-chained log, and the startup recovery
//! pass that verifies the log and resolves interrupted traces.
//!
//! The protocol server that frames tool calls and the downstream tool
//! executor are external collaborators; they drive [`GovernanceRuntime`]
//! through its `authorize`/`dispatch`/`complete`/`fail` surface.
//!
//! # Startup order
//!
//! 1. Read configuration (`TGA_*` environment); a missing Supervisor key is
//!    fatal.
//! 2. Open the state store; an unownable store file is fatal.
//! 3. Run [`recovery::recover`]; any integrity violation is fatal and the
//!    process exits non-zero after a diagnostic.
//! 4. Construct the runtime from the recovered index and start serving.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod machine;
pub mod recovery;

pub use machine::{
    Authorized, Completed, Dispatched, Failed, GovernanceError, GovernanceRuntime, ToolCallRequest,
    TraceEntry, TraceLockTable,
};
pub use recovery::{recover, RecoveredState, RecoveryError, RecoveryReport};
