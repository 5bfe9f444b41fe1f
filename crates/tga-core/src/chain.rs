//! Hash-chain primitives binding execution records to their predecessors.
//!
//! Each record's hash covers the previous record's hash, so any modification
//! of a persisted record breaks every later link. Verification walks the full
//! log and reports the first damaged sequence number.
//!
//! Digests are SHA-256 over canonical bytes. They are stored as raw 32-byte
//! values and surfaced externally as base64url without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::canonical::{self, CanonicalError};
use crate::record::ExecutionRecord;

/// Size of a record digest in bytes.
pub const HASH_SIZE: usize = 32;

/// A raw SHA-256 digest.
pub type Hash = [u8; HASH_SIZE];

/// Previous-hash value for the first record in the log.
pub const GENESIS_HASH: Hash = [0u8; HASH_SIZE];

/// Capability-hash sentinel for records written before authorization.
pub const EMPTY_CAPABILITY_HASH: Hash = [0u8; HASH_SIZE];

/// The kind of chain damage found during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ViolationKind {
    /// A record's stored hash does not match its recomputed hash.
    HashMismatch,
    /// Sequence numbers are not gap-free from 1.
    SequenceGap,
    /// A record's `prev_hash` does not equal the preceding record's hash.
    PrevLinkMismatch,
}

impl ViolationKind {
    /// Returns the kind as a string identifier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::HashMismatch => "HASH_MISMATCH",
            Self::SequenceGap => "SEQUENCE_GAP",
            Self::PrevLinkMismatch => "PREV_LINK_MISMATCH",
        }
    }
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A broken link found while verifying the chain.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("hash chain broken at sequence {sequence}: {kind}")]
pub struct ChainViolation {
    /// The sequence number of the first damaged record.
    pub sequence: u64,
    /// What kind of damage was found.
    pub kind: ViolationKind,
}

impl ChainViolation {
    /// The externally surfaced error code for chain violations.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        "HASH_CHAIN_BROKEN"
    }
}

/// Computes the SHA-256 digest of a value's canonical bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value falls outside the canonical
/// grammar.
pub fn digest_value(value: &Value) -> Result<Hash, CanonicalError> {
    let bytes = canonical::canonical_bytes(value)?;
    Ok(digest_bytes(&bytes))
}

/// Computes the SHA-256 digest of raw bytes.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Encodes a digest as base64url without padding for external surfaces.
#[must_use]
pub fn encode_hash(hash: &Hash) -> String {
    URL_SAFE_NO_PAD.encode(hash)
}

/// Decodes a base64url digest back to raw bytes.
///
/// # Errors
///
/// Returns `None` if the input is not a valid 32-byte base64url digest.
#[must_use]
pub fn decode_hash(encoded: &str) -> Option<Hash> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).ok()?;
    bytes.try_into().ok()
}

/// Computes a record's hash over all fields preceding it, including
/// `prev_hash`.
///
/// The hash input is the canonicalization of an ordered field encoding.
/// Digests encode as base64url, absent digests as null, and the numeric
/// fields as decimal strings (`created_at` is nanoseconds since epoch and
/// exceeds the canonical integer range).
#[must_use]
pub fn link(record: &ExecutionRecord) -> Hash {
    let fields = Value::Array(vec![
        Value::String(encode_hash(&record.prev_hash)),
        Value::String(record.sequence.to_string()),
        Value::String(record.trace_id.clone()),
        Value::String(record.state.as_str().to_string()),
        Value::String(encode_hash(&record.capability_hash)),
        record
            .input_hash
            .as_ref()
            .map_or(Value::Null, |h| Value::String(encode_hash(h))),
        record
            .output_hash
            .as_ref()
            .map_or(Value::Null, |h| Value::String(encode_hash(h))),
        Value::String(record.created_at_ns.to_string()),
        record
            .reason
            .as_ref()
            .map_or(Value::Null, |r| Value::String(r.clone())),
    ]);

    // The field encoding contains only strings and nulls, so emission is
    // total; no validation pass is needed.
    let mut canonical = String::new();
    canonical::emit_value(&fields, &mut canonical);
    digest_bytes(canonical.as_bytes())
}

/// Verifies a full log: gap-free sequences from 1, intact previous-hash
/// links, and stable record hashes.
///
/// # Errors
///
/// Returns the first [`ChainViolation`] found, in ascending sequence order.
pub fn verify(records: &[ExecutionRecord]) -> Result<(), ChainViolation> {
    let mut expected_prev = GENESIS_HASH;
    let mut expected_sequence = 0u64;

    for record in records {
        expected_sequence += 1;

        if record.sequence != expected_sequence {
            return Err(ChainViolation {
                sequence: record.sequence,
                kind: ViolationKind::SequenceGap,
            });
        }

        if record.prev_hash != expected_prev {
            return Err(ChainViolation {
                sequence: record.sequence,
                kind: ViolationKind::PrevLinkMismatch,
            });
        }

        if link(record) != record.record_hash {
            return Err(ChainViolation {
                sequence: record.sequence,
                kind: ViolationKind::HashMismatch,
            });
        }

        expected_prev = record.record_hash;
    }

    Ok(())
}
