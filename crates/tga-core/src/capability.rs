//! Capability token parsing, verification and constraint evaluation.
//!
//! A capability is a short-lived authorization minted by the Supervisor for
//! one tool invocation. The wire form is a detached-signature envelope:
//!
//! ```text
//! base64url(header) . base64url(canonical_payload) . base64url(signature)
//! ```
//!
//! The signing input is the UTF-8 bytes of the first two segments joined by
//! a dot. The header algorithm must be exactly `Ed25519`; anything else is
//! rejected before verification is attempted, so there is no algorithm
//! substitution surface.
//!
//! Checks run in a fixed order with the first failure winning: structural
//! parse, signature, audience, temporal window, tool match, constraint
//! evaluation, replay. The verifier is a pure function of
//! `(token, request, public key, now)`; replay state is consulted through
//! the [`ReplayIndex`] probe injected by the caller.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::canonical::{self, CanonicalError};
use crate::chain::{self, Hash};

/// The only accepted token algorithm.
pub const TOKEN_ALG: &str = "Ed25519";

/// The only accepted token type.
pub const TOKEN_TYP: &str = "capability";

/// Maximum accepted token length in bytes.
pub const MAX_TOKEN_LEN: usize = 16 * 1024;

/// Default tolerated clock skew when checking `issued_at`.
pub const DEFAULT_CLOCK_SKEW: Duration = Duration::from_secs(5);

/// Reasons a capability or request is refused.
///
/// Each variant maps to an externally surfaced reason code via
/// [`Rejection::reason_code`]; `UNAUTHORIZED` codes carry a sub-reason after
/// a slash.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Rejection {
    /// No token was presented.
    #[error("no capability token presented")]
    MissingCredentials,

    /// The token failed structural parsing.
    #[error("malformed capability token: {detail}")]
    Malformed {
        /// What failed to parse.
        detail: String,
    },

    /// Ed25519 signature verification failed.
    #[error("capability signature verification failed")]
    BadSignature,

    /// The token audience does not match this agent's identity.
    #[error("capability audience '{audience}' does not match this agent")]
    Audience {
        /// The audience found in the token.
        audience: String,
    },

    /// The capability has expired.
    #[error("capability expired at {expires_at} (now {now})")]
    Expired {
        /// Expiry timestamp from the token.
        expires_at: u64,
        /// The evaluation time.
        now: u64,
    },

    /// The capability is not yet within its validity window.
    #[error("capability not valid before {issued_at} (now {now})")]
    NotYetValid {
        /// Issue timestamp from the token.
        issued_at: u64,
        /// The evaluation time.
        now: u64,
    },

    /// The requested tool is not covered by the capability.
    #[error("tool '{requested}' does not match granted tool '{granted}'")]
    ToolMismatch {
        /// The tool pattern granted by the token.
        granted: String,
        /// The tool the request named.
        requested: String,
    },

    /// A read-only capability was presented for a mutating request.
    #[error("capability is read-only but the request is not")]
    ReadOnlyRequired,

    /// The canonicalized input exceeds the capability's size bound.
    #[error("input of {size} bytes exceeds the capability limit of {max}")]
    InputTooLarge {
        /// Canonical input size in bytes.
        size: u64,
        /// The capability's limit.
        max: u64,
    },

    /// A top-level input key falls outside the allow list.
    #[error("input key '{key}' is not in the capability allow list")]
    InputKeyNotAllowed {
        /// The offending key.
        key: String,
    },

    /// A top-level input key appears on the deny list.
    #[error("input key '{key}' is denied by the capability")]
    InputKeyDenied {
        /// The offending key.
        key: String,
    },

    /// The capability carries a constraint key this agent does not know.
    #[error("unknown constraint key '{key}'")]
    UnknownConstraint {
        /// The unrecognized key.
        key: String,
    },

    /// The capability or its nonce was already used.
    #[error("capability replay detected")]
    Replay,

    /// The request input falls outside the canonical value grammar.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

impl Rejection {
    /// Returns the externally surfaced reason code for this rejection.
    #[must_use]
    pub const fn reason_code(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "MISSING_CREDENTIALS",
            Self::Malformed { .. } => "UNAUTHORIZED/MALFORMED",
            Self::BadSignature => "UNAUTHORIZED/BAD_SIGNATURE",
            Self::Audience { .. } => "UNAUTHORIZED/AUDIENCE",
            Self::Expired { .. } => "EXPIRED",
            Self::NotYetValid { .. } => "NOT_YET_VALID",
            Self::ToolMismatch { .. } => "UNAUTHORIZED/TOOL_MISMATCH",
            Self::ReadOnlyRequired => "UNAUTHORIZED/READ_ONLY",
            Self::InputTooLarge { .. } => "UNAUTHORIZED/INPUT_TOO_LARGE",
            Self::InputKeyNotAllowed { .. } => "UNAUTHORIZED/INPUT_KEY_NOT_ALLOWED",
            Self::InputKeyDenied { .. } => "UNAUTHORIZED/INPUT_KEY_DENIED",
            Self::UnknownConstraint { .. } => "UNAUTHORIZED/UNKNOWN_CONSTRAINT",
            Self::Replay => "REPLAY",
            Self::Canonical(_) => "CANONICAL_UNSUPPORTED",
        }
    }
}

/// Token header; `alg` and `typ` must match exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenHeader {
    alg: String,
    typ: String,
}

/// The claims carried by a capability payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CapabilityClaims {
    /// Opaque unique identifier for this capability.
    pub capability_id: String,
    /// Unix timestamp (seconds) the capability was minted.
    pub issued_at: u64,
    /// Unix timestamp (seconds) the capability stops being valid.
    pub expires_at: u64,
    /// The agent identity this capability is addressed to.
    pub audience: String,
    /// The agent identity the capability was delegated to.
    pub subject: String,
    /// Fully qualified tool name, possibly with single-segment wildcards.
    pub tool: String,
    /// Raw constraint mapping; evaluated fail-closed into [`Constraints`].
    pub constraints: Map<String, Value>,
    /// Unique nonce for replay protection.
    pub nonce: String,
}

/// Evaluated constraints from a verified capability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Constraints {
    /// The request must be marked read-only by the caller.
    pub read_only: bool,
    /// Upper bound on the canonicalized input size in bytes.
    pub max_input_bytes: Option<u64>,
    /// Top-level input keys must be a subset of this list.
    pub allow_input_keys: Option<Vec<String>>,
    /// Top-level input keys must be disjoint from this list.
    pub deny_input_keys: Option<Vec<String>>,
    /// The capability may authorize at most one transition across the log.
    pub one_shot: bool,
}

impl Constraints {
    /// Builds typed constraints from the raw token mapping.
    ///
    /// Unknown keys fail closed.
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::UnknownConstraint`] for unrecognized keys and
    /// [`Rejection::Malformed`] for recognized keys with the wrong type.
    pub fn from_raw(raw: &Map<String, Value>) -> Result<Self, Rejection> {
        let mut constraints = Self::default();

        for (key, value) in raw {
            match key.as_str() {
                "read_only" => {
                    constraints.read_only = constraint_bool(key, value)?;
                },
                "max_input_bytes" => {
                    constraints.max_input_bytes = Some(constraint_u64(key, value)?);
                },
                "allow_input_keys" => {
                    constraints.allow_input_keys = Some(constraint_string_list(key, value)?);
                },
                "deny_input_keys" => {
                    constraints.deny_input_keys = Some(constraint_string_list(key, value)?);
                },
                "one_shot" => {
                    constraints.one_shot = constraint_bool(key, value)?;
                },
                _ => {
                    return Err(Rejection::UnknownConstraint { key: key.clone() });
                },
            }
        }

        Ok(constraints)
    }

    /// Checks the constraints against a request.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint as a [`Rejection`].
    pub fn check_request(&self, ctx: &RequestContext) -> Result<(), Rejection> {
        if self.read_only && !ctx.read_only {
            return Err(Rejection::ReadOnlyRequired);
        }

        if let Some(max) = self.max_input_bytes {
            if ctx.canonical_input_len > max {
                return Err(Rejection::InputTooLarge {
                    size: ctx.canonical_input_len,
                    max,
                });
            }
        }

        // Key constraints apply to top-level keys; non-object inputs have
        // none
        let input_keys: Vec<&String> = match &ctx.input {
            Value::Object(map) => map.keys().collect(),
            _ => Vec::new(),
        };

        if let Some(allowed) = &self.allow_input_keys {
            for key in &input_keys {
                if !allowed.iter().any(|a| a == *key) {
                    return Err(Rejection::InputKeyNotAllowed {
                        key: (*key).clone(),
                    });
                }
            }
        }

        if let Some(denied) = &self.deny_input_keys {
            for key in &input_keys {
                if denied.iter().any(|d| d == *key) {
                    return Err(Rejection::InputKeyDenied {
                        key: (*key).clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// The request being authorized.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Fully qualified tool name the agent wants to invoke.
    pub tool: String,
    /// The structured tool input.
    pub input: Value,
    /// Canonical input size in bytes, computed by the caller.
    pub canonical_input_len: u64,
    /// Whether the caller marked the request read-only.
    pub read_only: bool,
}

/// Probe for replay state consulted as the final verification step.
///
/// Implementations must fail closed: when the underlying state cannot be
/// read, report a conflict rather than letting the token through.
pub trait ReplayIndex: Send + Sync {
    /// Returns `true` if this capability already produced an AUTHORIZED
    /// record anywhere in the log.
    fn capability_authorized(&self, capability_hash: &Hash) -> bool;

    /// Returns `true` if the nonce was already seen from a different
    /// capability inside its issuance window.
    fn nonce_conflicts(&self, nonce: &str, capability_hash: &Hash) -> bool;
}

/// A capability that passed every check.
#[derive(Debug, Clone)]
pub struct VerifiedCapability {
    /// The verified claims.
    pub claims: CapabilityClaims,
    /// The evaluated constraints.
    pub constraints: Constraints,
    /// The canonical payload bytes the hash and signature cover.
    pub canonical_payload: Vec<u8>,
    /// SHA-256 of the canonical payload.
    pub capability_hash: Hash,
}

impl VerifiedCapability {
    /// Re-checks an already-verified capability against a new request.
    ///
    /// This is the warm path for repeat calls under one authorization: the
    /// signature is not re-verified, but expiry, tool match and constraints
    /// are evaluated against the incoming request. Replay remains the
    /// caller's final check.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] in check order.
    pub fn check_request(&self, ctx: &RequestContext, now_secs: u64) -> Result<(), Rejection> {
        if now_secs >= self.claims.expires_at {
            return Err(Rejection::Expired {
                expires_at: self.claims.expires_at,
                now: now_secs,
            });
        }

        if !tool_matches(&self.claims.tool, &ctx.tool) {
            return Err(Rejection::ToolMismatch {
                granted: self.claims.tool.clone(),
                requested: ctx.tool.clone(),
            });
        }

        self.constraints.check_request(ctx)
    }
}

/// Configuration for the capability verifier.
///
/// The Supervisor public key flows in explicitly at construction; there is
/// no process-wide key slot.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// The Supervisor's Ed25519 public key, provisioned out of band.
    pub supervisor_key: VerifyingKey,
    /// This agent's identity; token audiences must match it.
    pub identity: String,
    /// Tolerated clock skew on `issued_at`.
    pub clock_skew: Duration,
}

/// Verifies capability tokens against the configured Supervisor key.
#[derive(Debug, Clone)]
pub struct CapabilityVerifier {
    config: VerifierConfig,
}

impl CapabilityVerifier {
    /// Creates a verifier from its configuration.
    #[must_use]
    pub const fn new(config: VerifierConfig) -> Self {
        Self { config }
    }

    /// Returns the configured agent identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.config.identity
    }

    /// Verifies a token against a request, first failure wins.
    ///
    /// `now_secs` is the single evaluation time for the temporal window;
    /// callers re-invoke with a fresh timestamp if a transition waited past
    /// the capability's expiry.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] in check order.
    pub fn verify(
        &self,
        token: &[u8],
        ctx: &RequestContext,
        now_secs: u64,
        replay: &dyn ReplayIndex,
    ) -> Result<VerifiedCapability, Rejection> {
        if token.is_empty() {
            return Err(Rejection::MissingCredentials);
        }

        let (claims, canonical_payload) = self.parse_and_verify_signature(token)?;

        // Audience binding, compared in constant time
        let audience_matches: bool = claims
            .audience
            .as_bytes()
            .ct_eq(self.config.identity.as_bytes())
            .into();
        if !audience_matches {
            return Err(Rejection::Audience {
                audience: claims.audience.clone(),
            });
        }

        // Temporal window: now must fall in [issued_at - skew, expires_at)
        let skew = self.config.clock_skew.as_secs();
        if now_secs.saturating_add(skew) < claims.issued_at {
            return Err(Rejection::NotYetValid {
                issued_at: claims.issued_at,
                now: now_secs,
            });
        }
        if now_secs >= claims.expires_at {
            return Err(Rejection::Expired {
                expires_at: claims.expires_at,
                now: now_secs,
            });
        }

        if !tool_matches(&claims.tool, &ctx.tool) {
            return Err(Rejection::ToolMismatch {
                granted: claims.tool.clone(),
                requested: ctx.tool.clone(),
            });
        }

        let constraints = Constraints::from_raw(&claims.constraints)?;
        constraints.check_request(ctx)?;

        let capability_hash = chain::digest_bytes(&canonical_payload);
        if constraints.one_shot {
            if replay.capability_authorized(&capability_hash) {
                return Err(Rejection::Replay);
            }
        } else if replay.nonce_conflicts(&claims.nonce, &capability_hash) {
            return Err(Rejection::Replay);
        }

        Ok(VerifiedCapability {
            claims,
            constraints,
            canonical_payload,
            capability_hash,
        })
    }

    /// Structural parse and signature verification (checks 1 and 2).
    fn parse_and_verify_signature(
        &self,
        token: &[u8],
    ) -> Result<(CapabilityClaims, Vec<u8>), Rejection> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(Rejection::Malformed {
                detail: format!("token exceeds {MAX_TOKEN_LEN} bytes"),
            });
        }

        let text = std::str::from_utf8(token).map_err(|_| Rejection::Malformed {
            detail: "token is not UTF-8".to_string(),
        })?;

        let mut segments = text.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(Rejection::Malformed {
                detail: "token must have exactly three segments".to_string(),
            });
        };

        let header_bytes =
            URL_SAFE_NO_PAD
                .decode(header_b64)
                .map_err(|_| Rejection::Malformed {
                    detail: "header is not base64url".to_string(),
                })?;
        let header: TokenHeader =
            serde_json::from_slice(&header_bytes).map_err(|e| Rejection::Malformed {
                detail: format!("header does not decode: {e}"),
            })?;

        // Exact algorithm match before any signature work; no substitution
        if header.alg != TOKEN_ALG {
            return Err(Rejection::Malformed {
                detail: format!("unsupported algorithm '{}'", header.alg),
            });
        }
        if header.typ != TOKEN_TYP {
            return Err(Rejection::Malformed {
                detail: format!("unsupported token type '{}'", header.typ),
            });
        }

        let payload_bytes =
            URL_SAFE_NO_PAD
                .decode(payload_b64)
                .map_err(|_| Rejection::Malformed {
                    detail: "payload is not base64url".to_string(),
                })?;
        let signature_bytes =
            URL_SAFE_NO_PAD
                .decode(signature_b64)
                .map_err(|_| Rejection::Malformed {
                    detail: "signature is not base64url".to_string(),
                })?;
        let signature =
            Signature::from_slice(&signature_bytes).map_err(|_| Rejection::Malformed {
                detail: "signature is not 64 bytes".to_string(),
            })?;

        // Signing input: first two segments joined by a dot, as received
        let signing_input = format!("{header_b64}.{payload_b64}");
        self.config
            .supervisor_key
            .verify_strict(signing_input.as_bytes(), &signature)
            .map_err(|_| Rejection::BadSignature)?;

        // The payload must already be canonical; re-canonicalize and require
        // a byte-for-byte match so the capability hash is unambiguous
        let payload_text = std::str::from_utf8(&payload_bytes).map_err(|_| Rejection::Malformed {
            detail: "payload is not UTF-8".to_string(),
        })?;
        let payload_value =
            canonical::parse_canonical(payload_text).map_err(|e| Rejection::Malformed {
                detail: format!("payload does not canonicalize: {e}"),
            })?;
        let canonical_payload =
            canonical::canonical_bytes(&payload_value).map_err(|e| Rejection::Malformed {
                detail: format!("payload does not canonicalize: {e}"),
            })?;
        if canonical_payload != payload_bytes {
            return Err(Rejection::Malformed {
                detail: "payload is not in canonical form".to_string(),
            });
        }

        let claims: CapabilityClaims =
            serde_json::from_value(payload_value).map_err(|e| Rejection::Malformed {
                detail: format!("payload does not decode: {e}"),
            })?;

        Ok((claims, canonical_payload))
    }
}

/// Matches a requested tool against the granted pattern.
///
/// Patterns are dot-separated; a `*` segment matches exactly one request
/// segment. Segment counts must agree, so `fs.*` covers `fs.read` but not
/// `fs.read.meta`.
#[must_use]
pub fn tool_matches(granted: &str, requested: &str) -> bool {
    let granted_segments: Vec<&str> = granted.split('.').collect();
    let requested_segments: Vec<&str> = requested.split('.').collect();

    if granted_segments.len() != requested_segments.len() {
        return false;
    }

    granted_segments
        .iter()
        .zip(&requested_segments)
        .all(|(g, r)| *g == "*" || g == r)
}

fn constraint_bool(key: &str, value: &Value) -> Result<bool, Rejection> {
    value.as_bool().ok_or_else(|| Rejection::Malformed {
        detail: format!("constraint '{key}' must be a boolean"),
    })
}

fn constraint_u64(key: &str, value: &Value) -> Result<u64, Rejection> {
    value.as_u64().ok_or_else(|| Rejection::Malformed {
        detail: format!("constraint '{key}' must be a non-negative integer"),
    })
}

fn constraint_string_list(key: &str, value: &Value) -> Result<Vec<String>, Rejection> {
    let items = value.as_array().ok_or_else(|| Rejection::Malformed {
        detail: format!("constraint '{key}' must be a list of strings"),
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(ToString::to_string)
                .ok_or_else(|| Rejection::Malformed {
                    detail: format!("constraint '{key}' must be a list of strings"),
                })
        })
        .collect()
}
