//! Agent configuration from the environment.
//!
//! The configuration is constructed once at startup and flows into the
//! verifier and store explicitly; there is no process-wide mutable state.
//! The Supervisor public key is provisioned out of band as a PEM-encoded
//! Ed25519 public key and is required: an agent without it cannot verify
//! anything and must not start.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::session::DEFAULT_SESSION_CACHE_CAPACITY;

/// Environment variable carrying this agent's identity (token audience).
pub const ENV_IDENTITY: &str = "TGA_IDENTITY";

/// Environment variable carrying the PEM-encoded Supervisor public key.
pub const ENV_SUPERVISOR_PUBLIC_KEY: &str = "TGA_SUPERVISOR_PUBLIC_KEY";

/// Environment variable carrying the absolute state store path.
pub const ENV_DB_PATH: &str = "TGA_DB_PATH";

/// Environment variable overriding the tolerated clock skew in seconds.
pub const ENV_CLOCK_SKEW_SECONDS: &str = "TGA_CLOCK_SKEW_SECONDS";

/// Environment variable overriding the session cache capacity.
pub const ENV_SESSION_CACHE_SIZE: &str = "TGA_SESSION_CACHE_SIZE";

/// Default tolerated clock skew in seconds.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 5;

/// Errors raised while reading configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A required environment variable is absent.
    #[error("missing required environment variable {name}")]
    MissingVar {
        /// The variable name.
        name: &'static str,
    },

    /// An environment variable holds a value that does not parse.
    #[error("invalid value for {name}: {reason}")]
    InvalidVar {
        /// The variable name.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The Supervisor public key does not decode as PEM Ed25519.
    #[error("supervisor public key does not decode: {reason}")]
    InvalidKey {
        /// Why the key was rejected.
        reason: String,
    },

    /// The state store path is not absolute.
    #[error("state store path must be absolute, got {path}")]
    RelativeDbPath {
        /// The rejected path.
        path: String,
    },
}

/// Startup configuration for the governance agent.
#[derive(Debug, Clone)]
pub struct GovernanceConfig {
    /// This agent's identity; token audiences must match it.
    pub identity: String,
    /// The Supervisor's Ed25519 public key.
    pub supervisor_key: VerifyingKey,
    /// Absolute path of the state store file.
    pub db_path: PathBuf,
    /// Tolerated clock skew on capability `issued_at` checks.
    pub clock_skew: Duration,
    /// Maximum number of cached sessions.
    pub session_cache_size: usize,
}

impl GovernanceConfig {
    /// Reads the configuration from `TGA_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or any
    /// value does not parse. A missing Supervisor key is an error here, not
    /// a warning: startup must fail closed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let identity = require_var(ENV_IDENTITY)?;

        let key_pem = require_var(ENV_SUPERVISOR_PUBLIC_KEY)?;
        let supervisor_key = parse_supervisor_key(&key_pem)?;

        let db_path = PathBuf::from(require_var(ENV_DB_PATH)?);
        if !db_path.is_absolute() {
            return Err(ConfigError::RelativeDbPath {
                path: db_path.display().to_string(),
            });
        }

        let clock_skew = Duration::from_secs(parse_var_or(
            ENV_CLOCK_SKEW_SECONDS,
            DEFAULT_CLOCK_SKEW_SECONDS,
        )?);

        let session_cache_size =
            parse_var_or(ENV_SESSION_CACHE_SIZE, DEFAULT_SESSION_CACHE_CAPACITY as u64)?;
        let session_cache_size = usize::try_from(session_cache_size).map_err(|_| {
            ConfigError::InvalidVar {
                name: ENV_SESSION_CACHE_SIZE,
                reason: "value does not fit in usize".to_string(),
            }
        })?;

        Ok(Self {
            identity,
            supervisor_key,
            db_path,
            clock_skew,
            session_cache_size,
        })
    }
}

/// Decodes a PEM-encoded Ed25519 public key.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidKey`] if the PEM does not decode to an
/// Ed25519 public key.
pub fn parse_supervisor_key(pem: &str) -> Result<VerifyingKey, ConfigError> {
    VerifyingKey::from_public_key_pem(pem).map_err(|e| ConfigError::InvalidKey {
        reason: e.to_string(),
    })
}

fn require_var(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        Ok(_) | Err(env::VarError::NotPresent) => Err(ConfigError::MissingVar { name }),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}

fn parse_var_or(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidVar {
            name,
            reason: format!("'{value}' is not a non-negative integer"),
        }),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidVar {
            name,
            reason: "value is not valid unicode".to_string(),
        }),
    }
}
