//! Shared fixtures for the daemon integration tests: a Supervisor keypair,
//! token minting, an adjustable test clock and a runtime constructor that
//! goes through recovery the way startup does.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ed25519_dalek::{Signer as _, SigningKey};
use serde_json::{json, Value};

use tga_core::canonical;
use tga_core::capability::{CapabilityVerifier, VerifierConfig, DEFAULT_CLOCK_SKEW};
use tga_core::clock::Clock;
use tga_core::store::SqliteStateStore;
use tga_daemon::machine::{GovernanceRuntime, ToolCallRequest};
use tga_daemon::recovery;

/// Fixed evaluation time for the suite.
pub const NOW: u64 = 1_700_000_000;

/// This agent's identity; tokens are minted for this audience.
pub const IDENTITY: &str = "tga-1";

/// The Supervisor keypair used to mint test tokens.
pub fn supervisor_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

/// Clock whose seconds can be advanced mid-test.
pub struct TestClock {
    secs: AtomicU64,
}

impl TestClock {
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }

    fn now_ns(&self) -> u64 {
        self.now_secs() * 1_000_000_000
    }
}

/// Claims for a token expiring 60 seconds after [`NOW`].
pub fn default_claims(capability_id: &str, tool: &str, constraints: Value) -> Value {
    json!({
        "audience": IDENTITY,
        "capability_id": capability_id,
        "constraints": constraints,
        "expires_at": NOW + 60,
        "issued_at": NOW,
        "nonce": format!("nonce-{capability_id}"),
        "subject": "agent-7",
        "tool": tool,
    })
}

/// Mints a signed capability token for the given claims.
pub fn mint_token(payload: &Value) -> Vec<u8> {
    let header = json!({"alg": "Ed25519", "typ": "capability"});
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap());
    let payload_b64 = URL_SAFE_NO_PAD.encode(canonical::canonical_bytes(payload).unwrap());
    let signing_input = format!("{header_b64}.{payload_b64}");
    let signature = supervisor_key().sign(signing_input.as_bytes());
    format!(
        "{header_b64}.{payload_b64}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
    .into_bytes()
}

/// Builds a runtime over the store, running recovery first as startup does.
pub fn runtime_over(store: Arc<SqliteStateStore>, clock: Arc<TestClock>) -> GovernanceRuntime {
    let recovered = recovery::recover(store.as_ref(), clock.as_ref()).expect("recovery");
    let verifier = CapabilityVerifier::new(VerifierConfig {
        supervisor_key: supervisor_key().verifying_key(),
        identity: IDENTITY.to_string(),
        clock_skew: DEFAULT_CLOCK_SKEW,
    });
    GovernanceRuntime::new(store, verifier, 1024, recovered.traces, clock)
}

/// A plain request for the given tool.
pub fn request(tool: &str, input: Value) -> ToolCallRequest {
    ToolCallRequest {
        tool: tool.to_string(),
        input,
        read_only: false,
        deadline: None,
    }
}
