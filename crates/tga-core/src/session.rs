//! In-memory cache of verified capabilities keyed by session handles.
//!
//! The cache is the warm path for repeat calls under one authorization: a
//! hit skips token parsing and signature verification. It is purely an
//! optimization; every state transition still writes to the log, a miss
//! falls back to full verification, and nothing is rebuilt from it after a
//! restart.
//!
//! Entries are evicted in insertion order when the cache is full, on expiry
//! at lookup time, and all at once when the Supervisor key rotates.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio::sync::RwLock;
use tracing::trace;

use crate::capability::VerifiedCapability;

/// Default maximum number of cached sessions.
pub const DEFAULT_SESSION_CACHE_CAPACITY: usize = 1024;

/// Length of the random session identifier in bytes (128 bits).
pub const SESSION_ID_LEN: usize = 16;

/// Generates a fresh 128-bit random session identifier.
#[must_use]
pub fn generate_session_id() -> String {
    let bytes: [u8; SESSION_ID_LEN] = rand::random();
    URL_SAFE_NO_PAD.encode(bytes)
}

struct CacheEntry {
    capability: Arc<VerifiedCapability>,
    expires_at: u64,
    inserted_seq: u64,
}

/// Insertion-order entry; `inserted_seq` detects stale queue entries whose
/// key was already removed and re-inserted.
struct OrderEntry {
    session_id: String,
    inserted_seq: u64,
}

struct Inner {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<OrderEntry>,
    next_seq: u64,
}

/// Bounded cache mapping session handles to verified capabilities.
///
/// Internally synchronized; reads are concurrent and writes take a short
/// exclusive section.
pub struct SessionCache {
    capacity: usize,
    inner: RwLock<Inner>,
}

impl SessionCache {
    /// Creates a cache holding at most `capacity` sessions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_seq: 0,
            }),
        }
    }

    /// Creates a cache with the default capacity.
    #[must_use]
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_SESSION_CACHE_CAPACITY)
    }

    /// Returns the number of cached sessions.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    /// Returns `true` if the cache holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Inserts a verified capability under a freshly generated session id.
    ///
    /// Evicts the oldest entries when the cache is full. Returns the new
    /// session id.
    pub async fn insert(&self, capability: Arc<VerifiedCapability>) -> String {
        let session_id = generate_session_id();
        self.insert_with_id(session_id.clone(), capability).await;
        session_id
    }

    /// Inserts a verified capability under a caller-supplied session id.
    ///
    /// Used when the id must match a persisted session binding.
    pub async fn insert_with_id(&self, session_id: String, capability: Arc<VerifiedCapability>) {
        let expires_at = capability.claims.expires_at;

        let mut inner = self.inner.write().await;
        inner.next_seq += 1;
        let inserted_seq = inner.next_seq;

        while inner.entries.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            // Skip stale queue entries left behind by earlier removals
            let live = inner
                .entries
                .get(&oldest.session_id)
                .is_some_and(|e| e.inserted_seq == oldest.inserted_seq);
            if live {
                inner.entries.remove(&oldest.session_id);
                trace!(session_id = %oldest.session_id, "evicted session at capacity");
            }
        }

        inner.entries.insert(
            session_id.clone(),
            CacheEntry {
                capability,
                expires_at,
                inserted_seq,
            },
        );
        inner.order.push_back(OrderEntry {
            session_id,
            inserted_seq,
        });
    }

    /// Looks up a session, returning the capability only while it is still
    /// valid at `now_secs`.
    ///
    /// Expired entries are evicted and reported as a miss.
    pub async fn get(&self, session_id: &str, now_secs: u64) -> Option<Arc<VerifiedCapability>> {
        let mut inner = self.inner.write().await;
        let entry = inner.entries.get(session_id)?;

        if now_secs >= entry.expires_at {
            inner.entries.remove(session_id);
            trace!(session_id = %session_id, "evicted expired session");
            return None;
        }

        Some(Arc::clone(&inner.entries[session_id].capability))
    }

    /// Drops every cached session.
    ///
    /// Called on Supervisor key rotation; sessions do not survive it.
    pub async fn flush(&self) {
        let mut inner = self.inner.write().await;
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer as _, SigningKey};
    use serde_json::json;

    use super::*;
    use crate::capability::{
        CapabilityVerifier, ReplayIndex, RequestContext, VerifierConfig, DEFAULT_CLOCK_SKEW,
        TOKEN_ALG, TOKEN_TYP,
    };
    use crate::canonical;
    use crate::chain::Hash;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    const NOW: u64 = 1_700_000_000;

    struct NoReplay;

    impl ReplayIndex for NoReplay {
        fn capability_authorized(&self, _capability_hash: &Hash) -> bool {
            false
        }

        fn nonce_conflicts(&self, _nonce: &str, _capability_hash: &Hash) -> bool {
            false
        }
    }

    fn verified_capability(expires_at: u64, nonce: &str) -> Arc<VerifiedCapability> {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let payload = json!({
            "audience": "tga-1",
            "capability_id": format!("cap-{nonce}"),
            "constraints": {},
            "expires_at": expires_at,
            "issued_at": NOW,
            "nonce": nonce,
            "subject": "agent-7",
            "tool": "fs.read",
        });
        let header_b64 = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&json!({"alg": TOKEN_ALG, "typ": TOKEN_TYP})).unwrap());
        let payload_b64 = URL_SAFE_NO_PAD.encode(canonical::canonical_bytes(&payload).unwrap());
        let signing_input = format!("{header_b64}.{payload_b64}");
        let signature = key.sign(signing_input.as_bytes());
        let token = format!(
            "{header_b64}.{payload_b64}.{}",
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        );

        let verifier = CapabilityVerifier::new(VerifierConfig {
            supervisor_key: key.verifying_key(),
            identity: "tga-1".to_string(),
            clock_skew: DEFAULT_CLOCK_SKEW,
        });
        let ctx = RequestContext {
            tool: "fs.read".to_string(),
            input: json!({}),
            canonical_input_len: 2,
            read_only: false,
        };
        Arc::new(verifier.verify(token.as_bytes(), &ctx, NOW, &NoReplay).unwrap())
    }

    #[tokio::test]
    async fn test_session_id_is_unique_and_unpadded() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
        assert!(!a.contains('='));
        // 16 bytes -> 22 base64url characters
        assert_eq!(a.len(), 22);
    }

    #[tokio::test]
    async fn test_insert_then_get() {
        let cache = SessionCache::with_default_capacity();
        let capability = verified_capability(NOW + 60, "n1");

        let session_id = cache.insert(Arc::clone(&capability)).await;
        let hit = cache.get(&session_id, NOW).await.unwrap();
        assert_eq!(hit.capability_hash, capability.capability_hash);
    }

    #[tokio::test]
    async fn test_unknown_session_misses() {
        let cache = SessionCache::with_default_capacity();
        assert!(cache.get("no-such-session", NOW).await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_evicted_on_lookup() {
        let cache = SessionCache::with_default_capacity();
        let session_id = cache.insert(verified_capability(NOW + 10, "n1")).await;

        assert!(cache.get(&session_id, NOW + 10).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = SessionCache::new(2);
        let first = cache.insert(verified_capability(NOW + 60, "n1")).await;
        let second = cache.insert(verified_capability(NOW + 60, "n2")).await;
        let third = cache.insert(verified_capability(NOW + 60, "n3")).await;

        assert!(cache.get(&first, NOW).await.is_none());
        assert!(cache.get(&second, NOW).await.is_some());
        assert!(cache.get(&third, NOW).await.is_some());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let cache = SessionCache::with_default_capacity();
        let a = cache.insert(verified_capability(NOW + 60, "n1")).await;
        let b = cache.insert(verified_capability(NOW + 60, "n2")).await;

        cache.flush().await;

        assert!(cache.get(&a, NOW).await.is_none());
        assert!(cache.get(&b, NOW).await.is_none());
        assert!(cache.is_empty().await);
    }
}
