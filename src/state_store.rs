//! Short-lived, single-use login state.
//!
//! Every login launch deposits a [`PendingAuthState`] here under a random
//! opaque id; the OAuth callback consumes it exactly once. The atomic
//! check-and-delete is the authoritative CSRF/replay defense — a second
//! callback carrying the same `state` always fails, whatever the UI does.
//!
//! The store also tracks authorization codes it has started exchanging, so a
//! duplicated callback invocation (a re-fired client effect, a double click)
//! can never trigger a second token exchange for the same single-use code.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Error;
use crate::pkce;
use crate::types::{PendingAuthState, Role, now_ms};

const STATE_ID_BYTES: usize = 32;

/// In-memory store of pending logins and in-flight authorization codes.
pub struct StateStore {
    ttl_ms: i64,
    inner: Mutex<Inner>,
}

struct Inner {
    pending: HashMap<String, PendingAuthState>,
    // code -> first-seen timestamp, same TTL as pending states
    seen_codes: HashMap<String, i64>,
}

impl StateStore {
    /// Store with the given record TTL in milliseconds.
    #[must_use]
    pub fn new(ttl_ms: i64) -> Self {
        Self {
            ttl_ms,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                seen_codes: HashMap::new(),
            }),
        }
    }

    /// Deposit a pending login and return its opaque state id.
    pub fn create(
        &self,
        issuer: impl Into<String>,
        role: Role,
        code_verifier: impl Into<String>,
        token_endpoint: impl Into<String>,
        revocation_endpoint: Option<String>,
    ) -> String {
        let state_id = pkce::random_token(STATE_ID_BYTES);
        let record = PendingAuthState {
            issuer: issuer.into(),
            role,
            code_verifier: code_verifier.into(),
            token_endpoint: token_endpoint.into(),
            revocation_endpoint,
            created_at_ms: now_ms(),
        };
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        Self::purge(&mut inner, record.created_at_ms, self.ttl_ms);
        inner.pending.insert(state_id.clone(), record);
        state_id
    }

    /// Atomically look up and delete a pending login.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateNotFound`] when the id is unknown, expired, or
    /// already consumed. At most one caller can ever succeed for a given id.
    pub fn retrieve_and_invalidate(&self, state_id: &str) -> Result<PendingAuthState, Error> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        Self::purge(&mut inner, now, self.ttl_ms);
        inner.pending.remove(state_id).ok_or(Error::StateNotFound)
    }

    /// Non-invalidating issuer lookup for the callback error branch.
    ///
    /// The error branch only needs the trusted issuer to validate an
    /// `error_uri`; consuming the record here would break a still-valid
    /// parallel flow.
    #[must_use]
    pub fn peek_issuer(&self, state_id: &str) -> Option<String> {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        Self::purge(&mut inner, now, self.ttl_ms);
        inner.pending.get(state_id).map(|p| p.issuer.clone())
    }

    /// Mark an authorization code as being exchanged.
    ///
    /// Returns `false` when the code was already submitted; the caller must
    /// not attempt a second exchange. Secondary guard behind the state-id
    /// invalidation above.
    pub fn begin_code_exchange(&self, code: &str) -> bool {
        let now = now_ms();
        let mut inner = self.inner.lock().expect("state store lock poisoned");
        Self::purge(&mut inner, now, self.ttl_ms);
        inner.seen_codes.insert(code.to_owned(), now).is_none()
    }

    // A record aged exactly ttl_ms is already dead, so a zero TTL means
    // instantly expired.
    fn purge(inner: &mut Inner, now: i64, ttl_ms: i64) {
        inner.pending.retain(|_, p| now - p.created_at_ms < ttl_ms);
        inner.seen_codes.retain(|_, seen| now - *seen < ttl_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StateStore {
        StateStore::new(10 * 60 * 1000)
    }

    fn put(store: &StateStore) -> String {
        store.create(
            "https://fhir.example.org",
            Role::Patient,
            "verifier-1",
            "https://fhir.example.org/oauth/token",
            None,
        )
    }

    #[test]
    fn test_retrieve_succeeds_at_most_once() {
        let store = store();
        let id = put(&store);

        let first = store.retrieve_and_invalidate(&id).unwrap();
        assert_eq!(first.issuer, "https://fhir.example.org");
        assert_eq!(first.role, Role::Patient);
        assert_eq!(first.code_verifier, "verifier-1");

        assert!(matches!(
            store.retrieve_and_invalidate(&id),
            Err(Error::StateNotFound)
        ));
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        assert!(matches!(
            store().retrieve_and_invalidate("nope"),
            Err(Error::StateNotFound)
        ));
    }

    #[test]
    fn test_expired_records_are_gone() {
        let store = StateStore::new(0);
        let id = put(&store);
        assert!(matches!(
            store.retrieve_and_invalidate(&id),
            Err(Error::StateNotFound)
        ));
    }

    #[test]
    fn test_state_ids_are_opaque_and_unique() {
        let store = store();
        let a = put(&store);
        let b = put(&store);
        assert_ne!(a, b);
        assert!(a.len() >= 40);
    }

    #[test]
    fn test_peek_does_not_invalidate() {
        let store = store();
        let id = put(&store);
        assert_eq!(
            store.peek_issuer(&id).as_deref(),
            Some("https://fhir.example.org")
        );
        // Still consumable after the peek.
        assert!(store.retrieve_and_invalidate(&id).is_ok());
        assert!(store.peek_issuer(&id).is_none());
    }

    #[test]
    fn test_code_exchange_gate_fires_once() {
        let store = store();
        assert!(store.begin_code_exchange("code-xyz"));
        assert!(!store.begin_code_exchange("code-xyz"));
        assert!(store.begin_code_exchange("another-code"));
    }

    #[test]
    fn test_concurrent_consumers_see_exactly_one_winner() {
        use std::sync::Arc;

        let store = Arc::new(store());
        let id = put(&store);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                store.retrieve_and_invalidate(&id).is_ok()
            }));
        }
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(wins, 1);
    }
}
