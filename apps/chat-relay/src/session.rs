use rand::RngCore;
use tracing::{debug, info};

use crate::error::StoreResult;
use crate::storage::SessionStore;

const SESSION_ID_BYTES: usize = 16;

/// Generate a new session ID: 128 random bits, lowercase hex.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Whether `candidate` could have been issued by [`generate_session_id`].
pub fn is_well_formed(candidate: &str) -> bool {
    candidate.len() == SESSION_ID_BYTES * 2 && candidate.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub session_id: String,
    /// The requested id was still active and has been reused.
    pub reused: bool,
}

/// Decides which session an incoming connection belongs to.
#[derive(Clone)]
pub struct SessionResolver {
    sessions: SessionStore,
}

impl SessionResolver {
    pub fn new(sessions: SessionStore) -> Self {
        Self { sessions }
    }

    pub async fn resolve(
        &self,
        resource_id: &str,
        requested: Option<&str>,
    ) -> StoreResult<Resolution> {
        if let Some(candidate) = requested.map(str::trim).filter(|id| !id.is_empty()) {
            if !is_well_formed(candidate) {
                debug!(%resource_id, "ignoring malformed session id");
            } else if self.sessions.is_active(candidate).await? {
                return Ok(Resolution {
                    session_id: candidate.to_string(),
                    reused: true,
                });
            } else {
                debug!(%resource_id, session_id = %candidate, "requested session is not active");
            }
        }

        let session_id = generate_session_id();
        self.sessions
            .bind_connection(&session_id, resource_id)
            .await?;
        info!(%resource_id, session_id = %session_id, "new session created");
        Ok(Resolution {
            session_id,
            reused: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Keyspace;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn resolver() -> (MemoryStore, SessionStore, SessionResolver) {
        let store = MemoryStore::new();
        let sessions = SessionStore::new(Arc::new(store.clone()), Keyspace::default());
        (store, sessions.clone(), SessionResolver::new(sessions))
    }

    #[test_timeout::timeout]
    fn test_session_id_generation() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.len(), 32);
        assert!(is_well_formed(&id1));
    }

    #[test_timeout::timeout]
    fn rejects_ids_of_the_wrong_shape() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("abc"));
        assert!(!is_well_formed(&"g".repeat(32)));
        assert!(!is_well_formed(&"a".repeat(33)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn issues_and_binds_a_fresh_session() {
        let (_, sessions, resolver) = resolver();
        let resolution = resolver.resolve("5", None).await.unwrap();
        assert!(!resolution.reused);
        assert!(is_well_formed(&resolution.session_id));
        assert_eq!(
            sessions
                .bound_connection(&resolution.session_id)
                .await
                .unwrap()
                .as_deref(),
            Some("5")
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn reuses_an_active_session() {
        let (_, sessions, resolver) = resolver();
        let existing = generate_session_id();
        sessions.touch(&existing).await.unwrap();

        let resolution = resolver.resolve("9", Some(&existing)).await.unwrap();
        assert_eq!(resolution.session_id, existing);
        assert!(resolution.reused);
    }

    #[test_timeout::tokio_timeout_test]
    async fn replaces_unknown_or_blank_sessions() {
        let (_, _, resolver) = resolver();
        let unknown = generate_session_id();
        for requested in [Some(unknown.as_str()), Some(""), Some("nope")] {
            let resolution = resolver.resolve("1", requested).await.unwrap();
            assert!(!resolution.reused);
            assert_ne!(Some(resolution.session_id.as_str()), requested);
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn store_outage_refuses_admission() {
        let (store, _, resolver) = resolver();
        store.set_unavailable(true);
        let result = resolver.resolve("1", None).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
