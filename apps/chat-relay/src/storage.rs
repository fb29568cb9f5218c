use std::collections::HashMap;

use chrono::Utc;

use crate::config::Keyspace;
use crate::error::StoreResult;
use crate::store::StoreHandle;

/// Typed access to the three session tables. Each method is a single store
/// call; composing them is up to the caller.
#[derive(Clone)]
pub struct SessionStore {
    store: StoreHandle,
    keys: Keyspace,
}

impl SessionStore {
    pub fn new(store: StoreHandle, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub async fn bind_connection(&self, session_id: &str, resource_id: &str) -> StoreResult<()> {
        self.store
            .hset(&self.keys.sessions, session_id, resource_id)
            .await
    }

    pub async fn bound_connection(&self, session_id: &str) -> StoreResult<Option<String>> {
        self.store.hget(&self.keys.sessions, session_id).await
    }

    pub async fn remove_binding(&self, session_id: &str) -> StoreResult<()> {
        self.store.hdel(&self.keys.sessions, session_id).await
    }

    pub async fn set_display_name(&self, session_id: &str, name: &str) -> StoreResult<()> {
        self.store.hset(&self.keys.users, session_id, name).await
    }

    pub async fn display_name(&self, session_id: &str) -> StoreResult<Option<String>> {
        self.store.hget(&self.keys.users, session_id).await
    }

    pub async fn remove_display_name(&self, session_id: &str) -> StoreResult<()> {
        self.store.hdel(&self.keys.users, session_id).await
    }

    pub async fn is_active(&self, session_id: &str) -> StoreResult<bool> {
        self.store
            .hexists(&self.keys.active_sessions, session_id)
            .await
    }

    /// Record activity for the session at the current wall clock.
    pub async fn touch(&self, session_id: &str) -> StoreResult<()> {
        self.touch_at(session_id, Utc::now().timestamp()).await
    }

    pub async fn touch_at(&self, session_id: &str, unix_secs: i64) -> StoreResult<()> {
        self.store
            .hset(
                &self.keys.active_sessions,
                session_id,
                &unix_secs.to_string(),
            )
            .await
    }

    pub async fn remove_activity(&self, session_id: &str) -> StoreResult<()> {
        self.store
            .hdel(&self.keys.active_sessions, session_id)
            .await
    }

    /// Raw `session id -> last activity` pairs; values are left unparsed.
    pub async fn activity(&self) -> StoreResult<HashMap<String, String>> {
        self.store.hgetall(&self.keys.active_sessions).await
    }

    /// Drop the binding and display-name tables wholesale.
    pub async fn reset_tables(&self) -> StoreResult<()> {
        self.store.del(&self.keys.sessions).await?;
        self.store.del(&self.keys.users).await
    }
}
