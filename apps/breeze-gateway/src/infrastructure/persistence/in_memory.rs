//! In-memory credential store for development and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::application::ports::CredentialStore;
use crate::domain::session::{BrokerSession, UserId};
use crate::error::GatewayResult;

/// In-memory implementation of [`CredentialStore`].
///
/// Suitable for testing and development. Not for production use.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    sessions: RwLock<HashMap<UserId, BrokerSession>>,
}

impl InMemoryCredentialStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Add a row directly (for test setup).
    pub fn add(&self, session: BrokerSession) {
        self.sessions
            .write()
            .insert(session.user_id.clone(), session);
    }

    /// Read a row without going through the async port.
    #[must_use]
    pub fn snapshot(&self, user_id: &UserId) -> Option<BrokerSession> {
        self.sessions.read().get(user_id).cloned()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self, user_id: &UserId) -> GatewayResult<Option<BrokerSession>> {
        Ok(self.snapshot(user_id))
    }

    async fn put(&self, session: &BrokerSession) -> GatewayResult<()> {
        self.add(session.clone());
        Ok(())
    }

    async fn invalidate(&self, user_id: &UserId) -> GatewayResult<()> {
        if let Some(session) = self.sessions.write().get_mut(user_id) {
            session.clear_token();
        }
        Ok(())
    }

    async fn delete(&self, user_id: &UserId) -> GatewayResult<()> {
        self.sessions.write().remove(user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryCredentialStore::new();
        let user = UserId::new("u1");
        let session = BrokerSession::new(user.clone(), "key", "secret");

        store.put(&session).await.unwrap();
        assert_eq!(store.get(&user).await.unwrap(), Some(session));

        store.delete(&user).await.unwrap();
        assert_eq!(store.get(&user).await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn invalidate_keeps_credentials() {
        let store = InMemoryCredentialStore::new();
        let user = UserId::new("u1");
        store.add(BrokerSession::new(user.clone(), "key", "secret").with_token("tok", None));

        store.invalidate(&user).await.unwrap();

        let session = store.snapshot(&user).unwrap();
        assert_eq!(session.session_token, None);
        assert_eq!(session.expires_at, None);
        assert_eq!(session.api_key, "key");
    }

    #[tokio::test]
    async fn invalidate_missing_row_is_a_noop() {
        let store = InMemoryCredentialStore::new();
        store.invalidate(&UserId::new("ghost")).await.unwrap();
        assert_eq!(store.len(), 0);
    }
}
