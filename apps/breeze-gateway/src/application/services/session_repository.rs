//! Session repository: the credential store behind the session cache.
//!
//! Every component resolves sessions through here so cache reads,
//! write-through updates and invalidation stay consistent.

use std::sync::Arc;

use crate::application::ports::CredentialStore;
use crate::domain::session::{BrokerSession, UserId};
use crate::error::GatewayResult;
use crate::infrastructure::cache::SessionCache;

/// Cache-fronted access to session rows.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn CredentialStore>,
    cache: Arc<SessionCache>,
}

impl std::fmt::Debug for SessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepository")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl SessionRepository {
    /// Create a repository.
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, cache: Arc<SessionCache>) -> Self {
        Self { store, cache }
    }

    /// Shared cache (for maintenance).
    #[must_use]
    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    /// Resolve a session: cache first, then the store (repopulating the cache).
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn resolve(&self, user_id: &UserId) -> GatewayResult<Option<BrokerSession>> {
        if let Some(session) = self.cache.get(user_id) {
            return Ok(Some(session));
        }

        let session = self.store.get(user_id).await?;
        if let Some(session) = &session {
            self.cache.insert(session.clone());
        }
        Ok(session)
    }

    /// Read the authoritative row, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn load_fresh(&self, user_id: &UserId) -> GatewayResult<Option<BrokerSession>> {
        let session = self.store.get(user_id).await?;
        match &session {
            Some(session) => self.cache.insert(session.clone()),
            None => self.cache.evict(user_id),
        }
        Ok(session)
    }

    /// Write the row and overwrite the cache entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures; the cache entry is evicted in that case.
    pub async fn save(&self, session: &BrokerSession) -> GatewayResult<()> {
        if let Err(err) = self.store.put(session).await {
            self.cache.evict(&session.user_id);
            return Err(err);
        }
        self.cache.insert(session.clone());
        Ok(())
    }

    /// Clear the token in the store and evict the cache entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures. The cache entry is evicted either way.
    pub async fn invalidate(&self, user_id: &UserId) -> GatewayResult<()> {
        let result = self.store.invalidate(user_id).await;
        self.cache.evict(user_id);
        if result.is_ok() {
            tracing::info!(user_id = %user_id, "Broker session invalidated");
        }
        result
    }

    /// Remove the row and its cache entry.
    ///
    /// # Errors
    ///
    /// Propagates store failures.
    pub async fn delete(&self, user_id: &UserId) -> GatewayResult<()> {
        let result = self.store.delete(user_id).await;
        self.cache.evict(user_id);
        result
    }
}
