//! Session cache.
//!
//! TTL-bounded copy of session rows in front of the credential store. Reads
//! never touch I/O. Writers overwrite or evict in the same step as the
//! authoritative update so an invalidated session is never served.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::domain::session::{BrokerSession, UserId};

/// Default entry lifetime.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CacheEntry {
    session: BrokerSession,
    expires_at: Instant,
}

/// In-process session cache keyed by user.
#[derive(Debug)]
pub struct SessionCache {
    ttl: Duration,
    entries: RwLock<HashMap<UserId, CacheEntry>>,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionCache {
    /// Create a cache with the given entry lifetime.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached session, if present and not expired.
    #[must_use]
    pub fn get(&self, user_id: &UserId) -> Option<BrokerSession> {
        let now = Instant::now();
        self.entries
            .read()
            .get(user_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.session.clone())
    }

    /// Insert or overwrite the entry for the session's user.
    pub fn insert(&self, session: BrokerSession) {
        let entry = CacheEntry {
            expires_at: Instant::now() + self.ttl,
            session,
        };
        self.entries
            .write()
            .insert(entry.session.user_id.clone(), entry);
    }

    /// Drop the entry for `user_id`.
    pub fn evict(&self, user_id: &UserId) {
        self.entries.write().remove(user_id);
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    /// Number of entries, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
