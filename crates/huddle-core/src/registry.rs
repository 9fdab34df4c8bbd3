//! Connection registry for Huddle.
//!
//! Maps connection ids to live sessions. `add` and `remove` are the only
//! mutators; readers take snapshots and never hold a lock while sending.

use crate::session::{ClientSession, ConnectionId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No session for this connection.
    #[error("Session not found: {0}")]
    NotFound(ConnectionId),

    /// A session with this connection id is already registered.
    #[error("Session already registered: {0}")]
    Duplicate(ConnectionId),
}

/// Thread-safe map of live sessions.
#[derive(Debug, Default)]
pub struct Registry {
    sessions: DashMap<ConnectionId, Arc<ClientSession>>,
    /// Live session counter, kept beside the map for cheap reads.
    live: AtomicUsize,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    ///
    /// Returns the live session count after insertion.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] if the id is taken.
    pub fn add(&self, session: Arc<ClientSession>) -> Result<usize, RegistryError> {
        let id = session.id();
        match self.sessions.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(id)),
            Entry::Vacant(entry) => {
                entry.insert(session);
                let count = self.live.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(connection = %id, sessions = count, "Session registered");
                Ok(count)
            }
        }
    }

    /// Remove a session.
    ///
    /// Exactly one caller gets the session back for a given id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no session is registered.
    pub fn remove(&self, id: ConnectionId) -> Result<Arc<ClientSession>, RegistryError> {
        let (_, session) = self
            .sessions
            .remove(&id)
            .ok_or(RegistryError::NotFound(id))?;
        let count = self.live.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(connection = %id, sessions = count, "Session removed");
        Ok(session)
    }

    /// Look up a session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] if no session is registered.
    pub fn get(&self, id: ConnectionId) -> Result<Arc<ClientSession>, RegistryError> {
        self.sessions
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotFound(id))
    }

    /// Copy of all live sessions, ordered by connection id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|session| session.id());
        sessions
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Check if no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: u64) -> Arc<ClientSession> {
        let (session, _rx) = ClientSession::with_queue(ConnectionId::new(id), None, 4);
        Arc::new(session)
    }

    #[test]
    fn test_add_remove() {
        let registry = Registry::new();

        assert_eq!(registry.add(session(1)).unwrap(), 1);
        assert_eq!(registry.add(session(2)).unwrap(), 2);
        assert!(registry.get(ConnectionId::new(1)).is_ok());

        let removed = registry.remove(ConnectionId::new(1)).unwrap();
        assert_eq!(removed.id(), ConnectionId::new(1));
        assert_eq!(registry.len(), 1);

        assert_eq!(
            registry.remove(ConnectionId::new(1)).unwrap_err(),
            RegistryError::NotFound(ConnectionId::new(1))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_add() {
        let registry = Registry::new();
        registry.add(session(1)).unwrap();

        assert_eq!(
            registry.add(session(1)).unwrap_err(),
            RegistryError::Duplicate(ConnectionId::new(1))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_unknown() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get(ConnectionId::new(9)),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let registry = Registry::new();
        for id in [3, 1, 2] {
            registry.add(session(id)).unwrap();
        }

        let snapshot = registry.snapshot();
        let ids: Vec<u64> = snapshot.iter().map(|s| s.id().get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Mutating the registry does not affect an existing snapshot
        registry.remove(ConnectionId::new(2)).unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Arc::new(Registry::new());

        std::thread::scope(|scope| {
            for t in 0..8u64 {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    for i in 0..100u64 {
                        let id = t * 1000 + i;
                        registry.add(session(id)).unwrap();
                        if i % 2 == 0 {
                            registry.remove(ConnectionId::new(id)).unwrap();
                        }
                    }
                });
            }
        });

        assert_eq!(registry.len(), 8 * 50);
        assert_eq!(registry.snapshot().len(), 8 * 50);
    }
}
