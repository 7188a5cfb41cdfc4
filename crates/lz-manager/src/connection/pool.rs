//! Connection pool implementation

use dashmap::DashMap;
use std::sync::Arc;

use lz_core::{PeerAddr, PeerRole};

use super::session::Session;

/// Live sessions of one population, indexed by peer address.
///
/// Holds at most one session per address. A session stays in the pool
/// until its receive loop ends, so an entry may briefly be closed; use
/// [`ConnectionPool::get_open`] when a usable session is required.
pub struct ConnectionPool {
    role: PeerRole,
    sessions: DashMap<PeerAddr, Arc<Session>>,
}

impl ConnectionPool {
    /// Create a new empty connection pool
    pub fn new(role: PeerRole) -> Self {
        Self {
            role,
            sessions: DashMap::new(),
        }
    }

    /// Population this pool holds
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Insert a session, replacing any previous session for its address.
    ///
    /// A replaced session that is still open gets closed.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let previous = self.sessions.insert(session.addr(), Arc::clone(&session));

        if let Some(prev) = &previous {
            if prev.id() != session.id() && prev.is_open() {
                tracing::debug!("Replacing open {} session for {}", self.role, prev.addr());
                prev.close();
            }
        }

        previous
    }

    /// Get the session for an address
    pub fn get(&self, addr: &PeerAddr) -> Option<Arc<Session>> {
        self.sessions.get(addr).map(|r| Arc::clone(&r))
    }

    /// Get the session for an address if it can still carry traffic
    pub fn get_open(&self, addr: &PeerAddr) -> Option<Arc<Session>> {
        self.get(addr).filter(|session| session.is_open())
    }

    /// Remove `session` unless it has already been replaced.
    ///
    /// Returns whether an entry was removed.
    pub fn remove_if_current(&self, session: &Session) -> bool {
        self.sessions
            .remove_if(&session.addr(), |_, current| current.id() == session.id())
            .is_some()
    }

    /// List all sessions
    pub fn list(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|r| Arc::clone(&r)).collect()
    }

    /// Close every session in the pool
    pub fn close_all(&self) {
        for session in self.list() {
            session.close();
        }
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if pool is empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::detached_session;

    fn addr(s: &str) -> PeerAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let pool = ConnectionPool::new(PeerRole::App);
        let (session, _rx) = detached_session(addr("10.0.0.40"), PeerRole::App);

        assert!(pool.insert(Arc::clone(&session)).is_none());
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.get(&addr("10.0.0.40")).unwrap().id(), session.id());
        assert!(pool.get(&addr("10.0.0.41")).is_none());
    }

    #[tokio::test]
    async fn test_insert_replaces_and_closes_previous() {
        let pool = ConnectionPool::new(PeerRole::Agent);
        let (first, _rx1) = detached_session(addr("10.0.0.5"), PeerRole::Agent);
        let (second, _rx2) = detached_session(addr("10.0.0.5"), PeerRole::Agent);

        pool.insert(Arc::clone(&first));
        let replaced = pool.insert(Arc::clone(&second)).unwrap();

        assert_eq!(replaced.id(), first.id());
        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_if_current_ignores_stale_session() {
        let pool = ConnectionPool::new(PeerRole::Agent);
        let (first, _rx1) = detached_session(addr("10.0.0.5"), PeerRole::Agent);
        let (second, _rx2) = detached_session(addr("10.0.0.5"), PeerRole::Agent);

        pool.insert(Arc::clone(&first));
        pool.insert(Arc::clone(&second));

        assert!(!pool.remove_if_current(&first));
        assert_eq!(pool.len(), 1);
        assert!(pool.remove_if_current(&second));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_get_open_skips_closed_sessions() {
        let pool = ConnectionPool::new(PeerRole::App);
        let (session, _rx) = detached_session(addr("10.0.0.40"), PeerRole::App);
        pool.insert(Arc::clone(&session));

        assert!(pool.get_open(&addr("10.0.0.40")).is_some());
        session.close();
        assert!(pool.get_open(&addr("10.0.0.40")).is_none());
        assert!(pool.get(&addr("10.0.0.40")).is_some());
    }

    #[tokio::test]
    async fn test_close_all() {
        let pool = ConnectionPool::new(PeerRole::App);
        let (a, _rx1) = detached_session(addr("10.0.0.40"), PeerRole::App);
        let (b, _rx2) = detached_session(addr("10.0.0.41"), PeerRole::App);
        pool.insert(Arc::clone(&a));
        pool.insert(Arc::clone(&b));

        pool.close_all();
        assert!(!a.is_open());
        assert!(!b.is_open());
    }
}
