use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, warn};

/// Bookkeeping for one live TCP session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: u64,
    pub remote: SocketAddr,
    pub opened_at: Instant,
}

#[derive(Debug)]
pub struct ConnectionStats {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub rejected_sessions: u64,
}

/// Active TCP sessions keyed by a unique, never reused id.
///
/// Sessions register from the accept loop and unregister themselves through
/// `SessionGuard` when their task ends (normally, by error, or by abort).
#[derive(Debug)]
pub struct ConnectionManager {
    sessions: DashMap<u64, SessionInfo>,
    max_sessions: usize,
    next_id: AtomicU64,
    total_sessions: AtomicU64,
    rejected_sessions: AtomicU64,
}

impl ConnectionManager {
    /// `max_sessions` of 0 means unlimited
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            max_sessions,
            next_id: AtomicU64::new(1),
            total_sessions: AtomicU64::new(0),
            rejected_sessions: AtomicU64::new(0),
        }
    }

    /// Reserve an id for a new session, or None if the cap is reached
    pub fn register(self: &Arc<Self>, remote: SocketAddr) -> Option<SessionGuard> {
        if self.is_full() {
            self.rejected_sessions.fetch_add(1, Ordering::Relaxed);
            warn!(
                "TCP session limit reached ({}/{}), rejecting {}",
                self.sessions.len(),
                self.max_sessions,
                remote
            );
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            id,
            SessionInfo {
                id,
                remote,
                opened_at: Instant::now(),
            },
        );
        self.total_sessions.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Registered session {} for {} ({} active)",
            id,
            remote,
            self.sessions.len()
        );

        Some(SessionGuard {
            id,
            manager: self.clone(),
        })
    }

    pub fn reject(&self) {
        self.rejected_sessions.fetch_add(1, Ordering::Relaxed);
    }

    fn unregister(&self, id: u64) {
        if let Some((_, info)) = self.sessions.remove(&id) {
            debug!(
                "Unregistered session {} for {} after {:?} ({} remaining)",
                id,
                info.remote,
                info.opened_at.elapsed(),
                self.sessions.len()
            );
        }
    }

    /// Snapshot of live sessions. Collected before returning so callers
    /// never iterate the map while sessions are removing themselves.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.max_sessions != 0 && self.sessions.len() >= self.max_sessions
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_sessions: self.sessions.len(),
            total_sessions: self.total_sessions.load(Ordering::Relaxed),
            rejected_sessions: self.rejected_sessions.load(Ordering::Relaxed),
        }
    }
}

/// Keeps a session registered for as long as it lives
#[derive(Debug)]
pub struct SessionGuard {
    id: u64,
    manager: Arc<ConnectionManager>,
}

impl SessionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.unregister(self.id);
    }
}
