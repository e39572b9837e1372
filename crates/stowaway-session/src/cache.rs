//! The set of sessions currently resident in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use crate::session::Session;

/// Concurrent id → session map.
///
/// Entries are never expired here: lookups return whatever is resident and
/// callers decide validity. Each lock is held only for the map operation
/// itself, never across a store call.
#[derive(Debug, Default)]
pub struct ActiveCache {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    peak: AtomicUsize,
}

impl ActiveCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The resident session for `id`, if any.
    pub fn lookup(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Insert or replace the session under its own id.
    ///
    /// Returns the session previously resident under that id.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let previous = sessions.insert(session.id().to_string(), session);
        self.peak.fetch_max(sessions.len(), Ordering::Relaxed);
        trace!(cache_size = sessions.len(), "Session made resident");
        previous
    }

    /// Insert the session unless its id is already resident.
    pub fn insert_if_absent(&self, session: Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session.id()) {
            return false;
        }
        sessions.insert(session.id().to_string(), session);
        self.peak.fetch_max(sessions.len(), Ordering::Relaxed);
        true
    }

    /// Remove whatever is resident under `id`.
    pub fn evict(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.write().remove(id)
    }

    /// Remove `session` only if it is still the resident instance for its id.
    ///
    /// Guards against evicting a newer instance that replaced it.
    pub fn evict_instance(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(session.id()) {
            Some(resident) if Arc::ptr_eq(resident, session) => {
                sessions.remove(session.id());
                true
            }
            _ => false,
        }
    }

    /// Whether `session` is the resident instance for its id.
    pub fn holds(&self, session: &Arc<Session>) -> bool {
        self.sessions
            .read()
            .get(session.id())
            .is_some_and(|resident| Arc::ptr_eq(resident, session))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Point-in-time copy of every resident session.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Drop every resident session, returning them.
    pub fn clear(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    /// Highest number of sessions resident at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
