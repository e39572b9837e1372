//! Moving sessions between the active cache and the store.
//!
//! Swap-in is serialized per id through [`SwapGates`](crate::gate::SwapGates):
//! however many tasks ask for the same persisted session at once, the store
//! is read once and every caller receives the same instance. Swap-out and
//! the lookup re-check both hold the session's transition lock, so a lookup
//! never hands out a session that is halfway to the store.
//!
//! While a swap-in holds its gate it runs the manager's activation hooks
//! with a [`LoadScope`] naming the id, so a hook that looks the session up
//! again is answered from the cache instead of waiting on that gate.

use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::gate::LoadScope;
use crate::manager::{ManagerInner, PersistentManager};
use crate::session::{Session, SessionLifecycle};
use crate::stats::StatsCounters;
use crate::store::Store;

impl<S: Store> ManagerInner<S> {
    pub(crate) async fn find(
        self: &Arc<Self>,
        id: &str,
        scope: &LoadScope,
    ) -> Result<Option<Arc<Session>>> {
        if let Some(session) = self.cache.lookup(id) {
            let _transition = session.transition().lock().await;
            // Re-fetch: the session may have been swapped out while we waited.
            if let Some(current) = self.cache.lookup(id) {
                if !current.is_valid() {
                    self.discard_expired(&current).await;
                    return Ok(None);
                }
                current.access();
                current.end_access();
                return Ok(Some(current));
            }
        }
        self.swap_in(id, scope).await
    }

    async fn swap_in(self: &Arc<Self>, id: &str, scope: &LoadScope) -> Result<Option<Arc<Session>>> {
        if !self.store.is_durable() {
            return Ok(None);
        }

        // The gate is not reentrant: a caller already loading this id must
        // not wait on it.
        if scope.is_loading(id) {
            trace!(session_id = %id, "Session is being loaded by this caller");
            return Ok(self.cache.lookup(id));
        }

        let _gate = self.gates.enter(id).await;

        if let Some(session) = self.cache.lookup(id) {
            trace!(session_id = %id, "Session loaded by a concurrent caller");
            return Ok(Some(session));
        }

        let scope = scope.loading(id);
        let Some(session) = self.load_from_store(id).await? else {
            return Ok(None);
        };

        session.bind(self.listeners.clone());
        if !session.is_valid() {
            error!(session_id = %id, "Swapped-in session is no longer valid, discarding");
            session.expire();
            StatsCounters::bump(&self.stats.expired);
            self.remove_persisted(id).await;
            return Ok(None);
        }

        self.reactivate(&session, &scope).await;
        StatsCounters::bump(&self.stats.swapped_in);
        debug!(session_id = %id, "Session swapped in");
        Ok(Some(session))
    }

    async fn load_from_store(&self, id: &str) -> Result<Option<Arc<Session>>> {
        match self.store.load(id).await {
            Ok(Some(snapshot)) => Ok(Some(Arc::new(Session::from_snapshot(
                snapshot,
                self.clock.clone(),
            )))),
            Ok(None) => Ok(None),
            Err(e) => {
                error!(session_id = %id, error = %e, "Failed to load session from store");
                Err(e)
            }
        }
    }

    async fn reactivate(self: &Arc<Self>, session: &Arc<Session>, scope: &LoadScope) {
        session.tell_new();
        self.cache.insert(session.clone());
        session.activate();

        let hooks = self.activation_hooks.read().clone();
        if !hooks.is_empty() {
            let manager = PersistentManager::from_inner(Arc::clone(self));
            for hook in hooks {
                if let Err(e) = hook.on_activate(&manager, session, scope).await {
                    warn!(session_id = %session.id(), error = %e, "Activation hook failed");
                }
            }
        }

        // Balance the accounting so loading never leaves the count raised.
        session.access();
        session.end_access();
    }

    pub(crate) async fn swap_out(&self, session: &Arc<Session>) -> Result<bool> {
        let _transition = session.transition().lock().await;
        self.swap_out_locked(session).await
    }

    /// Swap out with the session's transition lock already held.
    pub(crate) async fn swap_out_locked(&self, session: &Arc<Session>) -> Result<bool> {
        if !self.store.is_durable() || !session.is_valid() {
            return Ok(false);
        }

        session.passivate();
        // On failure the session stays resident and is not recycled.
        self.write_session(session).await?;

        self.cache.evict_instance(session);
        session.recycle();
        StatsCounters::bump(&self.stats.swapped_out);
        trace!(session_id = %session.id(), "Session swapped out");
        Ok(true)
    }

    /// Persist without evicting. Failures are logged here and re-raised.
    pub(crate) async fn write_session(&self, session: &Arc<Session>) -> Result<bool> {
        if !self.store.is_durable() || !session.is_valid() {
            return Ok(false);
        }

        if let Err(e) = self.store.save(&session.snapshot()).await {
            error!(session_id = %session.id(), error = %e, "Failed to write session to store");
            return Err(e);
        }
        Ok(true)
    }
}
