//! The persistent session manager.
//!
//! [`PersistentManager`] keeps a bounded working set of sessions in memory and
//! moves the rest to a durable [`Store`]. Lookups go through the active cache
//! first and fall back to a gated swap-in; background sweeps (see
//! [`process_expires`](PersistentManager::process_expires)) swap idle
//! sessions out, relieve capacity pressure and take backups.
//!
//! # Example
//!
//! ```rust,ignore
//! use stowaway_session::{FileStore, PersistenceConfig, PersistentManager};
//!
//! let config = PersistenceConfig::new()
//!     .with_max_idle_swap(Duration::from_secs(600))
//!     .with_min_idle_swap(Duration::from_secs(60));
//!
//! let manager = PersistentManager::with_store(config, FileStore::new("/var/lib/app/sessions"));
//! manager.start().await;
//! let session = manager.create_session(None)?;
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use stowaway_types::HasPersistenceConfig;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::cache::ActiveCache;
use crate::clock::{Clock, SystemClock};
use crate::config::PersistenceConfig;
use crate::error::{Error, Result};
use crate::eviction::SweepReport;
use crate::gate::{LoadScope, SwapGates};
use crate::session::{ListenerRegistry, Session, SessionLifecycle, SessionListener};
use crate::stats::{SessionStats, StatsCounters};
use crate::store::{NoStore, Store};

/// Outcome of one [`process_expires`](PersistentManager::process_expires) run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExpireReport {
    /// Resident sessions found expired and removed.
    pub expired: usize,
    pub sweeps: SweepReport,
    /// Persisted-only sessions found expired and deleted from the store.
    pub store_expired: usize,
    pub duration: Duration,
}

/// Outcome of the shutdown flush.
///
/// Every session resident at shutdown is counted exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Written to the store and released.
    pub persisted: usize,
    /// Expired without being persisted.
    pub expired: usize,
    /// Expired because persisting them failed; a subset of `expired`.
    pub failed: usize,
}

/// Async work run for every session the manager swaps in.
///
/// Called once the session is resident and its listeners were told, while
/// the swap-in still holds the session's gate. `scope` marks the session as
/// loading: a lookup made from the hook must go through
/// [`find_scoped`](PersistentManager::find_scoped) with it, which then never
/// waits on the gate its own caller holds. Errors are logged and do not undo
/// the swap-in.
#[async_trait]
pub trait ActivationHook<S: Store>: Send + Sync + 'static {
    async fn on_activate(
        &self,
        manager: &PersistentManager<S>,
        session: &Arc<Session>,
        scope: &LoadScope,
    ) -> Result<()>;
}

/// State shared by every handle to one manager.
pub(crate) struct ManagerInner<S: Store> {
    pub(crate) cache: ActiveCache,
    pub(crate) gates: SwapGates,
    pub(crate) store: S,
    pub(crate) config: RwLock<PersistenceConfig>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) listeners: Arc<ListenerRegistry>,
    pub(crate) activation_hooks: RwLock<Vec<Arc<dyn ActivationHook<S>>>>,
    pub(crate) stats: StatsCounters,
    available: AtomicBool,
}

impl<S: Store> ManagerInner<S> {
    pub(crate) fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Drop an expired session from memory and from the store.
    pub(crate) async fn discard_expired(&self, session: &Arc<Session>) {
        self.expire_resident(session);
        self.remove_persisted(session.id()).await;
        trace!(session_id = %session.id(), "Expired session discarded");
    }

    /// Expire a session and drop it from memory, leaving any stored copy.
    pub(crate) fn expire_resident(&self, session: &Arc<Session>) {
        session.expire();
        self.cache.evict_instance(session);
        StatsCounters::bump(&self.stats.expired);
    }

    /// Delete the persisted copy of `id`, logging rather than raising failures.
    pub(crate) async fn remove_persisted(&self, id: &str) {
        if let Err(e) = self.store.remove(id).await {
            error!(session_id = %id, error = %e, "Failed to remove session from store");
        }
    }

    /// Delete persisted sessions that timed out while swapped out.
    ///
    /// Resident ids and ids mid-swap-in are left alone.
    pub(crate) async fn expire_persisted(&self) -> usize {
        let ids = match self.store.keys().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list persisted sessions for expiry");
                return 0;
            }
        };

        let mut expired = 0;
        for id in ids {
            if self.cache.contains(&id) {
                continue;
            }
            let Some(_gate) = self.gates.try_enter(&id) else {
                continue;
            };
            if self.cache.contains(&id) {
                continue;
            }

            let snapshot = match self.store.load(&id).await {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) => continue,
                Err(e) => {
                    error!(session_id = %id, error = %e, "Failed to load persisted session for expiry");
                    continue;
                }
            };

            let session = Session::from_snapshot(snapshot, self.clock.clone());
            session.bind(self.listeners.clone());
            if session.is_valid() {
                continue;
            }
            match self.store.remove(&id).await {
                Ok(()) => {
                    expired += 1;
                    StatsCounters::bump(&self.stats.expired);
                    trace!(session_id = %id, "Expired persisted session removed");
                }
                Err(e) => {
                    error!(session_id = %id, error = %e, "Failed to remove expired session from store");
                }
            }
        }
        expired
    }
}

/// Session manager with a durable backing store.
///
/// Cheap to clone: clones share the same cache, gates and store.
pub struct PersistentManager<S: Store = NoStore> {
    inner: Arc<ManagerInner<S>>,
}

impl<S: Store> Clone for PersistentManager<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl PersistentManager<NoStore> {
    /// Create a memory-only manager: nothing is ever swapped out.
    pub fn new(config: PersistenceConfig) -> Self {
        Self::with_store(config, NoStore)
    }
}

impl<S: Store> PersistentManager<S> {
    pub fn with_store(config: PersistenceConfig, store: S) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a manager reading time from `clock`.
    pub fn with_clock(config: PersistenceConfig, store: S, clock: Arc<dyn Clock>) -> Self {
        let inner = ManagerInner {
            cache: ActiveCache::new(),
            gates: SwapGates::new(),
            store,
            config: RwLock::new(config),
            clock,
            listeners: Arc::new(ListenerRegistry::new()),
            activation_hooks: RwLock::new(Vec::new()),
            stats: StatsCounters::default(),
            available: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ManagerInner<S>>) -> Self {
        Self { inner }
    }

    /// Create a manager from any configuration source.
    pub fn from_config<C: HasPersistenceConfig>(provider: &C, store: S) -> Self {
        Self::with_store(PersistenceConfig::from_provider(provider), store)
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    /// Current configuration.
    pub fn config(&self) -> PersistenceConfig {
        self.inner.config.read().clone()
    }

    // ── Configuration setters ───────────────────────────────────────────

    pub fn set_max_idle_backup(&self, idle: Option<Duration>) {
        self.inner.config.write().max_idle_backup = idle;
    }

    pub fn set_min_idle_swap(&self, idle: Option<Duration>) {
        self.inner.config.write().min_idle_swap = idle;
    }

    pub fn set_max_idle_swap(&self, idle: Option<Duration>) {
        self.inner.config.write().max_idle_swap = idle;
    }

    pub fn set_save_on_restart(&self, enabled: bool) {
        self.inner.config.write().save_on_restart = enabled;
    }

    pub fn set_max_active_sessions(&self, max: Option<usize>) {
        self.inner.config.write().max_active_sessions = max;
    }

    /// Register a listener for lifecycle events of every managed session.
    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.inner.listeners.add(listener);
    }

    /// Register async work to run for every swapped-in session.
    pub fn add_activation_hook(&self, hook: Arc<dyn ActivationHook<S>>) {
        self.inner.activation_hooks.write().push(hook);
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Make the manager available, reloading persisted sessions if
    /// `save_on_restart` is set. Returns the number of sessions loaded.
    pub async fn start(&self) -> usize {
        self.inner.available.store(true, Ordering::SeqCst);
        let reload = self.inner.store.is_durable() && self.inner.config.read().save_on_restart;
        let loaded = if reload { self.load().await } else { 0 };
        info!(loaded, "Session manager started");
        loaded
    }

    /// Flush every resident session and make the manager unavailable.
    ///
    /// With a durable store and `save_on_restart`, sessions are persisted and
    /// released; otherwise they are expired and their stored copies deleted.
    /// A session whose persist fails is expired in memory too, so nothing is
    /// left half-flushed, but its last stored copy is kept.
    pub async fn stop(&self) -> FlushReport {
        self.inner.available.store(false, Ordering::SeqCst);
        let persist = self.inner.store.is_durable() && self.inner.config.read().save_on_restart;

        let mut report = FlushReport::default();
        for session in self.inner.cache.snapshot() {
            if persist {
                match self.inner.swap_out(&session).await {
                    Ok(true) => {
                        report.persisted += 1;
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(session_id = %session.id(), error = %e, "Could not persist session at shutdown, expiring it");
                        report.failed += 1;
                        report.expired += 1;
                        self.inner.expire_resident(&session);
                        continue;
                    }
                }
            }
            self.inner.discard_expired(&session).await;
            report.expired += 1;
        }
        self.inner.cache.clear();

        info!(
            persisted = report.persisted,
            expired = report.expired,
            failed = report.failed,
            "Session manager stopped"
        );
        report
    }

    pub fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    // ── Sessions ────────────────────────────────────────────────────────

    /// Create and register a new session.
    ///
    /// Uses a random id when `id` is `None`. Fails when the configured
    /// maximum of active sessions is already reached.
    pub fn create_session(&self, id: Option<&str>) -> Result<Arc<Session>> {
        let (max_active, timeout) = {
            let config = self.inner.config.read();
            (config.max_active_sessions, config.session_timeout)
        };

        if let Some(max) = max_active
            && self.inner.cache.len() >= max
        {
            StatsCounters::bump(&self.inner.stats.rejected);
            warn!(max, "Refusing to create session: too many active sessions");
            return Err(Error::TooManyActiveSessions { max });
        }

        let id = id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let session = Arc::new(Session::new(id, self.inner.clock.clone(), timeout));
        session.bind(self.inner.listeners.clone());
        if !self.inner.cache.insert_if_absent(session.clone()) {
            return Err(Error::DuplicateId(session.id().to_string()));
        }

        session.tell_new();
        StatsCounters::bump(&self.inner.stats.created);
        trace!(session_id = %session.id(), "Session created");
        Ok(session)
    }

    /// Adopt an externally built session into the active cache.
    pub fn add(&self, session: Arc<Session>) {
        session.bind(self.inner.listeners.clone());
        self.inner.cache.insert(session);
    }

    /// Remove a session from memory and from the store.
    ///
    /// Store failures are logged, not raised.
    pub async fn remove(&self, session: &Arc<Session>) {
        self.inner.cache.evict_instance(session);
        self.inner.remove_persisted(session.id()).await;
    }

    /// Expire the session with this id, wherever it currently lives.
    ///
    /// Returns whether a session was found.
    pub async fn invalidate(&self, id: &str) -> Result<bool> {
        match self.find(id).await? {
            Some(session) => {
                self.inner.discard_expired(&session).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Look a session up by id, swapping it in from the store if needed.
    ///
    /// A missing session is `Ok(None)`. Store failures and corrupted
    /// snapshots are returned as errors.
    pub async fn find(&self, id: &str) -> Result<Option<Arc<Session>>> {
        self.inner.find(id, &LoadScope::root()).await
    }

    /// [`find`](Self::find) on behalf of a caller that is itself part of a
    /// swap-in, described by `scope`.
    pub async fn find_scoped(&self, id: &str, scope: &LoadScope) -> Result<Option<Arc<Session>>> {
        self.inner.find(id, scope).await
    }

    /// Whether `id` is resident in memory. Never touches the store.
    pub fn is_loaded(&self, id: &str) -> bool {
        self.inner.cache.contains(id)
    }

    /// Swap a session out to the store and release it from memory.
    ///
    /// Returns `Ok(false)` when there was nothing to do (no durable store,
    /// or the session is no longer valid). On a store failure the session
    /// stays resident.
    pub async fn swap_out(&self, session: &Arc<Session>) -> Result<bool> {
        self.inner.swap_out(session).await
    }

    /// Persist a session without releasing it.
    pub async fn write_session(&self, session: &Arc<Session>) -> Result<bool> {
        self.inner.write_session(session).await
    }

    // ── Bulk operations ─────────────────────────────────────────────────

    /// Swap in every persisted session. Returns the number loaded.
    ///
    /// Per-session failures are logged and skipped.
    pub async fn load(&self) -> usize {
        let ids = match self.inner.store.keys().await {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "Failed to list persisted sessions");
                return 0;
            }
        };

        let mut loaded = 0;
        for id in &ids {
            match self.inner.find(id, &LoadScope::root()).await {
                Ok(Some(_)) => loaded += 1,
                Ok(None) => {}
                Err(e) => {
                    error!(session_id = %id, error = %e, "Failed to load persisted session");
                }
            }
        }
        debug!(persisted = ids.len(), loaded, "Loaded persisted sessions");
        loaded
    }

    /// Swap out every resident session. Returns the number swapped out.
    pub async fn unload(&self) -> usize {
        let mut unloaded = 0;
        for session in self.inner.cache.snapshot() {
            match self.inner.swap_out(&session).await {
                Ok(true) => unloaded += 1,
                Ok(false) => {}
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "Session left resident after failed unload");
                }
            }
        }
        debug!(unloaded, "Unloaded active sessions");
        unloaded
    }

    /// Periodic maintenance: expire dead sessions, run the eviction sweeps,
    /// then expire stale sessions held only by the store.
    pub async fn process_expires(&self) -> ExpireReport {
        let started = Instant::now();
        let mut report = ExpireReport::default();

        for session in self.inner.cache.snapshot() {
            if !session.is_valid() {
                self.inner.discard_expired(&session).await;
                report.expired += 1;
            }
        }

        report.sweeps = self.inner.run_eviction_sweeps().await;
        if self.inner.is_available() {
            report.store_expired = self.inner.expire_persisted().await;
        }

        report.duration = started.elapsed();
        self.inner.stats.add_processing_time(report.duration);
        debug!(
            expired = report.expired,
            store_expired = report.store_expired,
            active = self.inner.cache.len(),
            elapsed_ms = report.duration.as_millis() as u64,
            "Processed session expiry"
        );
        report
    }

    /// Run the idle-swap, capacity-swap and idle-backup sweeps once.
    pub async fn run_eviction_sweeps(&self) -> SweepReport {
        self.inner.run_eviction_sweeps().await
    }

    // ── Store-wide views ────────────────────────────────────────────────

    /// Delete every persisted session.
    pub async fn clear_store(&self) -> Result<()> {
        self.inner.store.clear().await.map_err(|e| {
            error!(error = %e, "Failed to clear session store");
            e
        })
    }

    /// Number of distinct sessions resident or persisted.
    ///
    /// Falls back to the resident count if the store cannot be listed.
    pub async fn active_count_including_store(&self) -> usize {
        self.all_ids_including_store().await.len()
    }

    /// Ids of every session resident or persisted, sorted.
    ///
    /// Falls back to the resident ids if the store cannot be listed.
    pub async fn all_ids_including_store(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.inner.cache.ids().into_iter().collect();
        match self.inner.store.keys().await {
            Ok(keys) => ids.extend(keys),
            Err(e) => warn!(error = %e, "Could not list persisted sessions"),
        }
        ids.into_iter().collect()
    }

    /// Number of sessions in the store.
    pub async fn stored_count(&self) -> Result<usize> {
        self.inner.store.size().await
    }

    /// Number of sessions resident in memory.
    pub fn active_count(&self) -> usize {
        self.inner.cache.len()
    }

    pub fn stats(&self) -> SessionStats {
        self.inner
            .stats
            .snapshot(self.inner.cache.len(), self.inner.cache.peak())
    }
}
