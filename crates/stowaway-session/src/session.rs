//! Server-side session objects and their durable snapshot form.
//!
//! A [`Session`] is shared as `Arc<Session>` between the active cache and the
//! request handlers using it. Its mutable state sits behind an internal lock
//! so a sweep always observes a consistent view (validity, idle time, access
//! count) even while a request thread is updating it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, elapsed};

/// Note key holding the last-accessed time recorded at the last backup.
pub const BACKUP_WATERMARK_NOTE: &str = "stowaway.persisted_last_accessed";

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle events
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle transitions observed by [`SessionListener`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session became known to the manager (created or swapped in).
    Created,
    /// The session was reactivated after being loaded from the store.
    Activated,
    /// The session is about to be written out and released from memory.
    WillPassivate,
    /// The session was expired or invalidated.
    Destroyed,
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Created => write!(f, "created"),
            SessionEvent::Activated => write!(f, "activated"),
            SessionEvent::WillPassivate => write!(f, "will_passivate"),
            SessionEvent::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// Observer of session lifecycle events.
///
/// Called synchronously on the thread driving the transition, without any
/// session lock held, so implementations may read the session freely.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: SessionEvent, session: &Session);
}

/// The set of listeners a manager hands to the sessions it owns.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn SessionListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all sessions bound to this registry.
    pub fn add(&self, listener: Arc<dyn SessionListener>) {
        self.listeners.write().push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    fn fire(&self, event: SessionEvent, session: &Session) {
        // Clone out so listeners can register further listeners.
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_event(event, session);
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Lifecycle hooks the swap coordinator drives.
pub trait SessionLifecycle {
    /// Announce the session to listeners as newly available.
    fn tell_new(&self);

    /// Called after the session has been reinstated in memory from the store.
    fn activate(&self);

    /// Called before the session is written to the store and released.
    fn passivate(&self);

    /// Release the in-memory form after a successful swap-out.
    fn recycle(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// Durable form of a session: what the store persists and returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub creation_time: DateTime<Utc>,
    pub last_accessed_time: DateTime<Utc>,
    pub this_accessed_time: DateTime<Utc>,
    /// Inactivity timeout in milliseconds; absent means the session never
    /// times out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_inactive_ms: Option<u64>,
    pub valid: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct SessionState {
    valid: bool,
    expiring: bool,
    recycled: bool,
    creation_time: DateTime<Utc>,
    this_accessed: DateTime<Utc>,
    last_accessed: DateTime<Utc>,
    max_inactive_interval: Option<Duration>,
    attributes: BTreeMap<String, Value>,
    notes: HashMap<String, Value>,
}

impl SessionState {
    fn idle_at(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.this_accessed, now)
    }

    fn timed_out_at(&self, now: DateTime<Utc>) -> bool {
        match self.max_inactive_interval {
            Some(max) => self.idle_at(now) >= max,
            None => false,
        }
    }
}

/// Consistent read of the state the eviction sweeps decide on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub id: String,
    /// Valid and not timed out at the time of the view.
    pub valid: bool,
    pub idle: Duration,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    pub backup_watermark: Option<DateTime<Utc>>,
}

/// A server-side session.
#[derive(Debug)]
pub struct Session {
    id: String,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
    access_count: AtomicU32,
    listeners: RwLock<Option<Arc<ListenerRegistry>>>,
    /// Held while the session is re-checked on lookup or moved to the store.
    transition: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create a fresh, valid session.
    pub fn new(
        id: impl Into<String>,
        clock: Arc<dyn Clock>,
        max_inactive_interval: Option<Duration>,
    ) -> Self {
        let now = clock.now();
        Self::with_state(
            id.into(),
            clock,
            SessionState {
                valid: true,
                expiring: false,
                recycled: false,
                creation_time: now,
                this_accessed: now,
                last_accessed: now,
                max_inactive_interval,
                attributes: BTreeMap::new(),
                notes: HashMap::new(),
            },
        )
    }

    /// Rebuild a session from its persisted snapshot.
    ///
    /// The session is not bound to any listeners until a manager adopts it.
    pub fn from_snapshot(snapshot: SessionSnapshot, clock: Arc<dyn Clock>) -> Self {
        Self::with_state(
            snapshot.id,
            clock,
            SessionState {
                valid: snapshot.valid,
                expiring: false,
                recycled: false,
                creation_time: snapshot.creation_time,
                this_accessed: snapshot.this_accessed_time,
                last_accessed: snapshot.last_accessed_time,
                max_inactive_interval: snapshot.max_inactive_ms.map(Duration::from_millis),
                attributes: snapshot.attributes,
                notes: HashMap::new(),
            },
        )
    }

    fn with_state(id: String, clock: Arc<dyn Clock>, state: SessionState) -> Self {
        Self {
            id,
            clock,
            state: Mutex::new(state),
            access_count: AtomicU32::new(0),
            listeners: RwLock::new(None),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    /// Durable fields of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            id: self.id.clone(),
            creation_time: state.creation_time,
            last_accessed_time: state.last_accessed,
            this_accessed_time: state.this_accessed,
            max_inactive_ms: state
                .max_inactive_interval
                .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            valid: state.valid,
            attributes: state.attributes.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Validity ────────────────────────────────────────────────────────

    /// Whether the session is still usable.
    ///
    /// A session whose inactivity timeout has elapsed is expired as a side
    /// effect and reported invalid.
    pub fn is_valid(&self) -> bool {
        let timed_out = {
            let state = self.state.lock();
            if !state.valid {
                return false;
            }
            if state.expiring {
                return true;
            }
            state.timed_out_at(self.clock.now())
        };

        if timed_out {
            self.expire();
            return false;
        }
        true
    }

    /// Expire the session, notifying listeners. Idempotent.
    pub fn expire(&self) {
        {
            let mut state = self.state.lock();
            if !state.valid || state.expiring {
                return;
            }
            state.expiring = true;
        }

        self.fire(SessionEvent::Destroyed);

        let mut state = self.state.lock();
        state.valid = false;
        state.expiring = false;
        state.attributes.clear();
        self.access_count.store(0, Ordering::SeqCst);
    }

    /// Whether the in-memory form was released by a swap-out.
    pub fn is_recycled(&self) -> bool {
        self.state.lock().recycled
    }

    // ── Access accounting ───────────────────────────────────────────────

    /// Mark the start of a request using this session.
    pub fn access(&self) {
        let now = self.clock.now();
        self.state.lock().this_accessed = now;
        self.access_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark the end of a request; the count never drops below zero.
    pub fn end_access(&self) {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            state.this_accessed = now;
            state.last_accessed = now;
        }
        let _ = self
            .access_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Number of requests currently holding the session.
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::SeqCst)
    }

    /// Time since the session was last touched.
    pub fn idle_time(&self) -> Duration {
        self.idle_time_at(self.clock.now())
    }

    pub fn idle_time_at(&self, now: DateTime<Utc>) -> Duration {
        self.state.lock().idle_at(now)
    }

    /// When the last completed request touched the session.
    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        self.state.lock().last_accessed
    }

    /// When any request (possibly still running) last touched the session.
    pub fn this_accessed_time(&self) -> DateTime<Utc> {
        self.state.lock().this_accessed
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        self.state.lock().creation_time
    }

    pub fn max_inactive_interval(&self) -> Option<Duration> {
        self.state.lock().max_inactive_interval
    }

    pub fn set_max_inactive_interval(&self, interval: Option<Duration>) {
        self.state.lock().max_inactive_interval = interval;
    }

    /// Read the sweep-relevant state under a single lock acquisition.
    ///
    /// Unlike [`is_valid`](Self::is_valid) this never expires the session.
    pub fn view(&self, now: DateTime<Utc>) -> SessionView {
        let state = self.state.lock();
        SessionView {
            id: self.id.clone(),
            valid: state.valid && !state.timed_out_at(now),
            idle: state.idle_at(now),
            access_count: self.access_count(),
            last_accessed: state.last_accessed,
            backup_watermark: watermark_from(state.notes.get(BACKUP_WATERMARK_NOTE)),
        }
    }

    // ── Notes (transient, never persisted) ──────────────────────────────

    pub fn get_note(&self, key: &str) -> Option<Value> {
        self.state.lock().notes.get(key).cloned()
    }

    pub fn set_note(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.state.lock().notes.insert(key.into(), value.into());
    }

    pub fn remove_note(&self, key: &str) -> Option<Value> {
        self.state.lock().notes.remove(key)
    }

    /// Last-accessed time recorded by the most recent successful backup.
    pub fn backup_watermark(&self) -> Option<DateTime<Utc>> {
        watermark_from(self.state.lock().notes.get(BACKUP_WATERMARK_NOTE))
    }

    pub(crate) fn set_backup_watermark(&self, last_accessed: DateTime<Utc>) {
        if let Ok(value) = serde_json::to_value(last_accessed) {
            self.set_note(BACKUP_WATERMARK_NOTE, value);
        }
    }

    // ── Attributes (persisted) ──────────────────────────────────────────

    pub fn get_attribute(&self, name: &str) -> Option<Value> {
        self.state.lock().attributes.get(name).cloned()
    }

    /// Set an attribute, returning the previous value.
    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.state.lock().attributes.insert(name.into(), value.into())
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.state.lock().attributes.remove(name)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.state.lock().attributes.keys().cloned().collect()
    }

    // ── Manager plumbing ────────────────────────────────────────────────

    /// Bind the session to a manager's listeners.
    pub(crate) fn bind(&self, listeners: Arc<ListenerRegistry>) {
        *self.listeners.write() = Some(listeners);
    }

    pub(crate) fn transition(&self) -> &tokio::sync::Mutex<()> {
        &self.transition
    }

    fn fire(&self, event: SessionEvent) {
        let registry = self.listeners.read().clone();
        if let Some(registry) = registry {
            registry.fire(event, self);
        }
    }
}

impl SessionLifecycle for Session {
    fn tell_new(&self) {
        self.fire(SessionEvent::Created);
    }

    fn activate(&self) {
        self.fire(SessionEvent::Activated);
    }

    fn passivate(&self) {
        self.fire(SessionEvent::WillPassivate);
    }

    fn recycle(&self) {
        *self.listeners.write() = None;
        let mut state = self.state.lock();
        state.valid = false;
        state.recycled = true;
        state.attributes.clear();
        state.notes.clear();
        self.access_count.store(0, Ordering::SeqCst);
    }
}

fn watermark_from(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value.and_then(|v| serde_json::from_value(v.clone()).ok())
}
