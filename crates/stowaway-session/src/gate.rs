//! Per-session-id serialization of store loads.
//!
//! At most one task at a time may load a given id from the store. The gate
//! map only holds entries for ids somebody is currently waiting on or
//! loading; the last task to leave a gate removes it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Map from session id to its swap gate.
#[derive(Debug, Default)]
pub struct SwapGates {
    gates: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SwapGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive passage through the gate for `id`.
    ///
    /// Tasks using different ids never wait on each other.
    pub async fn enter(&self, id: &str) -> GateGuard<'_> {
        let gate = self.handle(id);
        let mut guard = GateGuard {
            gates: self,
            id: id.to_string(),
            lock: None,
        };
        guard.lock = Some(gate.lock_owned().await);
        guard
    }

    /// Pass through the gate for `id` only if nobody else holds it.
    pub fn try_enter(&self, id: &str) -> Option<GateGuard<'_>> {
        let gate = self.handle(id);
        let mut guard = GateGuard {
            gates: self,
            id: id.to_string(),
            lock: None,
        };
        guard.lock = Some(gate.try_lock_owned().ok()?);
        Some(guard)
    }

    /// Number of ids with a live gate.
    pub fn len(&self) -> usize {
        self.gates.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.lock().is_empty()
    }

    fn handle(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.gates
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn release(&self, id: &str) {
        let mut gates = self.gates.lock();
        // Handles are only cloned under this lock, so a count of one means
        // no task holds or awaits the gate.
        if gates.get(id).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(id);
        }
    }
}

/// Passage through a swap gate; dropping it opens the gate.
///
/// Also dropped when the waiting task is cancelled, so an abandoned wait
/// never leaves its map entry behind.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gates: &'a SwapGates,
    id: String,
    lock: Option<OwnedMutexGuard<()>>,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        drop(self.lock.take());
        self.gates.release(&self.id);
    }
}

/// Ids whose load is in progress on the current call path.
///
/// Swap-in extends the scope with the id it is loading and hands it to the
/// activation hooks it runs. A hook that looks the same session up again
/// passes it back, so the nested lookup sees the half-loaded session instead
/// of waiting on a gate its own caller holds.
#[derive(Debug, Clone, Default)]
pub struct LoadScope {
    loading: Vec<String>,
}

impl LoadScope {
    /// A scope with no load in progress.
    pub fn root() -> Self {
        Self::default()
    }

    /// A child scope that additionally marks `id` as loading.
    pub fn loading(&self, id: &str) -> Self {
        let mut loading = self.loading.clone();
        loading.push(id.to_string());
        Self { loading }
    }

    pub fn is_loading(&self, id: &str) -> bool {
        self.loading.iter().any(|l| l == id)
    }
}
