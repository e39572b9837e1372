//! Integration tests for swapping, eviction sweeps and shutdown flushing.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use stowaway_session::{
    ActivationHook, FileStore, LoadScope, ManualClock, MemoryStore, PersistenceConfig,
    PersistentManager, Result, Session, SessionEvent, SessionListener, SessionSnapshot, Store,
    spawn_sweeper,
};

/// Memory store that counts calls and can be told to fail or stall.
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    loads: AtomicUsize,
    saves: AtomicUsize,
    load_delay_ms: AtomicUsize,
    fail_saves: AtomicBool,
}

impl CountingStore {
    fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn keys(&self) -> Result<Vec<String>> {
        self.inner.keys().await
    }

    async fn load(&self, id: &str) -> Result<Option<SessionSnapshot>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = self.load_delay_ms.load(Ordering::SeqCst) as u64;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.load(id).await
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("store offline").into());
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(snapshot).await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.inner.remove(id).await
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(SessionEvent, String)>>,
}

impl Recorder {
    fn count(&self, event: SessionEvent) -> usize {
        self.events.lock().iter().filter(|(e, _)| *e == event).count()
    }
}

impl SessionListener for Recorder {
    fn on_event(&self, event: SessionEvent, session: &Session) {
        self.events.lock().push((event, session.id().to_string()));
    }
}

/// Looks its own session up again while that session is being swapped in.
#[derive(Default)]
struct LooksItselfUp {
    calls: AtomicUsize,
    scoped: AtomicBool,
    same_instance: AtomicBool,
}

#[async_trait]
impl ActivationHook<CountingStore> for LooksItselfUp {
    async fn on_activate(
        &self,
        manager: &PersistentManager<CountingStore>,
        session: &Arc<Session>,
        scope: &LoadScope,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.scoped.store(scope.is_loading(session.id()), Ordering::SeqCst);
        let again = manager.find_scoped(session.id(), scope).await?;
        let same = again.is_some_and(|s| Arc::ptr_eq(&s, session));
        self.same_instance.store(same, Ordering::SeqCst);
        Ok(())
    }
}

/// A started manager over a counting store and a manual clock.
async fn test_manager(
    config: PersistenceConfig,
) -> (PersistentManager<CountingStore>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::starting_now());
    let manager = PersistentManager::with_clock(config, CountingStore::default(), clock.clone());
    manager.start().await;
    (manager, clock)
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

// ─────────────────────────────────────────────────────────────────────────────
// Swap-in
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_find_swaps_in_and_caches() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    let session = manager.create_session(Some("s1")).unwrap();
    session.set_attribute("user", "erin");
    manager.swap_out(&session).await.unwrap();
    assert!(!manager.is_loaded("s1"));

    let found = manager.find("s1").await.unwrap().unwrap();
    assert!(found.is_valid());
    assert!(manager.is_loaded("s1"));
    assert_eq!(found.get_attribute("user"), Some("erin".into()));

    // Second lookup is served from memory
    let again = manager.find("s1").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&found, &again));
    assert_eq!(manager.store().loads(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_finds_load_once() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    let session = manager.create_session(Some("S1")).unwrap();
    manager.swap_out(&session).await.unwrap();
    manager.store().load_delay_ms.store(50, Ordering::SeqCst);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move { manager.find("S1").await }));
    }

    let mut found = Vec::new();
    for handle in handles {
        found.push(handle.await.unwrap().unwrap().unwrap());
    }

    assert_eq!(manager.store().loads(), 1);
    assert!(found.iter().all(|s| Arc::ptr_eq(s, &found[0])));
    assert_eq!(found[0].access_count(), 0);
    assert_eq!(manager.stats().swapped_in, 1);
}

#[tokio::test]
async fn test_missing_session_is_not_an_error() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    assert!(manager.find("nobody").await.unwrap().is_none());
    assert_eq!(manager.store().loads(), 1);
}

#[tokio::test]
async fn test_corrupt_snapshot_surfaces_error() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    manager.store().inner.insert_raw("bad", b"\xffnot a session".to_vec());

    let err = manager.find("bad").await.unwrap_err();
    assert!(err.is_corruption());
    assert!(!manager.is_loaded("bad"));
    // Corrupt data is left for inspection, not deleted
    assert!(manager.store().inner.contains("bad"));
}

#[tokio::test]
async fn test_timed_out_snapshot_is_discarded_on_load() {
    let config = PersistenceConfig::new().with_session_timeout(secs(60));
    let (manager, clock) = test_manager(config).await;
    let recorder = Arc::new(Recorder::default());
    manager.add_listener(recorder.clone());

    let session = manager.create_session(Some("old")).unwrap();
    manager.swap_out(&session).await.unwrap();

    clock.advance(secs(120));
    assert!(manager.find("old").await.unwrap().is_none());
    assert!(!manager.is_loaded("old"));
    assert!(!manager.store().inner.contains("old"));
    assert_eq!(recorder.count(SessionEvent::Destroyed), 1);
    assert_eq!(recorder.count(SessionEvent::Activated), 0);
}

#[tokio::test]
async fn test_scoped_find_does_not_reload() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    let session = manager.create_session(Some("s1")).unwrap();
    manager.swap_out(&session).await.unwrap();

    let scope = LoadScope::root().loading("s1");
    assert!(manager.find_scoped("s1", &scope).await.unwrap().is_none());
    assert_eq!(manager.store().loads(), 0);
}

#[tokio::test]
async fn test_activation_hook_can_find_its_own_session() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    let hook = Arc::new(LooksItselfUp::default());
    manager.add_activation_hook(hook.clone());
    let session = manager.create_session(Some("s1")).unwrap();
    manager.swap_out(&session).await.unwrap();

    let found = tokio::time::timeout(Duration::from_secs(2), manager.find("s1"))
        .await
        .expect("swap-in must not wait on its own gate")
        .unwrap()
        .unwrap();

    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    assert!(hook.scoped.load(Ordering::SeqCst));
    assert!(hook.same_instance.load(Ordering::SeqCst));
    assert_eq!(manager.store().loads(), 1);
    assert_eq!(found.access_count(), 0);

    // Served from memory afterwards: the hook does not run again
    manager.find("s1").await.unwrap().unwrap();
    assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Sweeps
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_idle_swap_sweep() {
    let config = PersistenceConfig::new()
        .with_max_idle_swap(secs(600))
        .with_min_idle_swap(secs(60));
    let (manager, clock) = test_manager(config).await;

    let session = manager.create_session(Some("S")).unwrap();
    session.set_attribute("cart", serde_json::json!(["book", "lamp"]));
    let before = session.snapshot();

    clock.advance(secs(700));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.idle_swapped, 1);
    assert!(!manager.is_loaded("S"));

    let stored = manager.store().load("S").await.unwrap().unwrap();
    assert_eq!(stored.id, before.id);
    assert_eq!(stored.creation_time, before.creation_time);
    assert_eq!(stored.attributes, before.attributes);

    let back = manager.find("S").await.unwrap().unwrap();
    assert_eq!(back.get_attribute("cart"), Some(serde_json::json!(["book", "lamp"])));
}

#[tokio::test]
async fn test_idle_swap_leaves_recent_and_busy_sessions() {
    let config = PersistenceConfig::new()
        .with_max_idle_swap(secs(600))
        .with_min_idle_swap(secs(60));
    let (manager, clock) = test_manager(config).await;

    let busy = manager.create_session(Some("busy")).unwrap();
    manager.create_session(Some("recent")).unwrap();
    clock.advance(secs(700));
    manager.find("recent").await.unwrap().unwrap();
    // Held by a request since before the sweep
    busy.access();
    clock.advance(secs(700));

    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.idle_swapped, 1);
    assert!(manager.is_loaded("busy"));
    assert!(!manager.is_loaded("recent"));
    busy.end_access();
}

#[tokio::test]
async fn test_capacity_sweep_drains_to_ninety_percent() {
    let config = PersistenceConfig::new()
        .with_max_active_sessions(100)
        .with_min_idle_swap(secs(30));
    let (manager, clock) = test_manager(config).await;

    for i in 0..95 {
        manager.create_session(Some(&format!("s{i}"))).unwrap();
    }
    clock.advance(secs(40));

    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.capacity_swapped, 5);
    assert_eq!(manager.active_count(), 90);
    assert_eq!(manager.store().saves(), 5);
    assert_eq!(manager.active_count_including_store().await, 95);
}

#[tokio::test]
async fn test_capacity_sweep_skips_unqualified_sessions() {
    let config = PersistenceConfig::new()
        .with_max_active_sessions(100)
        .with_min_idle_swap(secs(30));
    let (manager, clock) = test_manager(config).await;

    let mut sessions = Vec::new();
    for i in 0..95 {
        sessions.push(manager.create_session(Some(&format!("s{i}"))).unwrap());
    }
    clock.advance(secs(40));
    // 93 sessions are in use; only two may go
    for session in &sessions[..93] {
        session.access();
    }

    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.capacity_swapped, 2);
    assert_eq!(manager.active_count(), 93);
    for session in &sessions[..93] {
        assert!(manager.is_loaded(session.id()));
        session.end_access();
    }
}

#[tokio::test]
async fn test_capacity_sweep_ignores_young_sessions() {
    let config = PersistenceConfig::new()
        .with_max_active_sessions(100)
        .with_min_idle_swap(secs(30));
    let (manager, clock) = test_manager(config).await;

    for i in 0..99 {
        manager.create_session(Some(&format!("s{i}"))).unwrap();
    }
    clock.advance(secs(29));

    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.capacity_swapped, 0);
    assert_eq!(manager.active_count(), 99);
}

#[tokio::test]
async fn test_backup_sweep_respects_watermark() {
    let config = PersistenceConfig::new().with_max_idle_backup(secs(120));
    let (manager, clock) = test_manager(config).await;
    let session = manager.create_session(Some("S")).unwrap();

    clock.advance(secs(130));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.backed_up, 1);
    assert_eq!(manager.store().saves(), 1);
    assert!(manager.is_loaded("S"));
    assert_eq!(session.backup_watermark(), Some(session.last_accessed_time()));

    // Nothing changed: no second write
    clock.advance(secs(10));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.backed_up, 0);
    assert_eq!(manager.store().saves(), 1);

    // A new access makes the session dirty again
    manager.find("S").await.unwrap().unwrap();
    clock.advance(secs(130));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.backed_up, 1);
    assert_eq!(manager.store().saves(), 2);
    assert_eq!(manager.stats().backed_up, 2);
}

#[tokio::test]
async fn test_backup_sweep_skips_busy_session() {
    let config = PersistenceConfig::new().with_max_idle_backup(secs(120));
    let (manager, clock) = test_manager(config).await;
    let session = manager.create_session(Some("S")).unwrap();

    session.access();
    clock.advance(secs(130));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.backed_up, 0);
    assert_eq!(manager.store().saves(), 0);
    session.end_access();
}

#[tokio::test]
async fn test_sweeps_idle_while_unavailable() {
    let clock = Arc::new(ManualClock::starting_now());
    let config = PersistenceConfig::new().with_max_idle_swap(secs(10));
    let manager = PersistentManager::with_clock(config, CountingStore::default(), clock.clone());
    manager.create_session(Some("S")).unwrap();

    clock.advance(secs(60));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.idle_swapped, 0);
    assert!(manager.is_loaded("S"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Store failures
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_swap_out_keeps_session_resident() {
    let config = PersistenceConfig::new().with_max_idle_swap(secs(60));
    let (manager, clock) = test_manager(config).await;
    let session = manager.create_session(Some("S")).unwrap();
    session.set_attribute("k", "v");
    manager.store().fail_saves(true);

    assert!(manager.swap_out(&session).await.is_err());
    assert!(manager.is_loaded("S"));
    assert!(!session.is_recycled());
    assert_eq!(session.get_attribute("k"), Some("v".into()));

    clock.advance(secs(90));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.failures, 1);
    assert!(manager.is_loaded("S"));

    // Once the store recovers the next sweep succeeds
    manager.store().fail_saves(false);
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.idle_swapped, 1);
    assert!(!manager.is_loaded("S"));
}

#[tokio::test]
async fn test_sweep_failure_does_not_abort_batch() {
    let config = PersistenceConfig::new().with_max_idle_backup(secs(60));
    let (manager, clock) = test_manager(config).await;
    for i in 0..3 {
        manager.create_session(Some(&format!("s{i}"))).unwrap();
    }
    manager.store().fail_saves(true);

    clock.advance(secs(90));
    let report = manager.run_eviction_sweeps().await;
    assert_eq!(report.failures, 3);
    assert_eq!(report.backed_up, 0);
    assert_eq!(manager.active_count(), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Expiry, start and stop
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_process_expires_cleans_memory_and_store() {
    let config = PersistenceConfig::new().with_session_timeout(secs(60));
    let (manager, clock) = test_manager(config).await;

    manager.create_session(Some("resident")).unwrap();
    let parked = manager.create_session(Some("parked")).unwrap();
    manager.swap_out(&parked).await.unwrap();
    clock.advance(secs(30));
    manager.create_session(Some("fresh")).unwrap();

    clock.advance(secs(31));
    let report = manager.process_expires().await;
    assert_eq!(report.expired, 1);
    assert_eq!(report.store_expired, 1);
    assert!(!manager.is_loaded("resident"));
    assert!(manager.is_loaded("fresh"));
    assert_eq!(manager.stored_count().await.unwrap(), 0);
    assert_eq!(manager.stats().expired, 2);
}

#[tokio::test]
async fn test_stop_and_restart_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let config = PersistenceConfig::new();

    let first = PersistentManager::with_store(config.clone(), store.clone());
    first.start().await;
    for i in 0..3 {
        let session = first.create_session(Some(&format!("s{i}"))).unwrap();
        session.set_attribute("n", i);
    }

    let flush = first.stop().await;
    assert_eq!(flush.persisted, 3);
    assert_eq!(flush.expired, 0);
    assert_eq!(first.active_count(), 0);
    assert!(!first.is_available());
    assert_eq!(store.size().await.unwrap(), 3);

    let second = PersistentManager::with_store(config, store.clone());
    assert_eq!(second.start().await, 3);
    for i in 0..3 {
        let session = second.find(&format!("s{i}")).await.unwrap().unwrap();
        assert_eq!(session.get_attribute("n"), Some(i.into()));
    }
}

#[tokio::test]
async fn test_stop_without_store_expires_everything() {
    let manager = PersistentManager::new(PersistenceConfig::new());
    let recorder = Arc::new(Recorder::default());
    manager.add_listener(recorder.clone());
    manager.start().await;
    manager.create_session(Some("a")).unwrap();
    manager.create_session(Some("b")).unwrap();

    let flush = manager.stop().await;
    assert_eq!(flush.persisted, 0);
    assert_eq!(flush.expired, 2);
    assert_eq!(recorder.count(SessionEvent::Destroyed), 2);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_stop_without_save_on_restart_discards_store() {
    let config = PersistenceConfig::new().with_save_on_restart(false);
    let (manager, _) = test_manager(config).await;
    let session = manager.create_session(Some("a")).unwrap();
    manager.write_session(&session).await.unwrap();

    let flush = manager.stop().await;
    assert_eq!(flush.expired, 1);
    assert_eq!(manager.stored_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_stop_expires_sessions_it_cannot_persist() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    manager.create_session(Some("a")).unwrap();
    manager.create_session(Some("b")).unwrap();
    manager.store().fail_saves(true);

    let flush = manager.stop().await;
    assert_eq!(flush.persisted, 0);
    assert_eq!(flush.expired, 2);
    assert_eq!(flush.failed, 2);
    assert_eq!(manager.active_count(), 0);
}

#[tokio::test]
async fn test_stop_keeps_last_backup_of_unpersistable_session() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    let session = manager.create_session(Some("a")).unwrap();
    session.set_attribute("step", 1);
    manager.write_session(&session).await.unwrap();
    session.set_attribute("step", 2);
    manager.store().fail_saves(true);

    let flush = manager.stop().await;
    assert_eq!(flush.failed, 1);
    assert_eq!(flush.expired, 1);
    assert_eq!(manager.active_count(), 0);

    // The newer state is lost, the earlier backup is not
    let stored = manager.store().inner.load("a").await.unwrap().unwrap();
    assert_eq!(stored.attributes.get("step"), Some(&1.into()));
}

#[tokio::test]
async fn test_unload_then_load() {
    let (manager, _) = test_manager(PersistenceConfig::new()).await;
    for i in 0..4 {
        manager.create_session(Some(&format!("s{i}"))).unwrap();
    }

    assert_eq!(manager.unload().await, 4);
    assert_eq!(manager.active_count(), 0);
    assert_eq!(manager.load().await, 4);
    assert_eq!(manager.active_count(), 4);
}

// ─────────────────────────────────────────────────────────────────────────────
// File store and background sweeper
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PersistentManager::with_store(PersistenceConfig::new(), FileStore::new(dir.path()));
    manager.start().await;

    let session = manager.create_session(Some("on-disk")).unwrap();
    session.set_attribute("theme", "dark");
    manager.swap_out(&session).await.unwrap();
    assert!(dir.path().join("on-disk.session").is_file());

    let back = manager.find("on-disk").await.unwrap().unwrap();
    assert_eq!(back.get_attribute("theme"), Some("dark".into()));
}

#[tokio::test]
async fn test_background_sweeper_swaps_idle_sessions() {
    let config = PersistenceConfig::new().with_max_idle_swap(secs(600));
    let (manager, clock) = test_manager(config).await;
    manager.create_session(Some("S")).unwrap();
    clock.advance(secs(700));

    let sweeper = spawn_sweeper(manager.clone(), Duration::from_millis(20));
    let swapped = tokio::time::timeout(Duration::from_secs(2), async {
        while manager.is_loaded("S") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    sweeper.shutdown().await;

    assert!(swapped.is_ok());
    assert!(manager.store().inner.contains("S"));
}
