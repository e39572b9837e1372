//! Persistent session management with swap-out, swap-in and backup.
//!
//! This crate keeps a bounded working set of server-side sessions in memory
//! and moves the rest to a durable store:
//! - An active cache for the fast path, keyed by session id
//! - Per-id swap gates so a persisted session is loaded at most once, however
//!   many tasks ask for it concurrently
//! - Idle-swap, capacity-swap and idle-backup sweeps, planned as pure
//!   functions over session views and executed under per-session locks
//! - Pluggable stores (`NoStore`, `MemoryStore`, `FileStore`)
//!
//! # Example
//!
//! ```rust,ignore
//! use stowaway_session::{FileStore, PersistenceConfig, PersistentManager, spawn_sweeper};
//!
//! let config = PersistenceConfig::default()
//!     .with_max_idle_swap(Duration::from_secs(600))
//!     .with_min_idle_swap(Duration::from_secs(60))
//!     .with_max_idle_backup(Duration::from_secs(120));
//!
//! let manager = PersistentManager::with_store(config, FileStore::new("sessions"));
//! manager.start().await;
//! let sweeper = spawn_sweeper(manager.clone(), manager.config().sweep_interval);
//!
//! let session = manager.create_session(None)?;
//! let again = manager.find(session.id()).await?;
//! ```

mod cache;
mod clock;
mod config;
mod error;
mod eviction;
mod file_store;
mod gate;
mod manager;
mod session;
mod stats;
mod store;
mod swap;
mod sweeper;

pub use cache::ActiveCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::PersistenceConfig;
pub use error::{Error, Result};
pub use eviction::{
    SweepKind, SweepPolicy, SweepReport, capacity_deficit, plan_backups, plan_capacity_swaps,
    plan_idle_swaps,
};
pub use file_store::FileStore;
pub use gate::{GateGuard, LoadScope, SwapGates};
pub use manager::{ActivationHook, ExpireReport, FlushReport, PersistentManager};
pub use session::{
    BACKUP_WATERMARK_NOTE, ListenerRegistry, Session, SessionEvent, SessionLifecycle,
    SessionListener, SessionSnapshot, SessionView,
};
pub use stats::SessionStats;
pub use store::{MemoryStore, NoStore, Store};
pub use sweeper::{SweeperHandle, spawn_sweeper};
