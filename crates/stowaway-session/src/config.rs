//! Configuration for the persistent session manager.

use std::time::Duration;

use stowaway_types::{HasPersistenceConfig, config_defaults};

use crate::eviction::SweepPolicy;

/// Configuration for the persistent session manager.
///
/// All thresholds default to disabled; a manager built from the default
/// configuration keeps every session in memory until it expires.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Idle time after which a session is copied to the store while staying
    /// resident.
    pub max_idle_backup: Option<Duration>,

    /// Minimum idle time before a session may be swapped out for any reason.
    pub min_idle_swap: Option<Duration>,

    /// Idle time after which a session is swapped out unconditionally.
    pub max_idle_swap: Option<Duration>,

    /// Persist resident sessions on stop and reload them on start.
    pub save_on_restart: bool,

    /// Maximum number of resident sessions (None = unlimited).
    pub max_active_sessions: Option<usize>,

    /// Inactivity timeout assigned to newly created sessions.
    pub session_timeout: Option<Duration>,

    /// Interval between background sweeps.
    pub sweep_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_idle_backup: None,
            min_idle_swap: None,
            max_idle_swap: None,
            save_on_restart: config_defaults::SAVE_ON_RESTART,
            max_active_sessions: None,
            session_timeout: Some(config_defaults::session_timeout()),
            sweep_interval: config_defaults::sweep_interval(),
        }
    }
}

impl PersistenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from any configuration source exposing persistence settings.
    pub fn from_provider<C: HasPersistenceConfig>(provider: &C) -> Self {
        Self {
            max_idle_backup: provider.max_idle_backup(),
            min_idle_swap: provider.min_idle_swap(),
            max_idle_swap: provider.max_idle_swap(),
            save_on_restart: provider.save_on_restart(),
            max_active_sessions: provider.max_active_sessions(),
            session_timeout: provider.session_timeout(),
            sweep_interval: provider.sweep_interval(),
        }
    }

    pub fn with_max_idle_backup(mut self, idle: Duration) -> Self {
        self.max_idle_backup = Some(idle);
        self
    }

    pub fn with_min_idle_swap(mut self, idle: Duration) -> Self {
        self.min_idle_swap = Some(idle);
        self
    }

    pub fn with_max_idle_swap(mut self, idle: Duration) -> Self {
        self.max_idle_swap = Some(idle);
        self
    }

    pub fn with_save_on_restart(mut self, enabled: bool) -> Self {
        self.save_on_restart = enabled;
        self
    }

    pub fn with_max_active_sessions(mut self, max: usize) -> Self {
        self.max_active_sessions = Some(max);
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sessions created by the manager never time out.
    pub fn without_session_timeout(mut self) -> Self {
        self.session_timeout = None;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// The eviction thresholds as a sweep policy.
    pub fn sweep_policy(&self) -> SweepPolicy {
        SweepPolicy {
            max_idle_swap: self.max_idle_swap,
            min_idle_swap: self.min_idle_swap,
            max_idle_backup: self.max_idle_backup,
            max_active_sessions: self.max_active_sessions,
        }
    }
}
