//! Configuration traits for decoupled config passing between crates.
//!
//! The session crate depends on the [`HasPersistenceConfig`] capability rather
//! than on the full TOML configuration structure, so callers can configure a
//! manager from a loaded config file, a test fixture, or anything in between.

use std::time::Duration;

/// Base trait for all configuration types.
///
/// Implementations should be cheaply cloneable and thread-safe.
pub trait ConfigProvider: Clone + Send + Sync + 'static {}

/// Persistent session manager configuration.
///
/// Every threshold is optional: `None` disables the policy it drives.
pub trait HasPersistenceConfig: ConfigProvider {
    /// Idle time after which an active session is backed up to the store
    /// without being evicted.
    fn max_idle_backup(&self) -> Option<Duration>;

    /// Minimum idle time before a session may be swapped out for any reason.
    fn min_idle_swap(&self) -> Option<Duration>;

    /// Idle time after which an active session is swapped out to the store.
    fn max_idle_swap(&self) -> Option<Duration>;

    /// Whether active sessions are persisted on shutdown and reloaded on start.
    fn save_on_restart(&self) -> bool {
        true
    }

    /// Maximum number of sessions resident in memory (None = unlimited).
    fn max_active_sessions(&self) -> Option<usize> {
        None
    }

    /// Default inactivity timeout assigned to newly created sessions.
    fn session_timeout(&self) -> Option<Duration> {
        Some(defaults::session_timeout())
    }

    /// Interval between background expiry and eviction sweeps.
    fn sweep_interval(&self) -> Duration {
        defaults::sweep_interval()
    }
}

/// Default persistence configuration values.
pub mod defaults {
    use std::time::Duration;

    pub const SESSION_TIMEOUT_SECS: u64 = 30 * 60;
    pub const SWEEP_INTERVAL_SECS: u64 = 60;
    pub const SAVE_ON_RESTART: bool = true;
    /// Percentage of `max_active_sessions` the capacity sweep drains down to.
    pub const CAPACITY_TARGET_PERCENT: usize = 90;

    pub fn session_timeout() -> Duration {
        Duration::from_secs(SESSION_TIMEOUT_SECS)
    }

    pub fn sweep_interval() -> Duration {
        Duration::from_secs(SWEEP_INTERVAL_SECS)
    }
}

/// Standalone persistence configuration.
#[derive(Debug, Clone)]
pub struct PersistenceConfigProvider {
    pub max_idle_backup: Option<Duration>,
    pub min_idle_swap: Option<Duration>,
    pub max_idle_swap: Option<Duration>,
    pub save_on_restart: bool,
    pub max_active_sessions: Option<usize>,
    pub session_timeout: Option<Duration>,
    pub sweep_interval: Duration,
}

impl Default for PersistenceConfigProvider {
    fn default() -> Self {
        Self {
            max_idle_backup: None,
            min_idle_swap: None,
            max_idle_swap: None,
            save_on_restart: defaults::SAVE_ON_RESTART,
            max_active_sessions: None,
            session_timeout: Some(defaults::session_timeout()),
            sweep_interval: defaults::sweep_interval(),
        }
    }
}

impl ConfigProvider for PersistenceConfigProvider {}

impl HasPersistenceConfig for PersistenceConfigProvider {
    fn max_idle_backup(&self) -> Option<Duration> {
        self.max_idle_backup
    }

    fn min_idle_swap(&self) -> Option<Duration> {
        self.min_idle_swap
    }

    fn max_idle_swap(&self) -> Option<Duration> {
        self.max_idle_swap
    }

    fn save_on_restart(&self) -> bool {
        self.save_on_restart
    }

    fn max_active_sessions(&self) -> Option<usize> {
        self.max_active_sessions
    }

    fn session_timeout(&self) -> Option<Duration> {
        self.session_timeout
    }

    fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// Convert a signed seconds value into an optional threshold.
///
/// Negative values mean "disabled", matching the convention used by
/// configuration files where `-1` switches a policy off.
pub fn secs_threshold(secs: i64) -> Option<Duration> {
    u64::try_from(secs).ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_config_defaults() {
        let config = PersistenceConfigProvider::default();
        assert!(config.max_idle_backup().is_none());
        assert!(config.min_idle_swap().is_none());
        assert!(config.max_idle_swap().is_none());
        assert!(config.save_on_restart());
        assert!(config.max_active_sessions().is_none());
        assert_eq!(config.session_timeout(), Some(defaults::session_timeout()));
        assert_eq!(config.sweep_interval(), defaults::sweep_interval());
    }

    #[test]
    fn test_custom_persistence_config() {
        let config = PersistenceConfigProvider {
            max_idle_swap: Some(Duration::from_secs(600)),
            min_idle_swap: Some(Duration::from_secs(60)),
            max_active_sessions: Some(100),
            save_on_restart: false,
            ..Default::default()
        };
        assert_eq!(config.max_idle_swap(), Some(Duration::from_secs(600)));
        assert_eq!(config.min_idle_swap(), Some(Duration::from_secs(60)));
        assert_eq!(config.max_active_sessions(), Some(100));
        assert!(!config.save_on_restart());
    }

    #[test]
    fn test_secs_threshold() {
        assert_eq!(secs_threshold(-1), None);
        assert_eq!(secs_threshold(0), Some(Duration::ZERO));
        assert_eq!(secs_threshold(120), Some(Duration::from_secs(120)));
    }
}
