//! Configuration types for stowaway.
//!
//! Maps the TOML layout:
//!
//! ```toml
//! [persistence]
//! max_idle_backup_secs = 120
//! min_idle_swap_secs = 60
//! max_idle_swap_secs = 600
//! max_active_sessions = 1000
//! save_on_restart = true
//!
//! [store]
//! directory = "/var/lib/stowaway/sessions"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stowaway_types::{ConfigProvider, HasPersistenceConfig, config_defaults, secs_threshold};

// ─────────────────────────────────────────────────────────────────────────────
// Root Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StowawayConfig {
    /// Swap and backup policy configuration.
    pub persistence: Option<PersistenceSection>,

    /// Durable store configuration.
    pub store: Option<StoreSection>,
}

impl StowawayConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: StowawayConfig) {
        if other.persistence.is_some() {
            self.persistence = other.persistence;
        }

        if other.store.is_some() {
            self.store = other.store;
        }
    }

    /// The effective persistence section (defaults when absent).
    pub fn persistence(&self) -> PersistenceSection {
        self.persistence.clone().unwrap_or_default()
    }

    /// Check thresholds for combinations that silently disable a policy.
    ///
    /// Returns human-readable warnings; none of these are fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let Some(ref p) = self.persistence else {
            return warnings;
        };

        let min_swap = p.min_idle_swap();
        let max_swap = p.max_idle_swap();
        let backup = p.max_idle_backup();

        if let (Some(min), Some(max)) = (min_swap, max_swap)
            && max < min
        {
            warnings.push(format!(
                "[persistence] max_idle_swap_secs ({}) is below min_idle_swap_secs ({}); \
                 idle swaps will wait for min_idle_swap_secs",
                max.as_secs(),
                min.as_secs()
            ));
        }

        if let (Some(backup), Some(max)) = (backup, max_swap)
            && backup >= max
        {
            warnings.push(format!(
                "[persistence] max_idle_backup_secs ({}) is not below max_idle_swap_secs ({}); \
                 sessions will be swapped out before they are ever backed up",
                backup.as_secs(),
                max.as_secs()
            ));
        }

        if p.max_active_sessions().is_some() && min_swap.is_none() {
            warnings.push(
                "[persistence] max_active_sessions is set without min_idle_swap_secs; \
                 capacity swapping stays disabled and new sessions are rejected at the limit"
                    .to_string(),
            );
        }

        warnings
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Swap and backup policy configuration.
///
/// All `*_secs` thresholds accept `-1` (or omission) to disable the policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    /// Back up sessions idle at least this long without evicting them.
    pub max_idle_backup_secs: i64,
    /// Never swap out a session idle for less than this.
    pub min_idle_swap_secs: i64,
    /// Swap out sessions idle at least this long.
    pub max_idle_swap_secs: i64,
    /// Persist active sessions on shutdown and reload them on start.
    pub save_on_restart: bool,
    /// Maximum number of sessions held in memory (-1 = unlimited).
    pub max_active_sessions: i64,
    /// Inactivity timeout for new sessions (-1 = never).
    pub session_timeout_secs: i64,
    /// Interval between background sweeps.
    pub sweep_interval_secs: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            max_idle_backup_secs: -1,
            min_idle_swap_secs: -1,
            max_idle_swap_secs: -1,
            save_on_restart: config_defaults::SAVE_ON_RESTART,
            max_active_sessions: -1,
            session_timeout_secs: config_defaults::SESSION_TIMEOUT_SECS as i64,
            sweep_interval_secs: config_defaults::SWEEP_INTERVAL_SECS,
        }
    }
}

impl ConfigProvider for PersistenceSection {}

impl HasPersistenceConfig for PersistenceSection {
    fn max_idle_backup(&self) -> Option<Duration> {
        secs_threshold(self.max_idle_backup_secs)
    }

    fn min_idle_swap(&self) -> Option<Duration> {
        secs_threshold(self.min_idle_swap_secs)
    }

    fn max_idle_swap(&self) -> Option<Duration> {
        secs_threshold(self.max_idle_swap_secs)
    }

    fn save_on_restart(&self) -> bool {
        self.save_on_restart
    }

    fn max_active_sessions(&self) -> Option<usize> {
        usize::try_from(self.max_active_sessions).ok()
    }

    fn session_timeout(&self) -> Option<Duration> {
        secs_threshold(self.session_timeout_secs).filter(|d| !d.is_zero())
    }

    fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Store Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Durable store configuration.
///
/// ```toml
/// [store]
/// directory = "/var/lib/stowaway/sessions"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Directory holding one file per persisted session.
    /// Defaults to `<data dir>/stowaway/sessions`.
    pub directory: Option<PathBuf>,
}

impl StoreSection {
    /// Resolve the store directory, falling back to the platform data dir.
    pub fn resolved_directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(default_store_dir)
    }
}

/// Default store directory: `<data dir>/stowaway/sessions`, or `./sessions`
/// when the platform has no data dir.
pub fn default_store_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("stowaway").join("sessions"))
        .unwrap_or_else(|| PathBuf::from("sessions"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
