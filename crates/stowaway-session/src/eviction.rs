//! Eviction policy engine.
//!
//! Three sweeps run in sequence, each over a fresh snapshot of the active
//! cache:
//!
//! 1. **Idle swap**: sessions idle for at least `max_idle_swap` (and
//!    `min_idle_swap`) are swapped out.
//! 2. **Capacity swap**: when more than 90% of `max_active_sessions` are
//!    resident, sessions idle for at least `min_idle_swap` are swapped out in
//!    snapshot order until the 90% line is reached or candidates run out.
//!    This is deliberately not LRU.
//! 3. **Idle backup**: sessions idle for at least `max_idle_backup` are
//!    written to the store without being evicted, unless nothing changed
//!    since their last backup.
//!
//! Planning is a pure function of session views and thresholds. Execution
//! re-checks every candidate under its transition lock and skips sessions
//! that are busy or no longer qualify.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use stowaway_types::config_defaults::CAPACITY_TARGET_PERCENT;
use tracing::{debug, trace};

use crate::error::Result;
use crate::manager::ManagerInner;
use crate::session::{Session, SessionView};
use crate::stats::StatsCounters;
use crate::store::Store;

/// Eviction thresholds. `None` disables the policy a threshold drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepPolicy {
    pub max_idle_swap: Option<Duration>,
    pub min_idle_swap: Option<Duration>,
    pub max_idle_backup: Option<Duration>,
    pub max_active_sessions: Option<usize>,
}

impl SweepPolicy {
    /// Whether the idle-swap sweep would swap this session out.
    pub fn qualifies_for_idle_swap(&self, view: &SessionView) -> bool {
        let Some(max_idle) = self.max_idle_swap else {
            return false;
        };
        is_idle_candidate(view)
            && view.idle >= max_idle
            && self.min_idle_swap.is_none_or(|min| view.idle >= min)
    }

    /// Whether the capacity sweep may swap this session out.
    pub fn qualifies_for_capacity_swap(&self, view: &SessionView) -> bool {
        match self.min_idle_swap {
            Some(min_idle) => is_idle_candidate(view) && view.idle >= min_idle,
            None => false,
        }
    }

    /// Whether the backup sweep would write this session.
    pub fn qualifies_for_backup(&self, view: &SessionView) -> bool {
        let Some(max_idle) = self.max_idle_backup else {
            return false;
        };
        is_idle_candidate(view)
            && view.idle >= max_idle
            && view.backup_watermark != Some(view.last_accessed)
    }

    /// Resident count the capacity sweep drains down to, if it is enabled.
    pub fn capacity_limit(&self) -> Option<usize> {
        match (self.max_active_sessions, self.min_idle_swap) {
            (Some(max), Some(_)) => Some(max.saturating_mul(CAPACITY_TARGET_PERCENT) / 100),
            _ => None,
        }
    }
}

fn is_idle_candidate(view: &SessionView) -> bool {
    view.valid && view.access_count == 0
}

/// Ids the idle-swap sweep selects.
pub fn plan_idle_swaps(views: &[SessionView], policy: &SweepPolicy) -> Vec<String> {
    views
        .iter()
        .filter(|v| policy.qualifies_for_idle_swap(v))
        .map(|v| v.id.clone())
        .collect()
}

/// How many sessions the capacity sweep must release to get back to the
/// capacity limit.
pub fn capacity_deficit(resident: usize, policy: &SweepPolicy) -> usize {
    policy
        .capacity_limit()
        .map_or(0, |limit| resident.saturating_sub(limit))
}

/// Ids the capacity sweep may release, in view order.
///
/// Every qualifying session is listed when there is a deficit at all; the
/// executor stops once [`capacity_deficit`] of them were actually swapped
/// out, so a candidate that turns out busy does not use up the quota.
pub fn plan_capacity_swaps(views: &[SessionView], policy: &SweepPolicy) -> Vec<String> {
    if capacity_deficit(views.len(), policy) == 0 {
        return Vec::new();
    }
    views
        .iter()
        .filter(|v| policy.qualifies_for_capacity_swap(v))
        .map(|v| v.id.clone())
        .collect()
}

/// Ids the backup sweep selects.
pub fn plan_backups(views: &[SessionView], policy: &SweepPolicy) -> Vec<String> {
    views
        .iter()
        .filter(|v| policy.qualifies_for_backup(v))
        .map(|v| v.id.clone())
        .collect()
}

/// Which sweep is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    IdleSwap,
    CapacitySwap,
    Backup,
}

impl SweepKind {
    const ALL: [SweepKind; 3] = [
        SweepKind::IdleSwap,
        SweepKind::CapacitySwap,
        SweepKind::Backup,
    ];

    fn plan(self, views: &[SessionView], policy: &SweepPolicy) -> Vec<String> {
        match self {
            SweepKind::IdleSwap => plan_idle_swaps(views, policy),
            SweepKind::CapacitySwap => plan_capacity_swaps(views, policy),
            SweepKind::Backup => plan_backups(views, policy),
        }
    }

    /// Upper bound on the sessions this sweep acts on, if any.
    fn quota(self, views: &[SessionView], policy: &SweepPolicy) -> Option<usize> {
        match self {
            SweepKind::CapacitySwap => Some(capacity_deficit(views.len(), policy)),
            SweepKind::IdleSwap | SweepKind::Backup => None,
        }
    }

    fn qualifies(self, policy: &SweepPolicy, view: &SessionView) -> bool {
        match self {
            SweepKind::IdleSwap => policy.qualifies_for_idle_swap(view),
            SweepKind::CapacitySwap => policy.qualifies_for_capacity_swap(view),
            SweepKind::Backup => policy.qualifies_for_backup(view),
        }
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepKind::IdleSwap => write!(f, "idle_swap"),
            SweepKind::CapacitySwap => write!(f, "capacity_swap"),
            SweepKind::Backup => write!(f, "idle_backup"),
        }
    }
}

/// What one pass of the three sweeps did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub idle_swapped: usize,
    pub capacity_swapped: usize,
    pub backed_up: usize,
    /// Candidates skipped because the store failed.
    pub failures: usize,
}

impl SweepReport {
    fn record(&mut self, kind: SweepKind) {
        match kind {
            SweepKind::IdleSwap => self.idle_swapped += 1,
            SweepKind::CapacitySwap => self.capacity_swapped += 1,
            SweepKind::Backup => self.backed_up += 1,
        }
    }

    /// Sessions released from memory by this pass.
    pub fn swapped(&self) -> usize {
        self.idle_swapped + self.capacity_swapped
    }
}

impl<S: Store> ManagerInner<S> {
    pub(crate) async fn run_eviction_sweeps(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if !self.is_available() {
            return report;
        }

        let policy = self.config.read().sweep_policy();
        for kind in SweepKind::ALL {
            let views = self.views();
            let quota = kind.quota(&views, &policy);
            let mut done = 0;
            for id in kind.plan(&views, &policy) {
                if quota.is_some_and(|quota| done >= quota) {
                    break;
                }
                match self.execute(kind, &id, &policy).await {
                    Ok(true) => {
                        report.record(kind);
                        done += 1;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        // Already logged where it happened; keep sweeping.
                        debug!(session_id = %id, sweep = %kind, error = %e, "Sweep skipped session");
                        report.failures += 1;
                    }
                }
            }
        }

        if report != SweepReport::default() {
            debug!(
                idle_swapped = report.idle_swapped,
                capacity_swapped = report.capacity_swapped,
                backed_up = report.backed_up,
                failures = report.failures,
                active = self.cache.len(),
                "Eviction sweeps complete"
            );
        }
        report
    }

    fn views(&self) -> Vec<SessionView> {
        let now = self.clock.now();
        self.cache.snapshot().iter().map(|s| s.view(now)).collect()
    }

    async fn execute(&self, kind: SweepKind, id: &str, policy: &SweepPolicy) -> Result<bool> {
        let Some(session) = self.cache.lookup(id) else {
            return Ok(false);
        };
        let Ok(_transition) = session.transition().try_lock() else {
            trace!(session_id = %id, sweep = %kind, "Session busy, skipping");
            return Ok(false);
        };
        if !self.cache.holds(&session) {
            return Ok(false);
        }

        let view = session.view(self.clock.now());
        if !kind.qualifies(policy, &view) {
            return Ok(false);
        }

        match kind {
            SweepKind::IdleSwap | SweepKind::CapacitySwap => {
                trace!(session_id = %id, sweep = %kind, idle_secs = view.idle.as_secs(), "Swapping out session");
                self.swap_out_locked(&session).await
            }
            SweepKind::Backup => self.back_up(&session, &view).await,
        }
    }

    async fn back_up(&self, session: &Arc<Session>, view: &SessionView) -> Result<bool> {
        trace!(session_id = %view.id, idle_secs = view.idle.as_secs(), "Backing up session");
        if !self.write_session(session).await? {
            return Ok(false);
        }
        session.set_backup_watermark(view.last_accessed);
        StatsCounters::bump(&self.stats.backed_up);
        Ok(true)
    }
}
