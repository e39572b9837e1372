//! Background driver for periodic expiry and eviction.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::manager::PersistentManager;
use crate::store::Store;

/// Handle to a running background sweeper.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) stops
/// the sweeper after its current run.
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            tracing::warn!(error = %e, "Session sweeper task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run [`process_expires`](PersistentManager::process_expires) every
/// `interval` until the returned handle is shut down.
///
/// The first run happens one full interval after spawning. A zero interval
/// is treated as one millisecond.
pub fn spawn_sweeper<S: Store>(manager: PersistentManager<S>, interval: Duration) -> SweeperHandle {
    let interval = interval.max(Duration::from_millis(1));
    let (tx, mut rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut rx => {
                    tracing::debug!("Session sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = manager.process_expires().await;
                    tracing::trace!(
                        expired = report.expired,
                        swapped = report.sweeps.swapped(),
                        backed_up = report.sweeps.backed_up,
                        "Session sweep finished"
                    );
                }
            }
        }
    });

    SweeperHandle {
        shutdown: Some(tx),
        task,
    }
}
