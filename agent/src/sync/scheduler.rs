//! Background loop that turns triggers into sync cycles.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::orchestrator::{SyncOrchestrator, SyncOutcome};
use crate::local::LocalStore;

/// Why a sync cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// The application came back to the foreground
    Foreground,
    /// The periodic timer fired
    Timer,
    /// A remote call succeeded after the remote store had been unreachable
    Mutation,
    /// Requested explicitly through the control API
    Manual,
}

/// Running scheduler task.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it to exit. A cycle already running
    /// finishes on its own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::warn!("Sync scheduler task failed: {}", e);
        }
    }
}

/// Spawn the scheduler loop.
///
/// Every trigger starts a cycle on its own task; triggers arriving while a
/// cycle runs are absorbed by the orchestrator's single-flight guard.
pub fn spawn(
    orchestrator: Arc<SyncOrchestrator>,
    local: Arc<LocalStore>,
    mut triggers: mpsc::Receiver<Trigger>,
    interval: Duration,
) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let join = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval_secs = interval.as_secs(), "Sync scheduler started");

        loop {
            let trigger = tokio::select! {
                _ = shutdown_rx.changed() => break,
                Some(trigger) = triggers.recv() => trigger,
                _ = ticker.tick() => Trigger::Timer,
            };

            if trigger == Trigger::Foreground {
                local.invalidate_cache(None);
            }
            tracing::debug!(?trigger, "Sync triggered");

            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                match orchestrator.start_sync().await {
                    SyncOutcome::Skipped { reason } => {
                        tracing::debug!(?trigger, ?reason, "Sync skipped");
                    }
                    SyncOutcome::Completed(report) => {
                        tracing::debug!(
                            ?trigger,
                            pushed = report.pushed,
                            pulled = report.pulled,
                            "Sync finished"
                        );
                    }
                }
            });
        }

        tracing::info!("Sync scheduler stopped");
    });

    SchedulerHandle { shutdown, join }
}
