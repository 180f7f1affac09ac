//! Periodic reconciliation
//!
//! Disabled when `sync.interval_secs` is 0. Runs until the token is cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::SyncReconciler;
use crate::storage::EntityKind;

/// Spawn the periodic reconciliation task, or return `None` when disabled.
pub fn spawn_periodic_sync(
    reconciler: Arc<SyncReconciler>,
    entities: Vec<EntityKind>,
    interval_secs: u64,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 || entities.is_empty() {
        info!("Periodic reconciliation disabled");
        return None;
    }

    info!(
        interval_secs,
        source = %reconciler.source(),
        destination = %reconciler.destination(),
        entities = ?entities,
        "Periodic reconciliation scheduled"
    );

    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        // Skip missed ticks if a run takes longer than the interval
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; wait a full period before the first run
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Periodic reconciliation stopped");
                    break;
                }
                _ = interval.tick() => {
                    match reconciler.reconcile_many(&entities).await {
                        Ok(reports) => {
                            let inserted: u64 = reports.iter().map(|r| r.inserted).sum();
                            info!(runs = reports.len(), inserted, "Periodic reconciliation finished");
                        }
                        Err(e) => {
                            error!(error = %e, "Periodic reconciliation failed; will retry next interval");
                        }
                    }
                }
            }
        }
    }))
}
