//! Background loop reconciling every active run on a fixed interval.
//!
//! Runs are reconciled concurrently up to `max_concurrency`; a failure for one
//! run (an unreachable engine, say) is logged and retried on the next tick
//! without affecting the others.

use super::run_tracker::{ReconcileOutcome, RunLifecycleTracker};
use crate::config::ReconcilerConfig;
use crate::error::Result;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Counts from one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub transitioned: usize,
    pub unchanged: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct RunReconciler {
    tracker: Arc<RunLifecycleTracker>,
    config: ReconcilerConfig,
}

impl RunReconciler {
    pub fn new(tracker: Arc<RunLifecycleTracker>, config: ReconcilerConfig) -> Self {
        Self { tracker, config }
    }

    /// Reconcile every active run once.
    pub async fn reconcile_once(&self) -> Result<ReconcileSummary> {
        let active = self.tracker.store().list_active_runs().await?;
        let mut summary = ReconcileSummary {
            examined: active.len(),
            ..Default::default()
        };

        let results: Vec<_> = stream::iter(active)
            .map(|run| {
                let tracker = Arc::clone(&self.tracker);
                async move { (run.run_id, tracker.reconcile(run.run_id).await) }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        for (run_id, result) in results {
            match result {
                Ok(ReconcileOutcome::Transitioned { .. }) => summary.transitioned += 1,
                Ok(_) => summary.unchanged += 1,
                Err(e) => {
                    summary.failed += 1;
                    if e.is_transient() {
                        warn!(%run_id, error = %e, "Reconciliation deferred to next tick");
                    } else {
                        warn!(%run_id, error = %e, "Reconciliation failed");
                    }
                }
            }
        }

        debug!(?summary, "Reconciliation pass complete");
        Ok(summary)
    }

    /// Reconcile on every interval tick until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            interval_ms = self.config.interval_ms,
            max_concurrency = self.config.max_concurrency,
            "🔄 Run reconciler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_once().await {
                        warn!(error = %e, "Could not list active runs");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Run reconciler stopped");
    }

    /// Run the loop on a background task; send `true` on the returned sender to stop it.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        (handle, shutdown_tx)
    }
}
