// ABOUTME: Background reconciliation of cached handle state with the backend.
// ABOUTME: Applies only forward transitions; unreachable backends mark handles Unknown.

use crate::registry::Registry;
use crate::runtime::{ContainerError, Driver};
use crate::state::LifecycleState;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Handles inspected.
    pub checked: usize,
    /// Handles whose cached state changed.
    pub updated: usize,
    /// Handles whose backend could not be reached.
    pub unreachable: usize,
    /// Handles found missing from the backend for the first time.
    pub vanished: usize,
}

/// Inspect every registered handle once and fold the results into the cache.
pub async fn reconcile<D: Driver + ?Sized>(driver: &D, registry: &Registry) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for entry in registry.entries() {
        if entry.is_removed() {
            continue;
        }
        report.checked += 1;

        let since = entry.generation();
        let mut vanished = false;
        let observed = match driver.inspect(entry.id()).await {
            Ok(state) => state,
            Err(ContainerError::NotFound(_)) => {
                debug!(name = %entry.name(), id = %entry.id().short(), "container not found during poll");
                vanished = true;
                LifecycleState::Exited(None)
            }
            Err(err @ (ContainerError::BackendUnavailable(_) | ContainerError::Timeout(_))) => {
                debug!(name = %entry.name(), error = %err, "backend unreachable during poll");
                report.unreachable += 1;
                LifecycleState::Unknown
            }
            Err(err) => {
                warn!(name = %entry.name(), error = %err, "poll inspect failed");
                continue;
            }
        };

        let _scope = entry.lock_scope().await;
        if entry.is_removed() {
            continue;
        }
        let before = entry.state();
        let was_exited = entry.confirmed_state().is_exited();
        if entry.apply_observed(since, observed) {
            report.updated += 1;
            if vanished && !was_exited {
                report.vanished += 1;
                warn!(
                    name = %entry.name(),
                    id = %entry.id().short(),
                    "container disappeared from backend"
                );
            }
            info!(name = %entry.name(), from = %before, to = %entry.state(), "state changed on backend");
        }
    }

    report
}

/// Periodic reconciliation task owned by a session.
pub struct StatePoller {
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StatePoller {
    /// Start polling every `interval`. The first pass runs one interval in.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero.
    pub fn spawn<D: Driver + ?Sized>(
        driver: Arc<D>,
        registry: Arc<Registry>,
        interval: Duration,
    ) -> Self {
        assert!(!interval.is_zero(), "poll interval must be non-zero");
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = ticker.tick() => {
                        let report = reconcile(driver.as_ref(), &registry).await;
                        debug!(?report, "poll pass complete");
                    }
                }
            }
            debug!("state poller stopped");
        });
        Self {
            shutdown,
            task: Some(task),
        }
    }

    /// Signal the task to stop and wait for it.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
            && err.is_panic()
        {
            warn!("state poller panicked");
        }
    }
}

impl Drop for StatePoller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
