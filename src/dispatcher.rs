// ABOUTME: Lifecycle operations keyed by logical name, validated against cached state.
// ABOUTME: Serializes same-name operations, retries transient failures, escalates stops.

use crate::registry::{ContainerHandle, HandleEntry, Registry};
use crate::runtime::{
    ContainerError, ContainerSpec, Driver, ExecOutput, ExecRequest, LogLines, LogOptions, Signal,
    SpecError,
};
use crate::state::{LifecycleState, Operation};
use crate::types::{ContainerId, LogicalName};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Label carrying the logical name on every container a session creates.
pub const NAME_LABEL: &str = "berth.name";

/// Interval between inspects while waiting for a stopped container to exit.
const CONFIRM_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded exponential backoff for `BackendUnavailable` failures.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, never retried.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Knobs the dispatcher applies to every operation.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub retry: RetryPolicy,
    /// Graceful stop timeout used when the caller gives none.
    pub stop_timeout: Duration,
    /// Extra time granted to a backend before a stop escalates to SIGKILL.
    pub kill_grace: Duration,
    /// Labels applied to every created container.
    pub labels: BTreeMap<String, String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stop_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            labels: BTreeMap::new(),
        }
    }
}

/// Validates lifecycle operations and forwards them to a driver.
///
/// State-changing operations on one name hold that handle's scope for their
/// whole duration, so they apply in some serial order. Operations on
/// different names never wait on each other.
pub struct Dispatcher<D: ?Sized> {
    driver: Arc<D>,
    registry: Arc<Registry>,
    settings: DispatchSettings,
    closed: AtomicBool,
}

impl<D: Driver + ?Sized> Dispatcher<D> {
    pub fn new(driver: Arc<D>, registry: Arc<Registry>, settings: DispatchSettings) -> Self {
        Self {
            driver,
            registry,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ContainerError> {
        if self.is_closed() {
            return Err(ContainerError::SessionClosed);
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, ContainerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ContainerError>>,
    {
        let policy = &self.settings.retry;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        op,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Inspect the backend, reading a vanished container as exited.
    async fn observe(&self, entry: &HandleEntry) -> Result<LifecycleState, ContainerError> {
        match self.with_retry("inspect", || self.driver.inspect(entry.id())).await {
            Err(ContainerError::NotFound(_)) => Ok(LifecycleState::Exited(None)),
            other => other,
        }
    }

    /// Take the handle's scope and check that `op` is legal from its state.
    async fn acquire(
        &self,
        name: &str,
        op: Operation,
    ) -> Result<(Arc<HandleEntry>, OwnedMutexGuard<()>), ContainerError> {
        self.ensure_open()?;
        let entry = self.registry.entry(name)?;
        let scope = entry.lock_scope().await;
        self.ensure_open()?;
        if entry.is_removed() {
            return Err(ContainerError::NotFound(name.to_string()));
        }

        if entry.state() == LifecycleState::Unknown {
            let since = entry.generation();
            let observed = self.observe(&entry).await?;
            entry.apply_observed(since, observed);
        }
        let state = entry.state();
        if !op.allowed_from(state) {
            return Err(ContainerError::InvalidState(format!(
                "cannot {op} '{name}' while it is {state}"
            )));
        }
        Ok((entry, scope))
    }

    /// Create a container and register it under `name`.
    pub async fn create(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle, ContainerError> {
        self.ensure_open()?;
        let name = LogicalName::new(name).map_err(SpecError::from)?;
        if self.registry.contains(name.as_str()) {
            return Err(ContainerError::AlreadyExists(name.to_string()));
        }

        let mut labels = self.settings.labels.clone();
        labels.insert(NAME_LABEL.to_string(), name.to_string());
        let id = self
            .with_retry("create", || self.driver.create(&name, spec, &labels))
            .await?;

        match self
            .registry
            .register(ContainerHandle::new(name.clone(), id.clone(), LifecycleState::Created))
        {
            Ok(entry) => {
                info!(name = %name, id = %id.short(), image = %spec.image(), "container created");
                Ok(entry.snapshot())
            }
            Err(err) => {
                warn!(name = %name, id = %id.short(), "name registered concurrently, discarding container");
                if let Err(cleanup) = self.driver.remove(&id, true).await {
                    warn!(id = %id.short(), error = %cleanup, "failed to remove duplicate container");
                }
                Err(err)
            }
        }
    }

    pub async fn start(&self, name: &str) -> Result<(), ContainerError> {
        let (entry, _scope) = self.acquire(name, Operation::Start).await?;
        self.with_retry("start", || self.driver.start(entry.id())).await?;
        entry.set_state(LifecycleState::Running);
        info!(name, id = %entry.id().short(), "container started");
        Ok(())
    }

    /// Stop gracefully, escalating to SIGKILL, and return the exit state.
    pub async fn stop(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<LifecycleState, ContainerError> {
        let (entry, _scope) = self.acquire(name, Operation::Stop).await?;
        let timeout = timeout.unwrap_or(self.settings.stop_timeout);
        self.stop_inner(&entry, timeout).await
    }

    async fn stop_inner(
        &self,
        entry: &HandleEntry,
        timeout: Duration,
    ) -> Result<LifecycleState, ContainerError> {
        let id = entry.id();
        let budget = timeout + self.settings.kill_grace;
        debug!(name = %entry.name(), id = %id.short(), timeout_secs = timeout.as_secs(), "stopping container");

        let graceful = tokio::time::timeout(
            budget,
            self.with_retry("stop", || self.driver.stop(id, timeout)),
        )
        .await;
        match graceful {
            Ok(Ok(())) => {}
            Ok(Err(ContainerError::Timeout(reason))) => self.escalate(entry, &reason).await?,
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                let reason = format!("no answer within {}s", budget.as_secs());
                self.escalate(entry, &reason).await?;
            }
        }

        let state = self.confirm_exited(entry).await?;
        entry.set_state(state);
        info!(name = %entry.name(), id = %id.short(), %state, "container stopped");
        Ok(state)
    }

    async fn escalate(&self, entry: &HandleEntry, reason: &str) -> Result<(), ContainerError> {
        let id = entry.id();
        warn!(name = %entry.name(), id = %id.short(), reason, "graceful stop failed, sending SIGKILL");
        let grace = self.settings.kill_grace;
        let kill = self.with_retry("signal", || self.driver.signal(id, Signal::Kill));
        match tokio::time::timeout(grace, kill).await {
            // InvalidState: the container exited between the stop and the kill.
            Ok(Ok(())) | Ok(Err(ContainerError::InvalidState(_))) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ContainerError::Timeout(format!(
                "container {} did not answer SIGKILL within {}s",
                id.short(),
                grace.as_secs()
            ))),
        }
    }

    /// Poll the backend until it reports the container exited or gone.
    async fn confirm_exited(&self, entry: &HandleEntry) -> Result<LifecycleState, ContainerError> {
        let deadline = Instant::now() + self.settings.kill_grace;
        loop {
            let last = match self.driver.inspect(entry.id()).await {
                Ok(state) if state.is_exited() => return Ok(state),
                Ok(state) => state,
                Err(ContainerError::NotFound(_)) => return Ok(LifecycleState::Exited(None)),
                Err(err) if err.is_transient() => LifecycleState::Unknown,
                Err(err) => return Err(err),
            };
            if Instant::now() >= deadline {
                return Err(ContainerError::Timeout(format!(
                    "container {} still {last} after stop",
                    entry.id().short()
                )));
            }
            tokio::time::sleep(CONFIRM_INTERVAL).await;
        }
    }

    /// Deliver a signal. The resulting state is left for the next observation.
    pub async fn signal(&self, name: &str, signal: Signal) -> Result<(), ContainerError> {
        let (entry, _scope) = self.acquire(name, Operation::Signal).await?;
        self.with_retry("signal", || self.driver.signal(entry.id(), signal))
            .await?;
        info!(name, id = %entry.id().short(), %signal, "signal delivered");
        Ok(())
    }

    pub async fn pause(&self, name: &str) -> Result<(), ContainerError> {
        let (entry, _scope) = self.acquire(name, Operation::Pause).await?;
        self.with_retry("pause", || self.driver.pause(entry.id())).await?;
        entry.set_state(LifecycleState::Paused);
        info!(name, id = %entry.id().short(), "container paused");
        Ok(())
    }

    pub async fn unpause(&self, name: &str) -> Result<(), ContainerError> {
        let (entry, _scope) = self.acquire(name, Operation::Unpause).await?;
        self.with_retry("unpause", || self.driver.unpause(entry.id()))
            .await?;
        entry.set_state(LifecycleState::Running);
        info!(name, id = %entry.id().short(), "container unpaused");
        Ok(())
    }

    /// Remove the container and drop its handle.
    ///
    /// With `force`, a running or paused container is stopped first using
    /// the configured stop timeout. A container already gone from the backend
    /// counts as removed.
    pub async fn remove(&self, name: &str, force: bool) -> Result<(), ContainerError> {
        let op = if force {
            Operation::ForceRemove
        } else {
            Operation::Remove
        };
        let (entry, _scope) = self.acquire(name, op).await?;

        if force && entry.state().is_live() {
            match self.stop_inner(&entry, self.settings.stop_timeout).await {
                Ok(_) | Err(ContainerError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }

        match self
            .with_retry("remove", || self.driver.remove(entry.id(), force))
            .await
        {
            Ok(()) => {}
            Err(ContainerError::NotFound(_)) => {
                debug!(name, id = %entry.id().short(), "container already gone from backend");
            }
            Err(err) => return Err(err),
        }

        self.registry.unregister_entry(&entry);
        info!(name, id = %entry.id().short(), "container removed");
        Ok(())
    }

    /// Ask the backend for the container's state.
    ///
    /// The answer refreshes the cache only when no other operation holds the
    /// handle and the move is a legal forward transition.
    pub async fn inspect(&self, name: &str) -> Result<LifecycleState, ContainerError> {
        self.ensure_open()?;
        let entry = self.registry.entry(name)?;
        let since = entry.generation();
        let observed = self
            .with_retry("inspect", || self.driver.inspect(entry.id()))
            .await?;
        if let Some(_scope) = entry.try_lock_scope()
            && !entry.is_removed()
            && entry.apply_observed(since, observed)
        {
            debug!(name, state = %entry.state(), "cached state refreshed");
        }
        Ok(observed)
    }

    /// Resolve `name` for an exec, checking the container is running.
    async fn exec_target(&self, name: &str) -> Result<Arc<HandleEntry>, ContainerError> {
        self.ensure_open()?;
        let entry = self.registry.entry(name)?;

        let mut state = entry.state();
        if state == LifecycleState::Unknown {
            let since = entry.generation();
            state = self.observe(&entry).await?;
            if let Some(_scope) = entry.try_lock_scope() {
                entry.apply_observed(since, state);
            }
        }
        if !Operation::Exec.allowed_from(state) {
            return Err(ContainerError::InvalidState(format!(
                "cannot exec in '{name}' while it is {state}"
            )));
        }
        Ok(entry)
    }

    /// Run a command in a running container.
    ///
    /// Exec is not retried: a command that reached the backend may have run.
    pub async fn exec(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ContainerError> {
        let entry = self.exec_target(name).await?;
        debug!(name, id = %entry.id().short(), cmd = %request.cmd.head, "exec");
        let call = self.driver.exec(entry.id(), request);
        match request.timeout {
            Some(timeout) => {
                let deadline = timeout + self.settings.kill_grace;
                tokio::time::timeout(deadline, call).await.map_err(|_| {
                    ContainerError::Timeout(format!(
                        "exec in '{name}' exceeded {}s",
                        timeout.as_secs()
                    ))
                })?
            }
            None => call.await,
        }
    }

    /// Start a command in a running container without waiting for it.
    pub async fn exec_detached(&self, name: &str, request: &ExecRequest) -> Result<(), ContainerError> {
        let entry = self.exec_target(name).await?;
        debug!(name, id = %entry.id().short(), cmd = %request.cmd.head, "detached exec");
        self.driver.exec_detached(entry.id(), request).await
    }

    /// Run a command in a running container and stream its output lines.
    pub async fn exec_stream(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<LogLines, ContainerError> {
        let entry = self.exec_target(name).await?;
        debug!(name, id = %entry.id().short(), cmd = %request.cmd.head, "streamed exec");
        self.driver.exec_stream(entry.id(), request).await
    }

    /// Extract a tar archive into `dest_dir` inside the container.
    ///
    /// Any state but removed is fine; engines copy into stopped containers too.
    pub async fn upload(
        &self,
        name: &str,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), ContainerError> {
        self.ensure_open()?;
        let entry = self.registry.entry(name)?;
        self.with_retry("upload", || {
            self.driver.upload_archive(entry.id(), dest_dir, archive.clone())
        })
        .await?;
        info!(name, id = %entry.id().short(), dest_dir, bytes = archive.len(), "archive uploaded");
        Ok(())
    }

    /// Fetch `path` from inside the container as a tar archive.
    pub async fn download(&self, name: &str, path: &str) -> Result<Bytes, ContainerError> {
        self.ensure_open()?;
        let entry = self.registry.entry(name)?;
        let archive = self
            .with_retry("download", || self.driver.download_archive(entry.id(), path))
            .await?;
        debug!(name, id = %entry.id().short(), path, bytes = archive.len(), "archive downloaded");
        Ok(archive)
    }

    /// Force-remove backend containers left behind under `name` by earlier
    /// runs. Only containers carrying every label in `selector` plus the name
    /// label are touched, and never one a handle in this session points at.
    ///
    /// Returns how many containers were removed.
    pub async fn purge(
        &self,
        name: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<usize, ContainerError> {
        self.ensure_open()?;
        let name = LogicalName::new(name).map_err(SpecError::from)?;
        let mut labels = selector.clone();
        labels.insert(NAME_LABEL.to_string(), name.to_string());

        let found: Vec<ContainerId> = self
            .with_retry("list", || self.driver.list_labelled(&labels))
            .await?;
        let mut removed = 0;
        for id in found {
            if self.registry.find_by_id(&id).is_some() {
                continue;
            }
            match self.with_retry("remove", || self.driver.remove(&id, true)).await {
                Ok(()) => {
                    info!(name = %name, id = %id.short(), "removed leftover container");
                    removed += 1;
                }
                Err(ContainerError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(removed)
    }

    /// Open a log stream. Does not take the handle's scope.
    pub async fn logs(&self, name: &str, opts: &LogOptions) -> Result<LogLines, ContainerError> {
        self.ensure_open()?;
        let entry = self.registry.entry(name)?;
        self.with_retry("logs", || self.driver.stream_logs(entry.id(), opts))
            .await
    }

    /// Register a container that already exists on the backend.
    pub async fn adopt(
        &self,
        name: &str,
        reference: &str,
    ) -> Result<ContainerHandle, ContainerError> {
        self.ensure_open()?;
        let name = LogicalName::new(name).map_err(SpecError::from)?;
        if self.registry.contains(name.as_str()) {
            return Err(ContainerError::AlreadyExists(name.to_string()));
        }

        let id = self
            .with_retry("lookup", || self.driver.lookup(reference))
            .await?;
        if let Some(existing) = self.registry.find_by_id(&id) {
            return Err(ContainerError::AlreadyExists(format!(
                "container {} is already registered as '{}'",
                id.short(),
                existing.name
            )));
        }
        let state = self
            .with_retry("inspect", || self.driver.inspect(&id))
            .await?;

        let entry = self
            .registry
            .register(ContainerHandle::new(name.clone(), id.clone(), state))?;
        info!(name = %name, id = %id.short(), %state, "container adopted");
        Ok(entry.snapshot())
    }

    pub fn resolve(&self, name: &str) -> Result<ContainerHandle, ContainerError> {
        self.ensure_open()?;
        self.registry.resolve(name)
    }

    pub fn list(&self) -> Vec<ContainerHandle> {
        self.registry.list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(30), Duration::from_secs(5));
    }

    #[test]
    fn retry_policy_from_yaml() {
        let policy: RetryPolicy =
            serde_yaml::from_str("max_attempts: 2\ninitial_backoff: 1s\n").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(5));
    }
}
