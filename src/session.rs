// ABOUTME: Runtime session: one backend connection, its registry, dispatcher and poller.
// ABOUTME: Entry point of the library; every operation is keyed by logical name.

use crate::config::{BackendConfig, Config};
use crate::dispatcher::{DispatchSettings, Dispatcher, RetryPolicy};
use crate::error::Result as AppResult;
use crate::poller::{ReconcileReport, StatePoller, reconcile};
use crate::registry::{ContainerHandle, Registry};
use crate::runtime::{
    BackendKind, BackendVersion, ContainerError, ContainerSpec, CriDriver, DockerDriver, Driver,
    Endpoint, ExecOutput, ExecRequest, LogLines, LogOptions, SessionError, Signal, archive,
    resolve,
};
use crate::state::LifecycleState;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const MANAGED_LABEL: &str = "berth.managed";
pub const SESSION_LABEL: &str = "berth.session";
pub const HOST_LABEL: &str = "berth.host";

// =============================================================================
// Settings
// =============================================================================

/// Session behaviour independent of the backend connection.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub retry: RetryPolicy,
    /// `None` or a zero interval disables background polling.
    pub poll_interval: Option<Duration>,
    pub stop_timeout: Duration,
    pub kill_grace: Duration,
    pub remove_on_close: bool,
    /// Extra labels for every created container.
    pub labels: BTreeMap<String, String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Some(Duration::from_secs(5)),
            stop_timeout: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            remove_on_close: false,
            labels: BTreeMap::new(),
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        Ok(Self {
            retry: config.retry.clone(),
            poll_interval: (!config.poll_interval.is_zero()).then_some(config.poll_interval),
            stop_timeout: config.stop_timeout,
            kill_grace: config.kill_grace,
            remove_on_close: config.remove_on_close,
            labels: config.resolved_labels()?,
        })
    }
}

// =============================================================================
// Session
// =============================================================================

/// A connection to one backend plus the containers it manages.
///
/// Sessions are independent: each owns its driver, registry and poller.
/// Dropping a session stops its poller but leaves containers in place; call
/// [`RuntimeSession::close`] for an orderly shutdown.
pub struct RuntimeSession<D: ?Sized = dyn Driver> {
    id: Uuid,
    dispatcher: Dispatcher<D>,
    poller: Mutex<Option<StatePoller>>,
    remove_on_close: bool,
}

impl RuntimeSession {
    /// Open a session as described by `config`, detecting the backend when
    /// its kind is not configured.
    pub async fn open(config: &Config) -> AppResult<Self> {
        let settings = SessionSettings::from_config(config)?;
        let endpoint = config.backend.endpoint().map_err(SessionError::from)?;
        let detected = resolve(config.backend.kind, endpoint).map_err(SessionError::from)?;
        info!(backend = %detected.kind, endpoint = %detected.endpoint, "opening runtime session");

        let driver: Arc<dyn Driver> = match detected.kind {
            BackendKind::Docker => Arc::new(connect_docker(&detected.endpoint, &config.backend).await?),
            BackendKind::Cri => Arc::new(connect_cri(&detected.endpoint, &config.backend).await?),
        };
        Ok(Self::assemble(driver, settings))
    }
}

impl RuntimeSession<DockerDriver> {
    pub async fn open_docker(
        endpoint: &Endpoint,
        backend: &BackendConfig,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let driver = connect_docker(endpoint, backend).await?;
        Ok(Self::assemble(Arc::new(driver), settings))
    }
}

impl RuntimeSession<CriDriver> {
    pub async fn open_cri(
        endpoint: &Endpoint,
        backend: &BackendConfig,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let driver = connect_cri(endpoint, backend).await?;
        Ok(Self::assemble(Arc::new(driver), settings))
    }
}

impl<D: Driver> RuntimeSession<D> {
    /// Wrap an already constructed driver after checking it answers.
    pub async fn with_driver(driver: D, settings: SessionSettings) -> Result<Self, ContainerError> {
        driver.ping().await?;
        Ok(Self::assemble(Arc::new(driver), settings))
    }
}

async fn connect_docker(
    endpoint: &Endpoint,
    backend: &BackendConfig,
) -> Result<DockerDriver, SessionError> {
    let fail = |source| SessionError::Connect {
        backend: BackendKind::Docker,
        endpoint: endpoint.to_string(),
        source,
    };
    let driver = DockerDriver::connect(endpoint, backend.call_timeout).map_err(fail)?;
    ping_within(&driver, backend.connect_timeout)
        .await
        .map_err(fail)?;
    Ok(driver)
}

async fn connect_cri(
    endpoint: &Endpoint,
    backend: &BackendConfig,
) -> Result<CriDriver, SessionError> {
    let fail = |source| SessionError::Connect {
        backend: BackendKind::Cri,
        endpoint: endpoint.to_string(),
        source,
    };
    let driver = CriDriver::connect(endpoint, backend.cri_options())
        .await
        .map_err(fail)?;
    ping_within(&driver, backend.connect_timeout)
        .await
        .map_err(fail)?;
    Ok(driver)
}

async fn ping_within<D: Driver>(driver: &D, limit: Duration) -> Result<(), ContainerError> {
    tokio::time::timeout(limit, driver.ping())
        .await
        .map_err(|_| {
            ContainerError::Timeout(format!("no answer within {}s", limit.as_secs()))
        })?
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

impl<D: Driver + ?Sized> RuntimeSession<D> {
    fn assemble(driver: Arc<D>, settings: SessionSettings) -> Self {
        let id = Uuid::new_v4();
        let mut labels = settings.labels;
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(SESSION_LABEL.to_string(), id.to_string());
        labels.insert(HOST_LABEL.to_string(), hostname());

        let registry = Arc::new(Registry::new());
        let poller = settings
            .poll_interval
            .filter(|interval| !interval.is_zero())
            .map(|interval| StatePoller::spawn(driver.clone(), registry.clone(), interval));
        let dispatcher = Dispatcher::new(
            driver,
            registry,
            DispatchSettings {
                retry: settings.retry,
                stop_timeout: settings.stop_timeout,
                kill_grace: settings.kill_grace,
                labels,
            },
        );

        info!(session = %id, backend = dispatcher.driver().backend_name(), "runtime session opened");
        Self {
            id,
            dispatcher,
            poller: Mutex::new(poller),
            remove_on_close: settings.remove_on_close,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend_name(&self) -> &'static str {
        self.dispatcher.driver().backend_name()
    }

    pub async fn backend_version(&self) -> Result<BackendVersion, ContainerError> {
        self.dispatcher.driver().version().await
    }

    /// Labels applied to every container this session creates.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.dispatcher.settings().labels
    }

    pub fn is_closed(&self) -> bool {
        self.dispatcher.is_closed()
    }

    /// Whether a background poller is reconciling this session's handles.
    pub fn is_polling(&self) -> bool {
        self.poller.lock().is_some()
    }

    pub async fn create(
        &self,
        name: &str,
        spec: &ContainerSpec,
    ) -> Result<ContainerHandle, ContainerError> {
        self.dispatcher.create(name, spec).await
    }

    pub async fn start(&self, name: &str) -> Result<(), ContainerError> {
        self.dispatcher.start(name).await
    }

    /// Stop with `timeout`, or the configured stop timeout when `None`.
    pub async fn stop(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<LifecycleState, ContainerError> {
        self.dispatcher.stop(name, timeout).await
    }

    pub async fn signal(&self, name: &str, signal: Signal) -> Result<(), ContainerError> {
        self.dispatcher.signal(name, signal).await
    }

    pub async fn pause(&self, name: &str) -> Result<(), ContainerError> {
        self.dispatcher.pause(name).await
    }

    pub async fn unpause(&self, name: &str) -> Result<(), ContainerError> {
        self.dispatcher.unpause(name).await
    }

    pub async fn remove(&self, name: &str, force: bool) -> Result<(), ContainerError> {
        self.dispatcher.remove(name, force).await
    }

    pub async fn inspect(&self, name: &str) -> Result<LifecycleState, ContainerError> {
        self.dispatcher.inspect(name).await
    }

    pub async fn exec(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ContainerError> {
        self.dispatcher.exec(name, request).await
    }

    /// Start a command without waiting for it to finish.
    pub async fn exec_detached(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<(), ContainerError> {
        self.dispatcher.exec_detached(name, request).await
    }

    /// Run a command and stream its output lines as they arrive.
    pub async fn exec_stream(
        &self,
        name: &str,
        request: &ExecRequest,
    ) -> Result<LogLines, ContainerError> {
        self.dispatcher.exec_stream(name, request).await
    }

    pub async fn logs(&self, name: &str, opts: &LogOptions) -> Result<LogLines, ContainerError> {
        self.dispatcher.logs(name, opts).await
    }

    /// Copy a local file or directory into `dest_dir` inside the container.
    /// It lands under its own base name.
    pub async fn copy_to(
        &self,
        name: &str,
        local: &Path,
        dest_dir: &str,
    ) -> Result<(), ContainerError> {
        let local = local.to_path_buf();
        let tarball = tokio::task::spawn_blocking(move || archive::pack(&local))
            .await
            .map_err(|e| ContainerError::Transfer(e.to_string()))??;
        self.dispatcher.upload(name, dest_dir, tarball).await
    }

    /// Copy `path` out of the container into the local directory `local_dir`.
    ///
    /// Returns the top-level local paths written.
    pub async fn copy_from(
        &self,
        name: &str,
        path: &str,
        local_dir: &Path,
    ) -> Result<Vec<PathBuf>, ContainerError> {
        let tarball = self.dispatcher.download(name, path).await?;
        let local_dir = local_dir.to_path_buf();
        tokio::task::spawn_blocking(move || archive::unpack(&tarball, &local_dir))
            .await
            .map_err(|e| ContainerError::Transfer(e.to_string()))?
    }

    /// Force-remove containers an earlier session left under `name` on this
    /// host, so a fresh one can take its place. Containers with other extra
    /// labels, or from other hosts, are left alone.
    pub async fn purge_existing(&self, name: &str) -> Result<usize, ContainerError> {
        let mut selector = self.labels().clone();
        selector.remove(SESSION_LABEL);
        self.dispatcher.purge(name, &selector).await
    }

    pub async fn adopt(
        &self,
        name: &str,
        reference: &str,
    ) -> Result<ContainerHandle, ContainerError> {
        self.dispatcher.adopt(name, reference).await
    }

    pub fn resolve(&self, name: &str) -> Result<ContainerHandle, ContainerError> {
        self.dispatcher.resolve(name)
    }

    pub fn list(&self) -> Vec<ContainerHandle> {
        self.dispatcher.list()
    }

    /// Run one reconciliation pass now, outside the poller's schedule.
    pub async fn reconcile(&self) -> Result<ReconcileReport, ContainerError> {
        if self.is_closed() {
            return Err(ContainerError::SessionClosed);
        }
        Ok(reconcile(self.dispatcher.driver().as_ref(), self.dispatcher.registry()).await)
    }

    /// Stop the poller, optionally remove every container, and invalidate
    /// all handles. Later calls fail with `SessionClosed`.
    ///
    /// Removal failures are logged; the first one is returned once the
    /// session is closed regardless.
    pub async fn close(&self) -> Result<(), ContainerError> {
        if self.is_closed() {
            return Ok(());
        }
        let poller = self.poller.lock().take();
        if let Some(poller) = poller {
            poller.shutdown().await;
        }

        let mut first_error = None;
        if self.remove_on_close {
            for handle in self.dispatcher.list() {
                if let Err(err) = self.dispatcher.remove(handle.name.as_str(), true).await {
                    warn!(name = %handle.name, error = %err, "failed to remove container on close");
                    first_error.get_or_insert(err);
                }
            }
        }

        self.dispatcher.close();
        self.dispatcher.registry().clear();
        info!(session = %self.id, "runtime session closed");
        first_error.map_or(Ok(()), Err)
    }
}
