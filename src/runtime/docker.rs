// ABOUTME: Docker Engine API driver built on bollard.
// ABOUTME: Normalizes HTTP status codes and engine states into the shared model.

use super::error::ContainerError;
use super::logs::split_lines;
use super::traits::sealed::Sealed;
use super::traits::{
    BackendVersion, ContainerOps, ContainerSpec, ExecOps, ExecOutput, ExecRequest, FileOps,
    LogLines, LogOps, LogOptions, LogStream, NetworkMode, RuntimeInfo, Signal,
};
use super::types::Endpoint;
use crate::state::LifecycleState;
use crate::types::{ContainerId, ExecId, LogicalName};
use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, ContainerStateStatusEnum, HostConfig, Mount, MountTypeEnum,
    RestartPolicy, RestartPolicyNameEnum,
};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, DownloadFromContainerOptions,
    InspectContainerOptions, KillContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Error Mapping Helpers
// =============================================================================

/// Messages the engine uses when the host runs out of something.
const EXHAUSTION_MARKERS: &[&str] = &[
    "no space left on device",
    "out of memory",
    "cannot allocate memory",
    "disk quota exceeded",
];

fn map_error(e: bollard::errors::Error) -> ContainerError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ContainerError::NotFound(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304 | 409,
            message,
        } => ContainerError::InvalidState(message),
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } if status_code >= 500 => {
            let lower = message.to_lowercase();
            if EXHAUSTION_MARKERS.iter().any(|m| lower.contains(m)) {
                ContainerError::ResourceExhausted(message)
            } else {
                ContainerError::BackendUnavailable(message)
            }
        }
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => ContainerError::InvalidState(format!("engine rejected request ({status_code}): {message}")),
        bollard::errors::Error::RequestTimeoutError => {
            ContainerError::Timeout("docker engine did not answer in time".to_string())
        }
        other => ContainerError::BackendUnavailable(other.to_string()),
    }
}

fn map_create_error(e: bollard::errors::Error) -> ContainerError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message,
        } => ContainerError::AlreadyExists(message),
        other => map_error(other),
    }
}

fn is_missing_image(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError { status_code: 404, message }
            if message.to_lowercase().contains("no such image")
    )
}

fn map_pull_error(e: bollard::errors::Error, image: &str) -> ContainerError {
    match &e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404 | 401 | 403,
            message,
        } => ContainerError::ImageNotFound(format!("{image}: {message}")),
        bollard::errors::Error::DockerResponseServerError { message, .. }
        | bollard::errors::Error::DockerStreamError { error: message }
            if pull_denied(message) =>
        {
            ContainerError::ImageNotFound(format!("{image}: {message}"))
        }
        _ => map_error(e),
    }
}

fn pull_denied(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["manifest unknown", "not found", "access denied", "repository does not exist"]
        .iter()
        .any(|m| lower.contains(m))
}

/// Engine status strings to lifecycle states.
pub fn map_status(status: Option<ContainerStateStatusEnum>, exit_code: Option<i64>) -> LifecycleState {
    match status {
        Some(ContainerStateStatusEnum::CREATED) => LifecycleState::Created,
        Some(ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::RESTARTING) => {
            LifecycleState::Running
        }
        Some(ContainerStateStatusEnum::PAUSED) => LifecycleState::Paused,
        Some(
            ContainerStateStatusEnum::EXITED
            | ContainerStateStatusEnum::DEAD
            | ContainerStateStatusEnum::REMOVING,
        ) => LifecycleState::Exited(exit_code),
        _ => LifecycleState::Unknown,
    }
}

/// Exit codes `timeout(1)` reports when it had to kill the command.
const TIMEOUT_EXIT_CODES: [i64; 2] = [124, 137];

/// Prefix the command with `timeout -s KILL` when the request has a limit.
fn timed_argv(request: &ExecRequest) -> Vec<String> {
    let mut cmd = request.argv();
    if let Some(timeout) = request.timeout {
        let secs = timeout.as_secs().max(1).to_string();
        let mut wrapped = vec!["timeout".to_string(), "-s".to_string(), "KILL".to_string(), secs];
        wrapped.append(&mut cmd);
        cmd = wrapped;
    }
    cmd
}

fn split_output(output: bollard::container::LogOutput) -> (LogStream, Bytes) {
    match output {
        bollard::container::LogOutput::StdErr { message } => (LogStream::Stderr, message),
        bollard::container::LogOutput::StdOut { message }
        | bollard::container::LogOutput::StdIn { message }
        | bollard::container::LogOutput::Console { message } => (LogStream::Stdout, message),
    }
}

// =============================================================================
// DockerDriver
// =============================================================================

/// Backend driver for the Docker Engine API.
pub struct DockerDriver {
    client: Docker,
    endpoint: String,
}

impl DockerDriver {
    /// Create a driver from an existing bollard client.
    pub fn new(client: Docker, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    /// Build a client for `endpoint`. No request is sent until the first call.
    ///
    /// `request_timeout` bounds every HTTP request, so it must exceed the
    /// longest graceful stop the caller intends to wait for.
    pub fn connect(endpoint: &Endpoint, request_timeout: Duration) -> Result<Self, ContainerError> {
        let secs = request_timeout.as_secs().max(1);
        let client = match endpoint {
            Endpoint::Unix(path) => Docker::connect_with_unix(
                &path.to_string_lossy(),
                secs,
                bollard::API_DEFAULT_VERSION,
            ),
            Endpoint::Tcp { host, port } => Docker::connect_with_http(
                &format!("tcp://{host}:{port}"),
                secs,
                bollard::API_DEFAULT_VERSION,
            ),
        }
        .map_err(|e| ContainerError::BackendUnavailable(e.to_string()))?;
        Ok(Self::new(client, endpoint.to_string()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn create_body(
        &self,
        spec: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> ContainerCreateBody {
        let env: Vec<String> = spec.env().iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut all_labels: HashMap<String, String> = spec
            .labels()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all_labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let resources = spec.resources();
        let mounts: Vec<Mount> = spec
            .mounts()
            .iter()
            .map(|m| Mount {
                source: Some(m.host_path.clone()),
                target: Some(m.container_path.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let network_mode = match spec.network() {
            NetworkMode::Default => None,
            NetworkMode::Host => Some("host".to_string()),
            NetworkMode::None => Some("none".to_string()),
            NetworkMode::Named(name) => Some(name.clone()),
        };

        let host_config = HostConfig {
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: None,
            }),
            memory: resources.memory_bytes.and_then(|m| i64::try_from(m).ok()),
            cpu_shares: resources.cpu_shares.and_then(|c| i64::try_from(c).ok()),
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            network_mode,
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(spec.image().to_string()),
            entrypoint: spec.command().map(<[String]>::to_vec),
            cmd: if spec.args().is_empty() {
                None
            } else {
                Some(spec.args().to_vec())
            },
            env: if env.is_empty() { None } else { Some(env) },
            labels: Some(all_labels),
            working_dir: spec.working_dir().map(str::to_string),
            tty: Some(spec.tty()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    /// Create an exec instance for `request`, attaching output when asked.
    async fn create_exec(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
        attach: bool,
    ) -> Result<ExecId, ContainerError> {
        let cmd = timed_argv(request);
        debug!(id = %container.short(), ?cmd, attach, "docker exec");

        let opts = bollard::models::ExecConfig {
            cmd: Some(cmd),
            working_dir: request.working_dir.clone(),
            attach_stdout: Some(attach),
            attach_stderr: Some(attach),
            ..Default::default()
        };

        let exec_id = self
            .client
            .create_exec(container.as_str(), opts)
            .await
            .map(|created| ExecId::new(created.id))
            .map_err(map_error)?;
        debug!(container = %container.short(), exec = %exec_id.short(), "exec created");
        Ok(exec_id)
    }

    async fn pull(&self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        let image = spec.image();
        info!(image = %image, "pulling image");
        let opts = CreateImageOptions {
            from_image: Some(image.name()),
            tag: image.digest().or(image.tag()).map(str::to_string),
            ..Default::default()
        };

        // Pull returns a stream of progress updates - consume it
        let mut stream = self.client.create_image(Some(opts), None, None);
        while let Some(result) = stream.next().await {
            let progress = result.map_err(|e| map_pull_error(e, &image.to_string()))?;
            if let Some(detail) = progress.error_detail.and_then(|d| d.message) {
                return Err(if pull_denied(&detail) {
                    ContainerError::ImageNotFound(format!("{image}: {detail}"))
                } else {
                    ContainerError::BackendUnavailable(detail)
                });
            }
        }
        Ok(())
    }
}

impl Sealed for DockerDriver {}

#[async_trait]
impl RuntimeInfo for DockerDriver {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<(), ContainerError> {
        self.client.ping().await.map_err(map_error)?;
        Ok(())
    }

    async fn version(&self) -> Result<BackendVersion, ContainerError> {
        let version = self.client.version().await.map_err(map_error)?;
        Ok(BackendVersion {
            name: "docker".to_string(),
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl ContainerOps for DockerDriver {
    async fn create(
        &self,
        name: &LogicalName,
        spec: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<ContainerId, ContainerError> {
        let body = self.create_body(spec, labels);
        debug!(name = %name, image = %spec.image(), "docker create");

        // Containers stay unnamed on the engine; the berth.name label carries
        // the logical name so retried creates never collide.
        let opts = None::<CreateContainerOptions>;
        let response = match self.client.create_container(opts.clone(), body.clone()).await {
            Ok(response) => response,
            Err(e) if is_missing_image(&e) => {
                self.pull(spec).await?;
                self.client
                    .create_container(opts, body)
                    .await
                    .map_err(map_create_error)?
            }
            Err(e) => return Err(map_create_error(e)),
        };

        Ok(ContainerId::new(response.id))
    }

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError> {
        debug!(id = %id.short(), "docker start");
        self.client
            .start_container(
                id.as_str(),
                None::<bollard::query_parameters::StartContainerOptions>,
            )
            .await
            .map_err(map_error)
    }

    async fn stop(&self, id: &ContainerId, timeout: Duration) -> Result<(), ContainerError> {
        debug!(id = %id.short(), timeout_secs = timeout.as_secs(), "docker stop");
        let opts = StopContainerOptions {
            t: Some(i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX)),
            signal: None,
        };

        match self.client.stop_container(id.as_str(), Some(opts)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_error(e)),
        }
    }

    async fn signal(&self, id: &ContainerId, signal: Signal) -> Result<(), ContainerError> {
        debug!(id = %id.short(), %signal, "docker kill");
        let opts = KillContainerOptions {
            signal: signal.as_str().to_string(),
        };
        self.client
            .kill_container(id.as_str(), Some(opts))
            .await
            .map_err(map_error)
    }

    async fn pause(&self, id: &ContainerId) -> Result<(), ContainerError> {
        debug!(id = %id.short(), "docker pause");
        self.client.pause_container(id.as_str()).await.map_err(map_error)
    }

    async fn unpause(&self, id: &ContainerId) -> Result<(), ContainerError> {
        debug!(id = %id.short(), "docker unpause");
        self.client.unpause_container(id.as_str()).await.map_err(map_error)
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), ContainerError> {
        debug!(id = %id.short(), force, "docker remove");
        let opts = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        self.client
            .remove_container(id.as_str(), Some(opts))
            .await
            .map_err(map_error)
    }

    async fn inspect(&self, id: &ContainerId) -> Result<LifecycleState, ContainerError> {
        let details = self
            .client
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;

        let state = details.state.as_ref();
        Ok(map_status(
            state.and_then(|s| s.status),
            state.and_then(|s| s.exit_code),
        ))
    }

    async fn lookup(&self, reference: &str) -> Result<ContainerId, ContainerError> {
        let details = self
            .client
            .inspect_container(reference, None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;
        details
            .id
            .map(ContainerId::new)
            .ok_or_else(|| ContainerError::NotFound(reference.to_string()))
    }

    async fn list_labelled(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerId>, ContainerError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        for (key, value) in labels {
            filters
                .entry("label".to_string())
                .or_default()
                .push(format!("{key}={value}"));
        }
        let opts = ListContainersOptions {
            all: true,
            filters: Some(filters),
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(opts))
            .await
            .map_err(map_error)?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.id)
            .map(ContainerId::new)
            .collect())
    }
}

#[async_trait]
impl ExecOps for DockerDriver {
    async fn exec(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ContainerError> {
        let exec_id = self.create_exec(container, request, true).await?;
        let started = self
            .client
            .start_exec(
                exec_id.as_str(),
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_error)?;

        let mut output = ExecOutput::default();
        if let StartExecResults::Attached { output: mut chunks, .. } = started {
            while let Some(item) = chunks.next().await {
                match item.map_err(map_error)? {
                    bollard::container::LogOutput::StdErr { message } => {
                        output.stderr.extend_from_slice(&message)
                    }
                    bollard::container::LogOutput::StdOut { message }
                    | bollard::container::LogOutput::Console { message } => {
                        output.stdout.extend_from_slice(&message)
                    }
                    bollard::container::LogOutput::StdIn { .. } => {}
                }
            }
        }

        let details = self
            .client
            .inspect_exec(exec_id.as_str())
            .await
            .map_err(map_error)?;
        output.exit_code = details.exit_code.unwrap_or(-1);

        if let Some(timeout) = request.timeout
            && TIMEOUT_EXIT_CODES.contains(&output.exit_code)
        {
            return Err(ContainerError::Timeout(format!(
                "exec in {} exceeded {}s",
                container.short(),
                timeout.as_secs().max(1)
            )));
        }
        Ok(output)
    }

    async fn exec_detached(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<(), ContainerError> {
        let exec_id = self.create_exec(container, request, false).await?;
        self.client
            .start_exec(
                exec_id.as_str(),
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_error)?;
        info!(container = %container.short(), exec = %exec_id.short(), "detached exec started");
        Ok(())
    }

    async fn exec_stream(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<LogLines, ContainerError> {
        let exec_id = self.create_exec(container, request, true).await?;
        let started = self
            .client
            .start_exec(
                exec_id.as_str(),
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(map_error)?;

        match started {
            StartExecResults::Attached { output, .. } => {
                let chunks = output.map(|item| item.map(split_output).map_err(map_error));
                Ok(split_lines(chunks, false))
            }
            StartExecResults::Detached => Ok(Box::pin(futures::stream::empty())),
        }
    }
}

#[async_trait]
impl FileOps for DockerDriver {
    async fn upload_archive(
        &self,
        id: &ContainerId,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), ContainerError> {
        debug!(id = %id.short(), dest_dir, bytes = archive.len(), "docker upload");
        let opts = UploadToContainerOptions {
            path: dest_dir.to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(id.as_str(), Some(opts), bollard::body_full(archive))
            .await
            .map_err(map_error)
    }

    async fn download_archive(&self, id: &ContainerId, path: &str) -> Result<Bytes, ContainerError> {
        debug!(id = %id.short(), path, "docker download");
        let opts = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let archive = self
            .client
            .download_from_container(id.as_str(), Some(opts))
            .map_err(map_error)
            .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await?;
        Ok(archive.freeze())
    }
}

#[async_trait]
impl LogOps for DockerDriver {
    async fn stream_logs(
        &self,
        id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<LogLines, ContainerError> {
        // Fail early on a missing container instead of on the first poll.
        self.client
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(map_error)?;

        let log_opts = LogsOptions {
            stdout: opts.stdout,
            stderr: opts.stderr,
            follow: opts.follow,
            timestamps: opts.timestamps,
            tail: opts
                .tail
                .map(|n| n.to_string())
                .unwrap_or_else(|| "all".to_string()),
            ..Default::default()
        };

        let chunks = self
            .client
            .logs(id.as_str(), Some(log_opts))
            .map(|result| result.map_err(map_error).map(split_output));

        Ok(split_lines(chunks, opts.timestamps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ErrorKind;

    fn server_error(status_code: u16, message: &str) -> bollard::errors::Error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message: message.to_string(),
        }
    }

    #[test]
    fn status_mapping() {
        use ContainerStateStatusEnum::*;
        assert_eq!(map_status(Some(CREATED), None), LifecycleState::Created);
        assert_eq!(map_status(Some(RUNNING), Some(0)), LifecycleState::Running);
        assert_eq!(map_status(Some(RESTARTING), None), LifecycleState::Running);
        assert_eq!(map_status(Some(PAUSED), None), LifecycleState::Paused);
        assert_eq!(map_status(Some(EXITED), Some(2)), LifecycleState::Exited(Some(2)));
        assert_eq!(map_status(Some(DEAD), Some(137)), LifecycleState::Exited(Some(137)));
        assert_eq!(map_status(None, None), LifecycleState::Unknown);
    }

    #[test]
    fn http_status_mapping() {
        assert!(matches!(
            map_error(server_error(404, "No such container: x")),
            ContainerError::NotFound(_)
        ));
        assert!(matches!(
            map_error(server_error(409, "is not running")),
            ContainerError::InvalidState(_)
        ));
        assert!(matches!(
            map_error(server_error(500, "no space left on device")),
            ContainerError::ResourceExhausted(_)
        ));
        assert!(matches!(
            map_error(server_error(502, "bad gateway")),
            ContainerError::BackendUnavailable(_)
        ));
        assert!(matches!(
            map_create_error(server_error(409, "name in use")),
            ContainerError::AlreadyExists(_)
        ));
        assert!(matches!(
            map_error(bollard::errors::Error::RequestTimeoutError),
            ContainerError::Timeout(_)
        ));
    }

    #[test]
    fn only_real_exhaustion_is_final() {
        let cases = [
            ("write /var/lib/docker/tmp: no space left on device", ErrorKind::ResourceExhausted),
            ("fork/exec: cannot allocate memory", ErrorKind::ResourceExhausted),
            ("container init: out of memory", ErrorKind::ResourceExhausted),
            ("mkdir /data: disk quota exceeded", ErrorKind::ResourceExhausted),
            ("resource temporarily unavailable", ErrorKind::BackendUnavailable),
            ("insufficient permissions on socket, retry", ErrorKind::BackendUnavailable),
            ("device or resource busy", ErrorKind::BackendUnavailable),
        ];
        for (message, kind) in cases {
            assert_eq!(map_error(server_error(500, message)).kind(), kind, "{message}");
        }
    }

    #[test]
    fn exec_timeout_wraps_command() {
        let request = ExecRequest::from_vec(vec!["sleep".into(), "30".into()]).unwrap();
        assert_eq!(timed_argv(&request), ["sleep", "30"]);

        let request = request.with_timeout(Duration::from_millis(1500));
        assert_eq!(timed_argv(&request), ["timeout", "-s", "KILL", "1", "sleep", "30"]);
    }

    #[test]
    fn missing_image_detection() {
        assert!(is_missing_image(&server_error(404, "No such image: nginx:latest")));
        assert!(!is_missing_image(&server_error(404, "No such container: abc")));
    }

    #[test]
    fn pull_failures_become_image_not_found() {
        assert!(matches!(
            map_pull_error(server_error(404, "manifest unknown"), "nope:1"),
            ContainerError::ImageNotFound(_)
        ));
        assert!(matches!(
            map_pull_error(server_error(500, "pull access denied for nope"), "nope:1"),
            ContainerError::ImageNotFound(_)
        ));
    }
}
