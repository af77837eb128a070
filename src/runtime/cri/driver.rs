// ABOUTME: CRI backend driver: one pod sandbox per container.
// ABOUTME: Maps container operations onto RuntimeService and ImageService calls.

use super::logs::{ExitCheck, read_log_file};
use super::proto::{self, NamespaceMode};
use super::{CriClient, method};
use crate::runtime::error::ContainerError;
use crate::runtime::traits::sealed::Sealed;
use crate::runtime::traits::{
    BackendVersion, ContainerOps, ContainerSpec, ExecOps, ExecOutput, ExecRequest, FileOps,
    LogLines, LogOps, LogOptions, NetworkMode, RuntimeInfo, Signal,
};
use crate::runtime::types::Endpoint;
use crate::state::LifecycleState;
use crate::types::{ContainerId, LogicalName, SandboxId};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label kubelet puts on every container; used to find containers by name.
const KUBE_CONTAINER_NAME: &str = "io.kubernetes.container.name";
const BERTH_NAME: &str = "berth.name";

/// Settings for a CRI connection.
#[derive(Debug, Clone)]
pub struct CriOptions {
    /// Pod namespace recorded in sandbox metadata.
    pub namespace: String,
    /// Directory under which sandbox log directories are created.
    pub log_root: PathBuf,
    pub connect_timeout: Duration,
    /// Deadline for each gRPC call.
    pub call_timeout: Duration,
}

impl Default for CriOptions {
    fn default() -> Self {
        Self {
            namespace: "berth".to_string(),
            log_root: PathBuf::from("/var/log/berth"),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(120),
        }
    }
}

/// Backend driver for the Kubernetes Container Runtime Interface.
pub struct CriDriver {
    client: CriClient,
    opts: CriOptions,
    /// Sandboxes this driver created, torn down with their container.
    sandboxes: Mutex<HashMap<ContainerId, SandboxId>>,
}

impl CriDriver {
    /// Open a gRPC channel to the runtime.
    pub async fn connect(endpoint: &Endpoint, opts: CriOptions) -> Result<Self, ContainerError> {
        let client = CriClient::connect(endpoint, opts.connect_timeout, opts.call_timeout).await?;
        Ok(Self {
            client,
            opts,
            sandboxes: Mutex::new(HashMap::new()),
        })
    }

    fn sandbox_config(
        &self,
        name: &LogicalName,
        network: NamespaceMode,
        labels: &HashMap<String, String>,
    ) -> proto::PodSandboxConfig {
        let uid = Uuid::new_v4().to_string();
        let log_directory = self
            .opts
            .log_root
            .join(format!("{}_{}_{}", self.opts.namespace, name, uid));
        proto::PodSandboxConfig {
            metadata: Some(proto::PodSandboxMetadata {
                name: name.to_string(),
                uid,
                namespace: self.opts.namespace.clone(),
                attempt: 0,
            }),
            hostname: name.to_string(),
            log_directory: log_directory.to_string_lossy().into_owned(),
            labels: labels.clone(),
            annotations: HashMap::new(),
            linux: Some(proto::LinuxPodSandboxConfig {
                security_context: Some(proto::LinuxSandboxSecurityContext {
                    namespace_options: Some(proto::NamespaceOption {
                        network: network as i32,
                    }),
                }),
            }),
        }
    }

    fn container_config(
        name: &LogicalName,
        spec: &ContainerSpec,
        labels: &HashMap<String, String>,
    ) -> proto::ContainerConfig {
        let resources = spec.resources();
        proto::ContainerConfig {
            metadata: Some(proto::ContainerMetadata {
                name: name.to_string(),
                attempt: 0,
            }),
            image: Some(image_spec(spec)),
            command: spec.command().map(<[String]>::to_vec).unwrap_or_default(),
            args: spec.args().to_vec(),
            working_dir: spec.working_dir().unwrap_or_default().to_string(),
            envs: spec
                .env()
                .iter()
                .map(|(key, value)| proto::KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                })
                .collect(),
            mounts: spec
                .mounts()
                .iter()
                .map(|m| proto::Mount {
                    container_path: m.container_path.clone(),
                    host_path: m.host_path.clone(),
                    readonly: m.read_only,
                })
                .collect(),
            labels: labels.clone(),
            annotations: HashMap::new(),
            log_path: format!("{name}_0.log"),
            tty: spec.tty(),
            linux: Some(proto::LinuxContainerConfig {
                resources: Some(proto::LinuxContainerResources {
                    cpu_shares: resources
                        .cpu_shares
                        .and_then(|c| i64::try_from(c).ok())
                        .unwrap_or_default(),
                    memory_limit_in_bytes: resources
                        .memory_bytes
                        .and_then(|m| i64::try_from(m).ok())
                        .unwrap_or_default(),
                    ..Default::default()
                }),
            }),
        }
    }

    /// Pull the image unless the runtime already has it.
    async fn ensure_image(
        &self,
        spec: &ContainerSpec,
        sandbox: &proto::PodSandboxConfig,
    ) -> Result<(), ContainerError> {
        let status: proto::ImageStatusResponse = self
            .client
            .call(
                method::IMAGE_STATUS,
                proto::ImageStatusRequest {
                    image: Some(image_spec(spec)),
                },
            )
            .await?;
        if status.image.is_some() {
            return Ok(());
        }

        info!(image = %spec.image(), "pulling image");
        let pulled: Result<proto::PullImageResponse, _> = self
            .client
            .call(
                method::PULL_IMAGE,
                proto::PullImageRequest {
                    image: Some(image_spec(spec)),
                    sandbox_config: Some(sandbox.clone()),
                },
            )
            .await;
        match pulled {
            Ok(_) => Ok(()),
            Err(ContainerError::NotFound(msg)) => Err(ContainerError::ImageNotFound(msg)),
            Err(ContainerError::BackendUnavailable(msg) | ContainerError::InvalidState(msg))
                if pull_denied(&msg) =>
            {
                Err(ContainerError::ImageNotFound(format!("{}: {msg}", spec.image())))
            }
            Err(e) => Err(e),
        }
    }

    async fn teardown_sandbox(&self, sandbox: &SandboxId) {
        let stopped: Result<proto::StopPodSandboxResponse, _> = self
            .client
            .call(
                method::STOP_POD_SANDBOX,
                proto::StopPodSandboxRequest {
                    pod_sandbox_id: sandbox.to_string(),
                },
            )
            .await;
        if let Err(e) = stopped {
            warn!(sandbox = %sandbox.short(), error = %e, "failed to stop pod sandbox");
        }
        let removed: Result<proto::RemovePodSandboxResponse, _> = self
            .client
            .call(
                method::REMOVE_POD_SANDBOX,
                proto::RemovePodSandboxRequest {
                    pod_sandbox_id: sandbox.to_string(),
                },
            )
            .await;
        if let Err(e) = removed {
            warn!(sandbox = %sandbox.short(), error = %e, "failed to remove pod sandbox");
        }
    }

    async fn remove_container(&self, id: &ContainerId, force: bool) -> Result<(), ContainerError> {
        if force {
            let _: proto::StopContainerResponse = self
                .client
                .call(
                    method::STOP_CONTAINER,
                    proto::StopContainerRequest {
                        container_id: id.to_string(),
                        timeout: 0,
                    },
                )
                .await?;
        }
        let _: proto::RemoveContainerResponse = self
            .client
            .call(
                method::REMOVE_CONTAINER,
                proto::RemoveContainerRequest {
                    container_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn status(&self, id: &ContainerId) -> Result<proto::ContainerStatus, ContainerError> {
        let response: proto::ContainerStatusResponse = self
            .client
            .call(
                method::CONTAINER_STATUS,
                proto::ContainerStatusRequest {
                    container_id: id.to_string(),
                    verbose: false,
                },
            )
            .await?;
        response
            .status
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))
    }

    async fn list(&self, filter: proto::ContainerFilter) -> Result<Vec<proto::Container>, ContainerError> {
        let response: proto::ListContainersResponse = self
            .client
            .call(
                method::LIST_CONTAINERS,
                proto::ListContainersRequest {
                    filter: Some(filter),
                },
            )
            .await?;
        Ok(response.containers)
    }

    async fn exec_sync(
        &self,
        id: &ContainerId,
        cmd: Vec<String>,
        timeout: Option<Duration>,
    ) -> Result<proto::ExecSyncResponse, ContainerError> {
        let secs = timeout.map(|t| t.as_secs().max(1)).unwrap_or(0);
        let deadline = self.client.call_timeout() + Duration::from_secs(secs);
        let result = self
            .client
            .call_with_deadline(
                method::EXEC_SYNC,
                proto::ExecSyncRequest {
                    container_id: id.to_string(),
                    cmd,
                    timeout: i64::try_from(secs).unwrap_or(i64::MAX),
                },
                deadline,
            )
            .await;
        match result {
            // containerd words exec timeouts as "timeout Ns exceeded"
            Err(ContainerError::BackendUnavailable(msg))
                if msg.contains("timeout") && msg.contains("exceeded") =>
            {
                Err(ContainerError::Timeout(msg))
            }
            other => other,
        }
    }
}

fn image_spec(spec: &ContainerSpec) -> proto::ImageSpec {
    proto::ImageSpec {
        image: spec.image().to_string(),
        annotations: HashMap::new(),
    }
}

fn pull_denied(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["manifest unknown", "not found", "access denied", "unauthorized"]
        .iter()
        .any(|m| lower.contains(m))
}

/// CRI container states to lifecycle states.
pub fn map_state(state: i32, exit_code: i32) -> LifecycleState {
    match proto::ContainerState::try_from(state) {
        Ok(proto::ContainerState::ContainerCreated) => LifecycleState::Created,
        Ok(proto::ContainerState::ContainerRunning) => LifecycleState::Running,
        Ok(proto::ContainerState::ContainerExited) => {
            LifecycleState::Exited(Some(i64::from(exit_code)))
        }
        Ok(proto::ContainerState::ContainerUnknown) | Err(_) => LifecycleState::Unknown,
    }
}

/// Quote a word for `sh -c`.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// ExecSync always waits, so a detached command is backgrounded by the shell
/// with its output discarded.
fn detached_command(request: &ExecRequest) -> Vec<String> {
    let mut words: Vec<String> = request.argv().iter().map(|w| shell_quote(w)).collect();
    if let Some(timeout) = request.timeout {
        let secs = timeout.as_secs().max(1);
        let prefix = ["timeout", "-s", "KILL"].map(str::to_string);
        words.splice(0..0, prefix.into_iter().chain([secs.to_string()]));
    }
    let mut script = format!("{} > /dev/null 2>&1 &", words.join(" "));
    if let Some(dir) = &request.working_dir {
        script = format!("cd {} && {script}", shell_quote(dir));
    }
    vec!["sh".to_string(), "-c".to_string(), script]
}

impl Sealed for CriDriver {}

#[async_trait]
impl RuntimeInfo for CriDriver {
    fn backend_name(&self) -> &'static str {
        "cri"
    }

    async fn ping(&self) -> Result<(), ContainerError> {
        self.version().await.map(|_| ())
    }

    async fn version(&self) -> Result<BackendVersion, ContainerError> {
        let version: proto::VersionResponse = self
            .client
            .call(
                method::VERSION,
                proto::VersionRequest {
                    version: "v1".to_string(),
                },
            )
            .await?;
        Ok(BackendVersion {
            name: version.runtime_name,
            version: version.runtime_version,
            api_version: version.runtime_api_version,
        })
    }
}

#[async_trait]
impl ContainerOps for CriDriver {
    async fn create(
        &self,
        name: &LogicalName,
        spec: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<ContainerId, ContainerError> {
        let network = network_namespace(spec.network())?;

        let mut all_labels: HashMap<String, String> = spec
            .labels()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        all_labels.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));

        let sandbox_config = self.sandbox_config(name, network, &all_labels);
        self.ensure_image(spec, &sandbox_config).await?;

        debug!(name = %name, "cri run pod sandbox");
        let sandbox: proto::RunPodSandboxResponse = self
            .client
            .call(
                method::RUN_POD_SANDBOX,
                proto::RunPodSandboxRequest {
                    config: Some(sandbox_config.clone()),
                    runtime_handler: String::new(),
                },
            )
            .await?;
        let sandbox_id = SandboxId::new(sandbox.pod_sandbox_id);

        debug!(name = %name, sandbox = %sandbox_id.short(), "cri create container");
        let created: Result<proto::CreateContainerResponse, _> = self
            .client
            .call(
                method::CREATE_CONTAINER,
                proto::CreateContainerRequest {
                    pod_sandbox_id: sandbox_id.to_string(),
                    config: Some(Self::container_config(name, spec, &all_labels)),
                    sandbox_config: Some(sandbox_config),
                },
            )
            .await;

        match created {
            Ok(created) => {
                let id = ContainerId::new(created.container_id);
                self.sandboxes.lock().insert(id.clone(), sandbox_id);
                Ok(id)
            }
            Err(e) => {
                self.teardown_sandbox(&sandbox_id).await;
                Err(e)
            }
        }
    }

    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError> {
        debug!(id = %id.short(), "cri start");
        let _: proto::StartContainerResponse = self
            .client
            .call(
                method::START_CONTAINER,
                proto::StartContainerRequest {
                    container_id: id.to_string(),
                },
            )
            .await?;
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, timeout: Duration) -> Result<(), ContainerError> {
        debug!(id = %id.short(), timeout_secs = timeout.as_secs(), "cri stop");
        let deadline = self.client.call_timeout() + timeout;
        let _: proto::StopContainerResponse = self
            .client
            .call_with_deadline(
                method::STOP_CONTAINER,
                proto::StopContainerRequest {
                    container_id: id.to_string(),
                    timeout: i64::try_from(timeout.as_secs()).unwrap_or(i64::MAX),
                },
                deadline,
            )
            .await?;
        Ok(())
    }

    async fn signal(&self, id: &ContainerId, signal: Signal) -> Result<(), ContainerError> {
        // PID 1 of a container ignores SIGKILL sent from inside its namespace.
        if signal == Signal::Kill {
            debug!(id = %id.short(), "cri kill via zero-timeout stop");
            return self.stop(id, Duration::ZERO).await;
        }
        debug!(id = %id.short(), %signal, "cri signal via exec");
        let name = signal.as_str().trim_start_matches("SIG").to_string();
        let response = self
            .exec_sync(
                id,
                vec!["kill".to_string(), "-s".to_string(), name, "1".to_string()],
                None,
            )
            .await?;
        if response.exit_code != 0 {
            return Err(ContainerError::InvalidState(format!(
                "kill -s {} 1 failed in {}: {}",
                signal,
                id.short(),
                String::from_utf8_lossy(&response.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn pause(&self, _id: &ContainerId) -> Result<(), ContainerError> {
        Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "pause",
        })
    }

    async fn unpause(&self, _id: &ContainerId) -> Result<(), ContainerError> {
        Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "unpause",
        })
    }

    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), ContainerError> {
        debug!(id = %id.short(), force, "cri remove");
        let removed = self.remove_container(id, force).await;

        // A container that is already gone still leaves its sandbox behind.
        if let Ok(()) | Err(ContainerError::NotFound(_)) = removed {
            let sandbox = self.sandboxes.lock().remove(id);
            if let Some(sandbox) = sandbox {
                self.teardown_sandbox(&sandbox).await;
            }
        }
        removed
    }

    async fn inspect(&self, id: &ContainerId) -> Result<LifecycleState, ContainerError> {
        let status = self.status(id).await?;
        Ok(map_state(status.state, status.exit_code))
    }

    async fn lookup(&self, reference: &str) -> Result<ContainerId, ContainerError> {
        let by_id = self
            .list(proto::ContainerFilter {
                id: reference.to_string(),
                ..Default::default()
            })
            .await?;
        if let [container] = by_id.as_slice() {
            return Ok(ContainerId::new(container.id.clone()));
        }

        for label in [KUBE_CONTAINER_NAME, BERTH_NAME] {
            let found = self
                .list(proto::ContainerFilter {
                    label_selector: HashMap::from([(label.to_string(), reference.to_string())]),
                    ..Default::default()
                })
                .await?;
            match found.as_slice() {
                [] => continue,
                [container] => return Ok(ContainerId::new(container.id.clone())),
                many => {
                    return Err(ContainerError::InvalidState(format!(
                        "{} containers match '{reference}'",
                        many.len()
                    )));
                }
            }
        }
        Err(ContainerError::NotFound(reference.to_string()))
    }

    async fn list_labelled(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerId>, ContainerError> {
        let found = self
            .list(proto::ContainerFilter {
                label_selector: labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ..Default::default()
            })
            .await?;
        Ok(found
            .into_iter()
            .map(|container| ContainerId::new(container.id))
            .collect())
    }
}

#[async_trait]
impl ExecOps for CriDriver {
    async fn exec(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ContainerError> {
        // ExecSync has no working directory field.
        let cmd = match &request.working_dir {
            Some(dir) => {
                let mut cmd = vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("cd {} && exec \"$@\"", shell_quote(dir)),
                    "sh".to_string(),
                ];
                cmd.extend(request.argv());
                cmd
            }
            None => request.argv(),
        };
        debug!(id = %container.short(), ?cmd, "cri exec");

        let response = self.exec_sync(container, cmd, request.timeout).await?;
        Ok(ExecOutput {
            exit_code: i64::from(response.exit_code),
            stdout: response.stdout,
            stderr: response.stderr,
        })
    }

    async fn exec_detached(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<(), ContainerError> {
        let cmd = detached_command(request);
        debug!(id = %container.short(), ?cmd, "cri detached exec");
        let response = self.exec_sync(container, cmd, None).await?;
        if response.exit_code != 0 {
            return Err(ContainerError::InvalidState(format!(
                "could not start detached command in {}: {}",
                container.short(),
                String::from_utf8_lossy(&response.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn exec_stream(
        &self,
        _container: &ContainerId,
        _request: &ExecRequest,
    ) -> Result<LogLines, ContainerError> {
        Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "streamed exec",
        })
    }
}

#[async_trait]
impl FileOps for CriDriver {
    async fn upload_archive(
        &self,
        _id: &ContainerId,
        _dest_dir: &str,
        _archive: Bytes,
    ) -> Result<(), ContainerError> {
        Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "file upload",
        })
    }

    async fn download_archive(&self, _id: &ContainerId, _path: &str) -> Result<Bytes, ContainerError> {
        Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "file download",
        })
    }
}

#[async_trait]
impl LogOps for CriDriver {
    async fn stream_logs(
        &self,
        id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<LogLines, ContainerError> {
        let status = self.status(id).await?;
        if status.log_path.is_empty() {
            return Err(ContainerError::Unsupported {
                backend: "cri",
                operation: "logs without a log path",
            });
        }
        let path = PathBuf::from(&status.log_path);

        let client = self.client.clone();
        let container_id = id.to_string();
        let exit_check: ExitCheck = Arc::new(move || {
            let client = client.clone();
            let container_id = container_id.clone();
            async move {
                let response: Result<proto::ContainerStatusResponse, _> = client
                    .call(
                        method::CONTAINER_STATUS,
                        proto::ContainerStatusRequest {
                            container_id,
                            verbose: false,
                        },
                    )
                    .await;
                match response {
                    Ok(r) => r.status.is_none_or(|s| {
                        s.state == proto::ContainerState::ContainerExited as i32
                    }),
                    Err(ContainerError::NotFound(_)) => true,
                    Err(_) => false,
                }
            }
            .boxed()
        });

        Ok(read_log_file(path, *opts, exit_check))
    }
}

/// Pod network namespace for a requested network mode.
///
/// A CRI pod always joins the CNI network or the node's, so only those two
/// modes can be honoured.
fn network_namespace(network: &NetworkMode) -> Result<NamespaceMode, ContainerError> {
    match network {
        NetworkMode::Default => Ok(NamespaceMode::Pod),
        NetworkMode::Host => Ok(NamespaceMode::Node),
        NetworkMode::None => Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "disabled networking",
        }),
        NetworkMode::Named(_) => Err(ContainerError::Unsupported {
            backend: "cri",
            operation: "named networks",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::task::{Context, Poll};
    use tonic::body::BoxBody;
    use tonic::codec::ProstCodec;
    use tonic::codegen::http;
    use tonic::server::{Grpc, NamedService, UnaryService};
    use tonic::{Request, Response, Status};

    /// Answers every request with a fixed result.
    struct Reply<T>(Result<T, Status>);

    impl<Req, T: Clone> UnaryService<Req> for Reply<T> {
        type Response = T;
        type Future = futures::future::Ready<Result<Response<T>, Status>>;

        fn call(&mut self, _: Request<Req>) -> Self::Future {
            futures::future::ready(self.0.clone().map(Response::new))
        }
    }

    async fn reply<Req, T>(
        req: http::Request<BoxBody>,
        result: Result<T, Status>,
    ) -> http::Response<BoxBody>
    where
        Req: prost::Message + Default + Send + 'static,
        T: prost::Message + Clone + Send + 'static,
    {
        let mut grpc = Grpc::new(ProstCodec::<T, Req>::default());
        grpc.unary(Reply(result), req).await
    }

    /// RuntimeService whose containers have all vanished.
    #[derive(Clone, Default)]
    struct VanishedRuntime {
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl NamedService for VanishedRuntime {
        const NAME: &'static str = "runtime.v1.RuntimeService";
    }

    impl tower::Service<http::Request<BoxBody>> for VanishedRuntime {
        type Response = http::Response<BoxBody>;
        type Error = Infallible;
        type Future = futures::future::BoxFuture<'static, Result<Self::Response, Infallible>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
            let path = req.uri().path().to_string();
            self.calls.lock().push(path.clone());
            Box::pin(async move {
                let gone = || Status::not_found("container not found");
                let response = match path.as_str() {
                    method::STOP_CONTAINER => {
                        reply::<proto::StopContainerRequest, proto::StopContainerResponse>(
                            req,
                            Err(gone()),
                        )
                        .await
                    }
                    method::REMOVE_CONTAINER => {
                        reply::<proto::RemoveContainerRequest, proto::RemoveContainerResponse>(
                            req,
                            Err(gone()),
                        )
                        .await
                    }
                    method::STOP_POD_SANDBOX => {
                        let ok = Ok(proto::StopPodSandboxResponse {});
                        reply::<proto::StopPodSandboxRequest, _>(req, ok).await
                    }
                    method::REMOVE_POD_SANDBOX => {
                        let ok = Ok(proto::RemovePodSandboxResponse {});
                        reply::<proto::RemovePodSandboxRequest, _>(req, ok).await
                    }
                    other => {
                        let unknown = Err(Status::unimplemented(other.to_string()));
                        reply::<proto::VersionRequest, proto::VersionResponse>(req, unknown).await
                    }
                };
                Ok(response)
            })
        }
    }

    async fn serve(runtime: VanishedRuntime) -> (tempfile::TempDir, Endpoint) {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("cri.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let incoming = futures::stream::unfold(listener, |listener| async move {
            let conn = listener.accept().await.map(|(stream, _)| stream);
            Some((conn, listener))
        });
        tokio::spawn(
            tonic::transport::Server::builder()
                .add_service(runtime)
                .serve_with_incoming(incoming),
        );
        (dir, Endpoint::Unix(socket))
    }

    #[tokio::test]
    async fn remove_of_vanished_container_still_tears_down_sandbox() {
        let runtime = VanishedRuntime::default();
        let (_dir, endpoint) = serve(runtime.clone()).await;
        let driver = CriDriver::connect(&endpoint, CriOptions::default())
            .await
            .unwrap();
        let id = ContainerId::new("c0ffee");
        driver
            .sandboxes
            .lock()
            .insert(id.clone(), SandboxId::new("pod-1"));

        let err = driver.remove(&id, true).await.unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(_)), "{err}");
        assert!(driver.sandboxes.lock().is_empty());

        let calls = runtime.calls.lock().clone();
        assert_eq!(
            calls,
            [
                method::STOP_CONTAINER,
                method::STOP_POD_SANDBOX,
                method::REMOVE_POD_SANDBOX
            ]
        );
    }

    #[test]
    fn cri_state_mapping() {
        assert_eq!(map_state(0, 0), LifecycleState::Created);
        assert_eq!(map_state(1, 0), LifecycleState::Running);
        assert_eq!(map_state(2, 137), LifecycleState::Exited(Some(137)));
        assert_eq!(map_state(3, 0), LifecycleState::Unknown);
        assert_eq!(map_state(42, 0), LifecycleState::Unknown);
    }

    #[test]
    fn container_config_carries_spec() {
        let spec = ContainerSpec::builder("redis:7")
            .command(["redis-server"])
            .args(["--port", "6380"])
            .env("MODE", "test")
            .mount("/srv/data", "/data", true)
            .memory_bytes(64 * 1024 * 1024)
            .build()
            .unwrap();
        let name = LogicalName::new("cache").unwrap();
        let labels = HashMap::from([("berth.name".to_string(), "cache".to_string())]);

        let config = CriDriver::container_config(&name, &spec, &labels);
        assert_eq!(config.metadata.as_ref().unwrap().name, "cache");
        assert_eq!(config.image.as_ref().unwrap().image, "redis:7");
        assert_eq!(config.command, vec!["redis-server"]);
        assert_eq!(config.args, vec!["--port", "6380"]);
        assert_eq!(config.envs[0].key, "MODE");
        assert!(config.mounts[0].readonly);
        assert_eq!(
            config.linux.unwrap().resources.unwrap().memory_limit_in_bytes,
            64 * 1024 * 1024
        );
        assert_eq!(config.log_path, "cache_0.log");
    }

    #[test]
    fn only_pod_and_host_networks_are_accepted() {
        assert_eq!(
            network_namespace(&NetworkMode::Default).unwrap(),
            NamespaceMode::Pod
        );
        assert_eq!(
            network_namespace(&NetworkMode::Host).unwrap(),
            NamespaceMode::Node
        );
        for mode in [NetworkMode::None, NetworkMode::Named("backend".to_string())] {
            assert!(matches!(
                network_namespace(&mode),
                Err(ContainerError::Unsupported { backend: "cri", .. })
            ));
        }
    }

    #[test]
    fn detached_command_backgrounds_quoted_words() {
        let request = ExecRequest::from_vec(vec!["echo".into(), "it's up".into()])
            .unwrap()
            .with_working_dir("/srv");
        assert_eq!(
            detached_command(&request),
            [
                "sh",
                "-c",
                r"cd '/srv' && 'echo' 'it'\''s up' > /dev/null 2>&1 &"
            ]
        );
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/srv/it's"), r"'/srv/it'\''s'");
    }
}
