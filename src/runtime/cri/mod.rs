// ABOUTME: Kubernetes CRI backend: gRPC transport, status mapping and driver.
// ABOUTME: Speaks runtime.v1 to containerd or CRI-O over a unix socket or TCP.

mod driver;
pub mod logs;
pub mod proto;

pub use driver::{CriDriver, CriOptions};

use super::error::ContainerError;
use super::types::Endpoint;
use hyper_util::rt::TokioIo;
use std::time::Duration;
use tokio::net::UnixStream;
use tonic::codegen::http::Uri;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tower::service_fn;
use tracing::debug;

/// Fully qualified gRPC method paths.
pub(crate) mod method {
    pub const VERSION: &str = "/runtime.v1.RuntimeService/Version";
    pub const RUN_POD_SANDBOX: &str = "/runtime.v1.RuntimeService/RunPodSandbox";
    pub const STOP_POD_SANDBOX: &str = "/runtime.v1.RuntimeService/StopPodSandbox";
    pub const REMOVE_POD_SANDBOX: &str = "/runtime.v1.RuntimeService/RemovePodSandbox";
    pub const CREATE_CONTAINER: &str = "/runtime.v1.RuntimeService/CreateContainer";
    pub const START_CONTAINER: &str = "/runtime.v1.RuntimeService/StartContainer";
    pub const STOP_CONTAINER: &str = "/runtime.v1.RuntimeService/StopContainer";
    pub const REMOVE_CONTAINER: &str = "/runtime.v1.RuntimeService/RemoveContainer";
    pub const LIST_CONTAINERS: &str = "/runtime.v1.RuntimeService/ListContainers";
    pub const CONTAINER_STATUS: &str = "/runtime.v1.RuntimeService/ContainerStatus";
    pub const EXEC_SYNC: &str = "/runtime.v1.RuntimeService/ExecSync";
    pub const IMAGE_STATUS: &str = "/runtime.v1.ImageService/ImageStatus";
    pub const PULL_IMAGE: &str = "/runtime.v1.ImageService/PullImage";
}

// =============================================================================
// Status Mapping
// =============================================================================

/// Normalize a gRPC status.
pub fn map_status(status: tonic::Status, method: &'static str) -> ContainerError {
    use tonic::Code;

    let message = status.message().to_string();
    match status.code() {
        Code::NotFound => ContainerError::NotFound(message),
        Code::AlreadyExists => ContainerError::AlreadyExists(message),
        Code::FailedPrecondition | Code::InvalidArgument | Code::OutOfRange => {
            ContainerError::InvalidState(message)
        }
        Code::ResourceExhausted => ContainerError::ResourceExhausted(message),
        Code::DeadlineExceeded => ContainerError::Timeout(message),
        Code::Unimplemented => ContainerError::Unsupported {
            backend: "cri",
            operation: method.rsplit('/').next().unwrap_or(method),
        },
        // containerd reports some lookups as Unknown with a "not found" message
        Code::Unknown if message.contains("not found") => ContainerError::NotFound(message),
        _ => ContainerError::BackendUnavailable(format!("{}: {message}", status.code())),
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A gRPC channel with a default per-call deadline.
#[derive(Clone)]
pub(crate) struct CriClient {
    channel: Channel,
    call_timeout: Duration,
}

impl CriClient {
    pub async fn connect(
        endpoint: &Endpoint,
        connect_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, ContainerError> {
        let unavailable = |e: tonic::transport::Error| {
            ContainerError::BackendUnavailable(format!("{endpoint}: {e}"))
        };

        let channel = match endpoint {
            Endpoint::Unix(path) => {
                let path = path.clone();
                // The URI is ignored by the connector but must be well formed.
                tonic::transport::Endpoint::from_static("http://[::]:50051")
                    .connect_timeout(connect_timeout)
                    .connect_with_connector(service_fn(move |_: Uri| {
                        let p = path.clone();
                        async move {
                            let stream = UnixStream::connect(&p).await?;
                            Ok::<_, std::io::Error>(TokioIo::new(stream))
                        }
                    }))
                    .await
                    .map_err(unavailable)?
            }
            Endpoint::Tcp { host, port } => {
                tonic::transport::Endpoint::from_shared(format!("http://{host}:{port}"))
                    .map_err(unavailable)?
                    .connect_timeout(connect_timeout)
                    .connect()
                    .await
                    .map_err(unavailable)?
            }
        };

        Ok(Self {
            channel,
            call_timeout,
        })
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// One unary call with the default deadline.
    pub async fn call<Req, Resp>(
        &self,
        method: &'static str,
        request: Req,
    ) -> Result<Resp, ContainerError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        self.call_with_deadline(method, request, self.call_timeout)
            .await
    }

    /// One unary call with an explicit deadline, enforced on both ends.
    pub async fn call_with_deadline<Req, Resp>(
        &self,
        method: &'static str,
        request: Req,
        deadline: Duration,
    ) -> Result<Resp, ContainerError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let deadline_ms = millis(deadline);
        debug!(method, deadline_ms, "cri call");
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| ContainerError::BackendUnavailable(format!("channel not ready: {e}")))?;

        let mut request = tonic::Request::new(request);
        request.set_timeout(deadline);
        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let call = grpc.unary(request, PathAndQuery::from_static(method), codec);

        match tokio::time::timeout(deadline, call).await {
            Ok(result) => result
                .map(tonic::Response::into_inner)
                .map_err(|status| map_status(status, method)),
            Err(_) => Err(ContainerError::Timeout(format!(
                "{method} exceeded {deadline_ms}ms"
            ))),
        }
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::{Code, Status};

    #[test]
    fn grpc_codes_map_to_error_kinds() {
        use crate::runtime::ErrorKind;

        let cases = [
            (Code::NotFound, ErrorKind::NotFound),
            (Code::AlreadyExists, ErrorKind::AlreadyExists),
            (Code::FailedPrecondition, ErrorKind::InvalidState),
            (Code::ResourceExhausted, ErrorKind::ResourceExhausted),
            (Code::DeadlineExceeded, ErrorKind::Timeout),
            (Code::Unavailable, ErrorKind::BackendUnavailable),
            (Code::Internal, ErrorKind::BackendUnavailable),
            (Code::Cancelled, ErrorKind::BackendUnavailable),
            (Code::Unimplemented, ErrorKind::Unsupported),
        ];
        for (code, kind) in cases {
            let err = map_status(Status::new(code, "boom"), method::START_CONTAINER);
            assert_eq!(err.kind(), kind, "{code:?}");
        }
    }

    #[test]
    fn unknown_not_found_is_not_found() {
        let err = map_status(
            Status::new(Code::Unknown, "container \"abc\" not found"),
            method::CONTAINER_STATUS,
        );
        assert!(matches!(err, ContainerError::NotFound(_)));
    }

    #[test]
    fn unimplemented_names_the_method() {
        let err = map_status(Status::new(Code::Unimplemented, ""), method::EXEC_SYNC);
        assert!(err.to_string().contains("ExecSync"));
    }

    #[test]
    fn huge_deadlines_saturate() {
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
