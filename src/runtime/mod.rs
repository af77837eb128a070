// ABOUTME: Backend drivers behind one set of capability traits.
// ABOUTME: Docker (bollard), CRI (tonic) and in-memory drivers plus backend detection.

pub mod archive;
pub mod cri;
mod detection;
pub mod docker;
mod error;
pub mod json_logs;
pub mod logs;
pub mod memory;
pub mod traits;
mod types;

pub use cri::{CriDriver, CriOptions};
pub use detection::{Detected, DetectionError, default_candidates, detect_among, detect_local, resolve};
pub use docker::DockerDriver;
pub use error::{ContainerError, ErrorKind, SessionError, SessionErrorKind};
pub use json_logs::{JsonLogFormat, LogFilter, parse_json_logs, parse_streamed_json_logs};
pub use memory::{MemoryDriver, StopBehavior};
pub use traits::*;
pub use types::{BackendKind, CONTAINERD_SOCKET, CRIO_SOCKET, DOCKER_SOCKET, Endpoint, ParseEndpointError};
