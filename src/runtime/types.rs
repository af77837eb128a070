// ABOUTME: Backend kind and endpoint definitions for Docker and CRI.
// ABOUTME: Parses unix:// and tcp:// endpoint strings from config and CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Which protocol family a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Docker Engine API (REST over HTTP).
    Docker,
    /// Kubernetes Container Runtime Interface (gRPC).
    Cri,
}

impl BackendKind {
    pub fn default_endpoint(&self) -> Endpoint {
        match self {
            BackendKind::Docker => Endpoint::Unix(PathBuf::from(DOCKER_SOCKET)),
            BackendKind::Cri => Endpoint::Unix(PathBuf::from(CONTAINERD_SOCKET)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::Cri => write!(f, "cri"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "cri" | "containerd" | "crio" | "cri-o" => Ok(BackendKind::Cri),
            other => Err(format!("unknown backend '{other}' (expected docker or cri)")),
        }
    }
}

pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";
pub const CONTAINERD_SOCKET: &str = "/run/containerd/containerd.sock";
pub const CRIO_SOCKET: &str = "/var/run/crio/crio.sock";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseEndpointError {
    #[error("endpoint cannot be empty")]
    Empty,

    #[error("unsupported endpoint scheme in '{0}' (expected unix:// or tcp://)")]
    UnsupportedScheme(String),

    #[error("unix socket path must be absolute: {0}")]
    RelativePath(String),

    #[error("tcp endpoint must be host:port: {0}")]
    MissingPort(String),
}

/// Where a backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseEndpointError::Empty);
        }

        if let Some(path) = s.strip_prefix("unix://") {
            return unix_path(path);
        }
        if s.starts_with('/') {
            return unix_path(s);
        }

        let hostport = s
            .strip_prefix("tcp://")
            .or_else(|| s.strip_prefix("http://"))
            .ok_or_else(|| ParseEndpointError::UnsupportedScheme(s.to_string()))?;
        let hostport = hostport.trim_end_matches('/');
        let (host, port) = hostport
            .rsplit_once(':')
            .ok_or_else(|| ParseEndpointError::MissingPort(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ParseEndpointError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(ParseEndpointError::MissingPort(s.to_string()));
        }
        Ok(Endpoint::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

fn unix_path(path: &str) -> Result<Endpoint, ParseEndpointError> {
    if !path.starts_with('/') {
        return Err(ParseEndpointError::RelativePath(path.to_string()));
    }
    Ok(Endpoint::Unix(PathBuf::from(path)))
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            Endpoint::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}
