// ABOUTME: Backend selection for a session from config and local sockets.
// ABOUTME: Checks the Docker socket first, then containerd, then CRI-O.

use super::types::{BackendKind, CONTAINERD_SOCKET, CRIO_SOCKET, DOCKER_SOCKET, Endpoint};
use std::path::{Path, PathBuf};

/// Error during backend detection.
#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("no container backend found (checked {})", checked.join(", "))]
    NoBackendFound { checked: Vec<String> },

    #[error("endpoint {0} was given without a backend kind")]
    KindRequired(String),
}

/// A backend chosen for a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detected {
    pub kind: BackendKind,
    pub endpoint: Endpoint,
}

/// Sockets tried by [`detect_local`], in order.
pub fn default_candidates() -> Vec<(BackendKind, PathBuf)> {
    vec![
        (BackendKind::Docker, PathBuf::from(DOCKER_SOCKET)),
        (BackendKind::Cri, PathBuf::from(CONTAINERD_SOCKET)),
        (BackendKind::Cri, PathBuf::from(CRIO_SOCKET)),
    ]
}

/// Detect a container backend on the local system.
///
/// Detection order:
/// 1. Docker socket (`/var/run/docker.sock`)
/// 2. containerd CRI socket (`/run/containerd/containerd.sock`)
/// 3. CRI-O socket (`/var/run/crio/crio.sock`)
pub fn detect_local() -> Result<Detected, DetectionError> {
    detect_among(&default_candidates())
}

/// Return the first candidate whose socket path exists.
pub fn detect_among(candidates: &[(BackendKind, PathBuf)]) -> Result<Detected, DetectionError> {
    candidates
        .iter()
        .find(|(_, path)| Path::new(path).exists())
        .map(|(kind, path)| Detected {
            kind: *kind,
            endpoint: Endpoint::Unix(path.clone()),
        })
        .ok_or_else(|| DetectionError::NoBackendFound {
            checked: candidates
                .iter()
                .map(|(_, p)| p.display().to_string())
                .collect(),
        })
}

/// Pick the backend for a session.
///
/// An explicit kind wins, with its default socket when no endpoint is given.
/// Without a kind, local sockets are tried. An endpoint alone is ambiguous
/// unless it is one of the well-known sockets.
pub fn resolve(
    kind: Option<BackendKind>,
    endpoint: Option<Endpoint>,
) -> Result<Detected, DetectionError> {
    match (kind, endpoint) {
        (Some(kind), Some(endpoint)) => Ok(Detected { kind, endpoint }),
        (Some(kind), None) => Ok(Detected {
            kind,
            endpoint: kind.default_endpoint(),
        }),
        (None, Some(endpoint)) => {
            let known = default_candidates()
                .into_iter()
                .find(|(_, path)| endpoint == Endpoint::Unix(path.clone()));
            match known {
                Some((kind, _)) => Ok(Detected { kind, endpoint }),
                None => Err(DetectionError::KindRequired(endpoint.to_string())),
            }
        }
        (None, None) => detect_local(),
    }
}
