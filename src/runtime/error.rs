// ABOUTME: Normalized container error taxonomy and session setup errors.
// ABOUTME: ContainerError uses thiserror, SessionError follows the SNAFU pattern.

use snafu::Snafu;

use super::detection::DetectionError;
use super::traits::SpecError;
use super::types::{BackendKind, ParseEndpointError};

/// Error returned by every driver and dispatcher operation.
///
/// Backend-specific failures are folded into these variants by each driver so
/// callers never match on Docker status codes or gRPC codes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContainerError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("invalid container spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("file transfer failed: {0}")]
    Transfer(String),

    #[error("runtime session is closed")]
    SessionClosed,
}

/// Error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ImageNotFound,
    ResourceExhausted,
    NotFound,
    AlreadyExists,
    InvalidState,
    BackendUnavailable,
    Timeout,
    Unsupported,
    InvalidSpec,
    Transfer,
    SessionClosed,
}

impl ContainerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ImageNotFound(_) => ErrorKind::ImageNotFound,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Unsupported { .. } => ErrorKind::Unsupported,
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::SessionClosed => ErrorKind::SessionClosed,
        }
    }

    /// True only for failures worth retrying unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }
}

/// Session setup error for detection and connection failures.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SessionError {
    #[snafu(display("backend detection failed: {source}"))]
    Detection { source: DetectionError },

    #[snafu(display("invalid backend endpoint: {source}"))]
    Endpoint { source: ParseEndpointError },

    #[snafu(display("failed to connect to {backend} at {endpoint}: {source}"))]
    Connect {
        backend: BackendKind,
        endpoint: String,
        source: ContainerError,
    },
}

/// Session error kind for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// No backend socket found and none configured.
    NoBackendFound,
    /// Configured endpoint could not be parsed.
    InvalidEndpoint,
    /// Backend did not answer the initial handshake.
    ConnectionFailed,
}

impl SessionError {
    pub fn kind(&self) -> SessionErrorKind {
        match self {
            SessionError::Detection { .. } => SessionErrorKind::NoBackendFound,
            SessionError::Endpoint { .. } => SessionErrorKind::InvalidEndpoint,
            SessionError::Connect { .. } => SessionErrorKind::ConnectionFailed,
        }
    }
}

impl From<DetectionError> for SessionError {
    fn from(source: DetectionError) -> Self {
        SessionError::Detection { source }
    }
}

impl From<ParseEndpointError> for SessionError {
    fn from(source: ParseEndpointError) -> Self {
        SessionError::Endpoint { source }
    }
}
