// ABOUTME: Runtime info trait for backend drivers.
// ABOUTME: Reachability check and backend version metadata.

use super::sealed::Sealed;
use super::shared_types::BackendVersion;
use crate::runtime::error::ContainerError;
use async_trait::async_trait;

/// Backend metadata operations.
#[async_trait]
pub trait RuntimeInfo: Sealed + Send + Sync {
    /// Short driver name used in logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Ping the backend to check connectivity.
    async fn ping(&self) -> Result<(), ContainerError>;

    /// Get backend name and version.
    async fn version(&self) -> Result<BackendVersion, ContainerError>;
}
