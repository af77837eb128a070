// ABOUTME: Log operations trait for backend drivers.
// ABOUTME: Stream container output as complete lines.

use super::sealed::Sealed;
use super::shared_types::{LogLines, LogOptions};
use crate::runtime::error::ContainerError;
use crate::types::ContainerId;
use async_trait::async_trait;

/// Log streaming operations.
#[async_trait]
pub trait LogOps: Sealed + Send + Sync {
    /// Open a log stream.
    ///
    /// The stream is lazy and paced by its consumer. Dropping it releases the
    /// backend connection; calling again starts a fresh stream.
    async fn stream_logs(
        &self,
        id: &ContainerId,
        opts: &LogOptions,
    ) -> Result<LogLines, ContainerError>;
}
