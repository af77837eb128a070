// ABOUTME: File transfer trait for backend drivers.
// ABOUTME: Copies tar archives into and out of a container's filesystem.

use super::sealed::Sealed;
use crate::runtime::error::ContainerError;
use crate::types::ContainerId;
use async_trait::async_trait;
use bytes::Bytes;

/// Archive transfer to and from a container.
///
/// Both directions speak uncompressed tar. Entries in an uploaded archive are
/// relative to `dest_dir`; a downloaded archive holds `path` under its base
/// name.
#[async_trait]
pub trait FileOps: Sealed + Send + Sync {
    /// Extract `archive` into the directory `dest_dir` inside the container.
    async fn upload_archive(
        &self,
        id: &ContainerId,
        dest_dir: &str,
        archive: Bytes,
    ) -> Result<(), ContainerError>;

    /// Pack the file or directory at `path` inside the container.
    async fn download_archive(&self, id: &ContainerId, path: &str) -> Result<Bytes, ContainerError>;
}
