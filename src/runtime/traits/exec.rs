// ABOUTME: Exec operations trait for backend drivers.
// ABOUTME: Run a command inside a running container: to completion, detached or streamed.

use super::sealed::Sealed;
use super::shared_types::{ExecOutput, ExecRequest, LogLines};
use crate::runtime::error::ContainerError;
use crate::types::ContainerId;
use async_trait::async_trait;

/// Exec operations: run commands in containers.
#[async_trait]
pub trait ExecOps: Sealed + Send + Sync {
    /// Run the command and wait for it, returning its exit code and output.
    ///
    /// A command outliving `request.timeout` is reported as `Timeout`.
    async fn exec(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<ExecOutput, ContainerError>;

    /// Start the command and return without waiting for it or its output.
    async fn exec_detached(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<(), ContainerError>;

    /// Run the command, yielding its output line by line as it is produced.
    async fn exec_stream(
        &self,
        container: &ContainerId,
        request: &ExecRequest,
    ) -> Result<LogLines, ContainerError>;
}
