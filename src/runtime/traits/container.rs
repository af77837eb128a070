// ABOUTME: Container operations trait for backend drivers.
// ABOUTME: Create, start, stop, signal, pause, remove, inspect, look up and list containers.

use super::sealed::Sealed;
use super::shared_types::{ContainerSpec, Signal};
use crate::runtime::error::ContainerError;
use crate::state::LifecycleState;
use crate::types::{ContainerId, LogicalName};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

/// Container lifecycle operations.
///
/// Drivers translate each call into one backend request (or a short fixed
/// sequence) and normalize the outcome. They do not retry and do not enforce
/// lifecycle rules; the dispatcher does both.
#[async_trait]
pub trait ContainerOps: Sealed + Send + Sync {
    /// Create a container. `labels` are applied in addition to the spec's own.
    async fn create(
        &self,
        name: &LogicalName,
        spec: &ContainerSpec,
        labels: &BTreeMap<String, String>,
    ) -> Result<ContainerId, ContainerError>;

    /// Start a created container.
    async fn start(&self, id: &ContainerId) -> Result<(), ContainerError>;

    /// Ask a running container to stop, killing it after `timeout`.
    async fn stop(&self, id: &ContainerId, timeout: Duration) -> Result<(), ContainerError>;

    /// Deliver a signal to the container's main process.
    async fn signal(&self, id: &ContainerId, signal: Signal) -> Result<(), ContainerError>;

    async fn pause(&self, id: &ContainerId) -> Result<(), ContainerError>;

    async fn unpause(&self, id: &ContainerId) -> Result<(), ContainerError>;

    /// Remove a container; `force` also removes a running one.
    async fn remove(&self, id: &ContainerId, force: bool) -> Result<(), ContainerError>;

    /// Current state as the backend reports it. Absence is `NotFound`.
    async fn inspect(&self, id: &ContainerId) -> Result<LifecycleState, ContainerError>;

    /// Find an existing container by backend id or name.
    async fn lookup(&self, reference: &str) -> Result<ContainerId, ContainerError>;

    /// Every container, running or not, carrying all of `labels`.
    async fn list_labelled(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ContainerId>, ContainerError>;
}
