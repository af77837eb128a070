// ABOUTME: Composable capability traits for backend drivers.
// ABOUTME: Defines ContainerOps, ExecOps, FileOps, LogOps, RuntimeInfo and the Driver umbrella.

mod container;
mod exec;
mod files;
mod logs;
mod runtime_info;
pub(crate) mod sealed;
mod shared_types;

pub use container::ContainerOps;
pub use exec::ExecOps;
pub use files::FileOps;
pub use logs::LogOps;
pub use runtime_info::RuntimeInfo;
pub use shared_types::*;

/// Everything a session needs from a backend.
pub trait Driver: ContainerOps + ExecOps + FileOps + LogOps + RuntimeInfo + 'static {}

impl<T> Driver for T where T: ContainerOps + ExecOps + FileOps + LogOps + RuntimeInfo + 'static {}
