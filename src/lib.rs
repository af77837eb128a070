// ABOUTME: Library root for berth - one container lifecycle API over Docker and CRI.
// ABOUTME: The CLI binary is in main.rs.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod poller;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod state;
pub mod types;

pub use dispatcher::{DispatchSettings, Dispatcher, RetryPolicy};
pub use poller::{ReconcileReport, StatePoller};
pub use registry::{ContainerHandle, Registry};
pub use session::{RuntimeSession, SessionSettings};
pub use state::{LifecycleState, Operation};
