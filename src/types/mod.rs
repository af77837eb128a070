// ABOUTME: Validated domain types shared by drivers, registry and dispatcher.
// ABOUTME: Phantom-typed ids, image references and logical container names.

mod id;
mod image_ref;
mod logical_name;

pub use id::{ContainerId, ExecId, Id, IdKind, SandboxId};
pub use image_ref::{ImageRef, ParseImageRefError};
pub use logical_name::{LogicalName, LogicalNameError};
