//! Shared identifier and handle types for the execution-plan state machine.

mod handle;
mod ids;

pub use handle::StepOutputHandle;
pub use ids::{AssetKey, LogicalVersion, MappingKey, OutputName, StepKey};
