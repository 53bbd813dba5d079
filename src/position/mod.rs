//! Open-position tracking and exit evaluation

mod manager;
mod registry;

pub use manager::{ExitDecision, PartialExit, PositionLifecycleManager};
pub use registry::PositionRegistry;
