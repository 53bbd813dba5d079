//! Coordination for 24/7 operation
//!
//! - Emergency stop: halt entries and flatten the book until an operator resets
//! - Graceful shutdown: cooperative cancellation of every long-running task

pub mod emergency_stop;
pub mod shutdown;

pub use emergency_stop::{EmergencyReason, EmergencyState, EmergencyStopManager};
pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownConfig, ShutdownError, ShutdownPhase,
    ShutdownSignal, ShutdownStep, ShutdownToken,
};
