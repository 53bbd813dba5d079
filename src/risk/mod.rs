//! Risk gate, risk state and the audit trail
//!
//! - `RiskGate`: mandatory pre-trade check for every order mutation
//! - `RiskStateManager`: loss accounting, breaker and pause state
//! - `AuditLog`: append-only `RiskEvent` trail
//! - `position_size` / `risk_score`: sizing and portfolio scoring helpers

mod audit;
mod gate;
mod score;
mod sizing;
mod state;

pub use audit::AuditLog;
pub use gate::{GateAction, GateDecision, OrderCheck, RiskGate};
pub use score::{risk_score, RiskLevel};
pub use sizing::{position_size, round_down, SizingInput};
pub use state::{RiskStateManager, SharedLimits};
