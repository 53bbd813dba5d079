mod health;
mod metrics;

pub use health::{ComponentHealth, HealthReport, HealthState, HealthStatus};
pub use metrics::Metrics;
