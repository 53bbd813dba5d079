use std::sync::Arc;
use tracing::{error, info};

use crate::domain::{RiskDecision, RiskEvent};
use crate::persistence::TradeStore;

/// Append-only risk audit trail shared by the gate, risk actions and admin commands
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn TradeStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn TradeStore>) -> Self {
        Self { store }
    }

    /// Append `event`. A storage failure is logged, never propagated: the
    /// decision has already been made and must not be undone by the audit path.
    pub async fn record(&self, event: RiskEvent) {
        match event.decision {
            RiskDecision::Denied => info!(
                correlation_id = %event.correlation_id,
                event_type = %event.event_type,
                symbol = event.symbol.as_deref().unwrap_or("-"),
                code = event.code.map(|c| c.as_str()).unwrap_or("-"),
                reason = %event.reason,
                "risk event: denied"
            ),
            _ => info!(
                correlation_id = %event.correlation_id,
                event_type = %event.event_type,
                symbol = event.symbol.as_deref().unwrap_or("-"),
                actor = %event.actor,
                reason = %event.reason,
                "risk event: {}",
                event.decision.as_str()
            ),
        }

        if let Err(e) = self.store.append_risk_event(&event).await {
            error!(
                correlation_id = %event.correlation_id,
                error = %e,
                "failed to persist risk event"
            );
        }
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }
}
