//! Emergency Stop Mechanism
//!
//! Provides emergency shutdown capabilities for critical situations:
//! - Immediate halt of new entries
//! - Best-effort close of every open position
//! - Persisted in the audit trail and restored on restart
//! - Cleared only by an operator reset

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{PauseReason, RiskDecision, RiskEvent, RiskEventType};
use crate::error::{PerpError, Result};
use crate::execution::ExecutionEngine;
use crate::risk::{AuditLog, RiskStateManager};

/// Emergency stop reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EmergencyReason {
    /// Manual trigger by operator
    Manual,
    /// Portfolio risk score crossed the critical threshold
    CriticalRisk,
    /// Exchange connectivity issues
    ExchangeConnectivity,
    /// Restored from the audit trail after a restart
    Restored,
    Other(String),
}

impl std::fmt::Display for EmergencyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmergencyReason::Manual => write!(f, "Manual"),
            EmergencyReason::CriticalRisk => write!(f, "CriticalRisk"),
            EmergencyReason::ExchangeConnectivity => write!(f, "ExchangeConnectivity"),
            EmergencyReason::Restored => write!(f, "Restored"),
            EmergencyReason::Other(s) => write!(f, "Other: {}", s),
        }
    }
}

/// Emergency stop state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmergencyState {
    pub active: bool,
    pub reason: Option<EmergencyReason>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub triggered_by: Option<String>,
    /// Positions whose close failed during the last trigger
    pub failed_closes: usize,
}

/// Emergency stop manager
pub struct EmergencyStopManager {
    state: RwLock<EmergencyState>,
    is_stopped: AtomicBool,
    engine: Arc<ExecutionEngine>,
    risk: Arc<RiskStateManager>,
    audit: AuditLog,
}

impl EmergencyStopManager {
    pub fn new(engine: Arc<ExecutionEngine>, risk: Arc<RiskStateManager>, audit: AuditLog) -> Self {
        Self {
            state: RwLock::new(EmergencyState::default()),
            is_stopped: AtomicBool::new(false),
            engine,
            risk,
            audit,
        }
    }

    /// Check if emergency stop is active (fast atomic check)
    pub fn is_stopped(&self) -> bool {
        self.is_stopped.load(Ordering::Relaxed)
    }

    pub async fn get_state(&self) -> EmergencyState {
        self.state.read().await.clone()
    }

    /// Trigger emergency stop
    ///
    /// 1. Set the stopped flag and pause trading
    /// 2. Record the stop in the audit trail
    /// 3. Close every open position once; failures are logged, not retried
    ///
    /// Returns the number of positions that could not be closed. A second
    /// trigger while stopped does nothing.
    pub async fn trigger(&self, reason: EmergencyReason, actor: &str) -> usize {
        if self.is_stopped.swap(true, Ordering::SeqCst) {
            warn!(%reason, "emergency stop already active");
            return 0;
        }
        error!(%reason, %actor, "EMERGENCY STOP TRIGGERED");

        self.risk.pause(PauseReason::EmergencyStop).await;
        {
            let mut state = self.state.write().await;
            state.active = true;
            state.reason = Some(reason.clone());
            state.triggered_at = Some(Utc::now());
            state.triggered_by = Some(actor.to_string());
        }
        self.audit
            .record(
                RiskEvent::new(
                    Uuid::new_v4(),
                    RiskEventType::EmergencyStop,
                    None,
                    RiskDecision::Action,
                    format!("Emergency stop triggered: {}", reason),
                    self.risk.snapshot().await,
                )
                .with_actor(actor),
            )
            .await;

        let failures = self
            .engine
            .emergency_close_all(&format!("emergency stop: {}", reason))
            .await;
        self.state.write().await.failed_closes = failures;
        if failures > 0 {
            error!(failures, "emergency stop left positions open; manual action required");
        } else {
            info!("Emergency stop completed, all positions closed");
        }
        failures
    }

    /// Reset emergency stop (requires manual intervention)
    pub async fn reset(&self, operator: &str) -> Result<()> {
        if !self.is_stopped() {
            return Err(PerpError::State("emergency stop is not active".into()));
        }
        info!(%operator, "Resetting emergency stop");

        self.is_stopped.store(false, Ordering::SeqCst);
        *self.state.write().await = EmergencyState::default();
        self.risk.resume().await;

        self.audit
            .record(
                RiskEvent::new(
                    Uuid::new_v4(),
                    RiskEventType::EmergencyReset,
                    None,
                    RiskDecision::Action,
                    format!("Emergency stop reset by {}", operator),
                    self.risk.snapshot().await,
                )
                .with_actor(operator),
            )
            .await;
        Ok(())
    }

    /// Returns Err if emergency stop is active
    pub fn check_allowed(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(PerpError::State(
                "Emergency stop is active - all trading operations are blocked".to_string(),
            ));
        }
        Ok(())
    }

    /// Restore an unreset stop from the audit trail on startup.
    ///
    /// Positions are not closed again; the stop only keeps entries blocked.
    pub async fn load_state(&self) -> Result<bool> {
        let last = self
            .audit
            .store()
            .last_event_of(&[RiskEventType::EmergencyStop, RiskEventType::EmergencyReset])
            .await?;

        let Some(event) = last.filter(|e| e.event_type == RiskEventType::EmergencyStop) else {
            return Ok(false);
        };
        warn!(
            triggered_at = %event.timestamp,
            reason = %event.reason,
            "Found active emergency stop from previous session"
        );
        self.is_stopped.store(true, Ordering::SeqCst);
        self.risk.pause(PauseReason::EmergencyStop).await;
        let mut state = self.state.write().await;
        state.active = true;
        state.reason = Some(EmergencyReason::Restored);
        state.triggered_at = Some(event.timestamp);
        state.triggered_by = Some(event.actor);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionConfig, PaperConfig, RiskConfig};
    use crate::coordination::ShutdownToken;
    use crate::domain::Side;
    use crate::exchange::{ExchangeConnector, PaperExchange, RetryPolicy};
    use crate::execution::{TradeLedger, TradeRequest};
    use crate::market::MarketMonitor;
    use crate::persistence::{InMemoryStore, TradeStore};
    use crate::position::PositionRegistry;
    use crate::risk::RiskGate;
    use crate::services::Metrics;
    use rust_decimal_macros::dec;

    fn manager(store: Arc<InMemoryStore>) -> (EmergencyStopManager, Arc<ExecutionEngine>, Arc<RiskStateManager>) {
        let mut cfg = PaperConfig::default();
        cfg.prices.insert("BTC-PERP".into(), dec!(50000));
        let exchange: Arc<dyn ExchangeConnector> = Arc::new(PaperExchange::new(cfg));
        let audit = AuditLog::new(store.clone());
        let registry = PositionRegistry::new();
        let risk = Arc::new(RiskStateManager::new(
            Arc::new(RwLock::new(RiskConfig::default())),
            exchange.clone(),
            registry.clone(),
            audit.clone(),
            RetryPolicy::none(),
        ));
        let metrics = Arc::new(Metrics::new());
        let market = Arc::new(MarketMonitor::new(
            exchange.clone(),
            RetryPolicy::none(),
            60,
            20,
            dec!(50),
        ));
        let gate = Arc::new(RiskGate::new(
            risk.clone(),
            registry.clone(),
            market,
            audit.clone(),
            metrics.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            ExecutionConfig {
                fill_timeout_ms: 200,
                poll_interval_ms: 5,
                close_timeout_ms: 50,
                monitor_interval_ms: 5,
                ..ExecutionConfig::default()
            },
            exchange,
            gate,
            risk.clone(),
            registry,
            Arc::new(TradeLedger::new(store)),
            audit.clone(),
            metrics,
            RetryPolicy::none(),
            ShutdownToken::never(),
        ));
        (
            EmergencyStopManager::new(engine.clone(), risk.clone(), audit),
            engine,
            risk,
        )
    }

    #[test]
    fn test_emergency_reason_display() {
        assert_eq!(EmergencyReason::Manual.to_string(), "Manual");
        assert_eq!(
            EmergencyReason::Other("test".to_string()).to_string(),
            "Other: test"
        );
    }

    #[tokio::test]
    async fn test_trigger_closes_everything_and_blocks_entries() {
        let store = Arc::new(InMemoryStore::new());
        let (stop, engine, risk) = manager(store.clone());
        engine
            .execute_trade(TradeRequest::market("BTC-PERP", Side::Long, dec!(0.01)))
            .await
            .unwrap();

        let failures = stop.trigger(EmergencyReason::Manual, "ops").await;
        assert_eq!(failures, 0);
        assert!(stop.is_stopped());
        assert!(stop.check_allowed().is_err());
        assert!(risk.is_paused().await);
        assert!(engine.ledger().open_trades().await.is_empty());

        // second trigger is a no-op
        assert_eq!(stop.trigger(EmergencyReason::Manual, "ops").await, 0);
        let events = store.risk_events(100).await.unwrap();
        assert_eq!(
            events
                .iter()
                .filter(|e| e.event_type == RiskEventType::EmergencyStop)
                .count(),
            1
        );

        stop.reset("ops").await.unwrap();
        assert!(!stop.is_stopped());
        assert!(!risk.is_paused().await);
    }

    #[tokio::test]
    async fn test_unreset_stop_survives_restart() {
        let store = Arc::new(InMemoryStore::new());
        let (stop, _, _) = manager(store.clone());
        stop.trigger(EmergencyReason::CriticalRisk, "risk_loop").await;

        let (restarted, _, risk) = manager(store.clone());
        assert!(restarted.load_state().await.unwrap());
        assert!(restarted.is_stopped());
        assert!(risk.is_paused().await);

        restarted.reset("ops").await.unwrap();
        let (again, _, _) = manager(store);
        assert!(!again.load_state().await.unwrap());
    }
}
