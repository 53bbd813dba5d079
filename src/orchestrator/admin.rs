//! Operator controls
//!
//! Every action lands in the same risk-event audit trail as the gate's
//! decisions, tagged with the acting operator.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::services::Services;
use crate::config::RiskConfig;
use crate::coordination::{EmergencyReason, EmergencyState};
use crate::domain::{
    ExitType, PauseReason, Position, RiskDecision, RiskEvent, RiskEventType, RiskState, Trade,
};
use crate::error::{PerpError, Result};
use crate::execution::ReconcileReport;
use crate::services::HealthReport;

/// Partial update of the risk limits; unset fields keep their value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskLimitsUpdate {
    pub max_daily_loss: Option<Decimal>,
    pub max_position_size: Option<Decimal>,
    pub max_consecutive_losses: Option<u32>,
    pub breaker_cooldown_secs: Option<u64>,
    pub max_drawdown: Option<Decimal>,
    pub max_total_exposure: Option<Decimal>,
    pub max_open_positions: Option<usize>,
    pub min_account_balance: Option<Decimal>,
    pub max_volatility: Option<Decimal>,
    pub max_spread_bps: Option<Decimal>,
    pub min_depth_notional: Option<Decimal>,
    pub max_portfolio_risk: Option<Decimal>,
}

impl RiskLimitsUpdate {
    /// Apply onto `limits`, returning the names of the fields that changed.
    fn apply(&self, limits: &mut RiskConfig) -> Vec<String> {
        let mut changed = Vec::new();
        macro_rules! set {
            ($($field:ident),*) => {
                $(
                    if let Some(value) = self.$field {
                        if limits.$field != value {
                            changed.push(format!(
                                "{} {} -> {}",
                                stringify!($field),
                                limits.$field,
                                value
                            ));
                            limits.$field = value;
                        }
                    }
                )*
            };
        }
        set!(
            max_daily_loss,
            max_position_size,
            max_consecutive_losses,
            breaker_cooldown_secs,
            max_drawdown,
            max_total_exposure,
            max_open_positions,
            min_account_balance,
            max_volatility,
            max_spread_bps,
            min_depth_notional,
            max_portfolio_risk
        );
        changed
    }
}

fn check_limits(limits: &RiskConfig) -> Result<()> {
    let errors = limits.validate();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(PerpError::Validation(errors.join("; ")))
    }
}

/// Point-in-time view for operators
#[derive(Debug, Clone)]
pub struct AdminStatus {
    pub risk: RiskState,
    pub limits: RiskConfig,
    pub positions: Vec<Position>,
    pub flagged_symbols: Vec<String>,
    pub emergency: EmergencyState,
    pub health: HealthReport,
    pub metrics: String,
}

/// Cloneable handle to the running control plane
#[derive(Clone)]
pub struct AdminHandle {
    services: Arc<Services>,
}

impl AdminHandle {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn audit(&self, event_type: RiskEventType, symbol: Option<&str>, reason: String, actor: &str) {
        self.services
            .audit
            .record(
                RiskEvent::new(
                    Uuid::new_v4(),
                    event_type,
                    symbol,
                    RiskDecision::Action,
                    reason,
                    self.services.risk.snapshot().await,
                )
                .with_actor(actor),
            )
            .await;
    }

    /// Clear pauses and the loss breaker. Refused while an emergency stop is active.
    pub async fn enable_trading(&self, actor: &str) -> Result<()> {
        self.services.emergency.check_allowed()?;
        let previous = self.services.risk.resume().await;
        let reason = match previous {
            Some(p) => format!("Trading enabled (was paused: {})", p),
            None => "Trading enabled".to_string(),
        };
        info!(%actor, "{}", reason);
        self.audit(RiskEventType::TradingEnabled, None, reason, actor).await;
        Ok(())
    }

    pub async fn disable_trading(&self, actor: &str) {
        self.services.risk.pause(PauseReason::Manual).await;
        info!(%actor, "Trading disabled");
        self.audit(
            RiskEventType::TradingDisabled,
            None,
            "Trading disabled by operator".to_string(),
            actor,
        )
        .await;
    }

    pub async fn set_event_pause(&self, paused: bool, note: &str, actor: &str) {
        self.services.risk.set_event_pause(paused).await;
        let (event_type, verb) = if paused {
            (RiskEventType::EventPauseSet, "set")
        } else {
            (RiskEventType::EventPauseCleared, "cleared")
        };
        self.audit(event_type, None, format!("Event pause {}: {}", verb, note), actor)
            .await;
    }

    /// Close one trade at market.
    pub async fn force_close(&self, trade_id: Uuid, actor: &str) -> Result<Trade> {
        let result = self
            .services
            .engine
            .close_position(trade_id, ExitType::Manual, None)
            .await;
        let (symbol, reason) = match &result {
            Ok(trade) => (
                Some(trade.symbol.clone()),
                format!("Force close of trade {}: P&L {}", trade_id, trade.realized_pnl),
            ),
            Err(e) => (None, format!("Force close of trade {} failed: {}", trade_id, e)),
        };
        self.audit(RiskEventType::ForceClose, symbol.as_deref(), reason, actor)
            .await;
        result
    }

    pub async fn force_close_symbol(&self, symbol: &str, actor: &str) -> Result<Trade> {
        let trade = self
            .services
            .engine
            .ledger()
            .active_trade_for(symbol)
            .await
            .ok_or_else(|| PerpError::State(format!("no active trade on {}", symbol)))?;
        self.force_close(trade.trade_id, actor).await
    }

    /// Apply a partial limits update after validating the result.
    pub async fn adjust_limits(&self, update: &RiskLimitsUpdate, actor: &str) -> Result<RiskConfig> {
        let limits = self.services.risk.limits();
        let (adjusted, changed) = {
            let mut current = limits.write().await;
            let mut candidate = current.clone();
            let changed = update.apply(&mut candidate);
            check_limits(&candidate)?;
            *current = candidate.clone();
            (candidate, changed)
        };
        if !changed.is_empty() {
            self.audit(
                RiskEventType::LimitsAdjusted,
                None,
                format!("Risk limits adjusted: {}", changed.join(", ")),
                actor,
            )
            .await;
        }
        Ok(adjusted)
    }

    /// Trigger the emergency stop; returns the number of failed closes.
    pub async fn emergency_stop(&self, actor: &str) -> usize {
        self.services
            .emergency
            .trigger(EmergencyReason::Manual, actor)
            .await
    }

    pub async fn reset_emergency_stop(&self, actor: &str) -> Result<()> {
        self.services.emergency.reset(actor).await
    }

    pub async fn reconcile(&self, symbol: &str) -> Result<ReconcileReport> {
        self.services.engine.reconcile_symbol(symbol).await
    }

    pub async fn status(&self) -> AdminStatus {
        AdminStatus {
            risk: self.services.risk.cached().await,
            limits: self.services.risk.limits().read().await.clone(),
            positions: self.services.registry.snapshot().await,
            flagged_symbols: self.services.engine.ledger().flagged_symbols(),
            emergency: self.services.emergency.get_state().await,
            health: self.services.health.report().await,
            metrics: self.services.metrics.summary(),
        }
    }
}
