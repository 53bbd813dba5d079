use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PerpError, Result};

/// Reason code attached to a gate denial, one per check in evaluation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    DailyLoss,
    PositionExposure,
    ConsecutiveLosses,
    TradingPaused,
    PortfolioRisk,
    MinimumBalance,
    MarketConditions,
    /// Inputs the gate cannot evaluate (zero portfolio, missing price)
    InvalidRequest,
}

impl DenyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyCode::DailyLoss => "daily_loss",
            DenyCode::PositionExposure => "position_exposure",
            DenyCode::ConsecutiveLosses => "consecutive_losses",
            DenyCode::TradingPaused => "trading_paused",
            DenyCode::PortfolioRisk => "portfolio_risk",
            DenyCode::MinimumBalance => "minimum_balance",
            DenyCode::MarketConditions => "market_conditions",
            DenyCode::InvalidRequest => "invalid_request",
        }
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for DenyCode {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string()))
            .map_err(|_| PerpError::Validation(format!("unknown deny code '{}'", raw)))
    }
}

/// Why new entries are paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    Manual,
    DailyLoss,
    ConsecutiveLosses,
    RiskCritical,
    EmergencyStop,
}

impl PauseReason {
    /// Pauses that clear on their own (day rollover, breaker cooldown).
    pub fn is_time_based(&self) -> bool {
        matches!(self, PauseReason::DailyLoss | PauseReason::ConsecutiveLosses)
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PauseReason::Manual => "manual",
            PauseReason::DailyLoss => "daily loss limit",
            PauseReason::ConsecutiveLosses => "consecutive-loss breaker",
            PauseReason::RiskCritical => "critical risk score",
            PauseReason::EmergencyStop => "emergency stop",
        };
        write!(f, "{}", s)
    }
}

/// Rolling risk posture of the account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskState {
    /// Realized P&L of trades closed today (UTC)
    pub daily_pnl: Decimal,
    /// Notional of open positions
    pub total_exposure: Decimal,
    pub unrealized_pnl: Decimal,
    pub consecutive_losses: u32,
    pub trading_paused: bool,
    pub pause_reason: Option<PauseReason>,
    pub event_pause: bool,
    pub breaker_tripped_at: Option<DateTime<Utc>>,
    pub portfolio_value: Decimal,
    pub available_balance: Decimal,
    pub peak_portfolio_value: Decimal,
    pub open_positions: usize,
    pub trading_day: NaiveDate,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl RiskState {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            daily_pnl: Decimal::ZERO,
            total_exposure: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            consecutive_losses: 0,
            trading_paused: false,
            pause_reason: None,
            event_pause: false,
            breaker_tripped_at: None,
            portfolio_value: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            peak_portfolio_value: Decimal::ZERO,
            open_positions: 0,
            trading_day: today,
            refreshed_at: None,
        }
    }

    /// Peak-to-current decline as a fraction of peak.
    pub fn drawdown(&self) -> Decimal {
        if self.peak_portfolio_value <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_portfolio_value - self.portfolio_value) / self.peak_portfolio_value)
            .max(Decimal::ZERO)
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        PortfolioSnapshot {
            portfolio_value: self.portfolio_value,
            available_balance: self.available_balance,
            daily_pnl: self.daily_pnl,
            unrealized_pnl: self.unrealized_pnl,
            total_exposure: self.total_exposure,
            consecutive_losses: self.consecutive_losses,
            open_positions: self.open_positions,
            trading_paused: self.trading_paused,
            event_pause: self.event_pause,
        }
    }
}

/// Point-in-time copy of the portfolio carried on every audit record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub portfolio_value: Decimal,
    pub available_balance: Decimal,
    pub daily_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_exposure: Decimal,
    pub consecutive_losses: u32,
    pub open_positions: usize,
    pub trading_paused: bool,
    pub event_pause: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventType {
    GateDecision,
    BreakerTripped,
    DailyLossHalt,
    PauseCleared,
    StopsTightened,
    EmergencyClose,
    EmergencyOverride,
    EmergencyStop,
    EmergencyReset,
    TradingEnabled,
    TradingDisabled,
    EventPauseSet,
    EventPauseCleared,
    ForceClose,
    LimitsAdjusted,
    MarketAlert,
    Reconciliation,
}

impl RiskEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskEventType::GateDecision => "gate_decision",
            RiskEventType::BreakerTripped => "breaker_tripped",
            RiskEventType::DailyLossHalt => "daily_loss_halt",
            RiskEventType::PauseCleared => "pause_cleared",
            RiskEventType::StopsTightened => "stops_tightened",
            RiskEventType::EmergencyClose => "emergency_close",
            RiskEventType::EmergencyOverride => "emergency_override",
            RiskEventType::EmergencyStop => "emergency_stop",
            RiskEventType::EmergencyReset => "emergency_reset",
            RiskEventType::TradingEnabled => "trading_enabled",
            RiskEventType::TradingDisabled => "trading_disabled",
            RiskEventType::EventPauseSet => "event_pause_set",
            RiskEventType::EventPauseCleared => "event_pause_cleared",
            RiskEventType::ForceClose => "force_close",
            RiskEventType::LimitsAdjusted => "limits_adjusted",
            RiskEventType::MarketAlert => "market_alert",
            RiskEventType::Reconciliation => "reconciliation",
        }
    }
}

impl std::fmt::Display for RiskEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for RiskEventType {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        serde_json::from_value(serde_json::Value::String(raw.to_string()))
            .map_err(|_| PerpError::Validation(format!("unknown risk event type '{}'", raw)))
    }
}

/// Outcome recorded on a risk event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskDecision {
    Approved,
    Denied,
    /// Risk action or admin command rather than a gate verdict
    Action,
}

impl RiskDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskDecision::Approved => "approved",
            RiskDecision::Denied => "denied",
            RiskDecision::Action => "action",
        }
    }
}

impl TryFrom<&str> for RiskDecision {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw {
            "approved" => Ok(RiskDecision::Approved),
            "denied" => Ok(RiskDecision::Denied),
            "action" => Ok(RiskDecision::Action),
            other => Err(PerpError::Validation(format!("unknown decision '{}'", other))),
        }
    }
}

/// Immutable audit record of a gate decision or risk action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub event_id: Uuid,
    pub correlation_id: Uuid,
    pub event_type: RiskEventType,
    pub symbol: Option<String>,
    pub decision: RiskDecision,
    pub code: Option<DenyCode>,
    pub reason: String,
    pub actor: String,
    pub snapshot: PortfolioSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl RiskEvent {
    pub fn new(
        correlation_id: Uuid,
        event_type: RiskEventType,
        symbol: Option<&str>,
        decision: RiskDecision,
        reason: impl Into<String>,
        snapshot: PortfolioSnapshot,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            correlation_id,
            event_type,
            symbol: symbol.map(str::to_string),
            decision,
            code: None,
            reason: reason.into(),
            actor: "system".to_string(),
            snapshot,
            timestamp: Utc::now(),
        }
    }

    pub fn with_code(mut self, code: Option<DenyCode>) -> Self {
        self.code = code;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_drawdown() {
        let mut s = RiskState::new(Utc::now().date_naive());
        s.peak_portfolio_value = dec!(10000);
        s.portfolio_value = dec!(9000);
        assert_eq!(s.drawdown(), dec!(0.1));
        s.portfolio_value = dec!(11000);
        assert_eq!(s.drawdown(), Decimal::ZERO);
    }

    #[test]
    fn test_event_type_round_trips_through_str() {
        let t = RiskEventType::try_from("limits_adjusted").unwrap();
        assert_eq!(t, RiskEventType::LimitsAdjusted);
        assert!(RiskEventType::try_from("nope").is_err());
    }
}
