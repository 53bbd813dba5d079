use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::order::OrderSide;
use crate::error::{PerpError, Result};

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "LONG",
            Side::Short => "SHORT",
        }
    }

    pub fn entry_order_side(&self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    pub fn exit_order_side(&self) -> OrderSide {
        self.entry_order_side().opposite()
    }

    /// +1 for long, -1 for short
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// P&L of `size` units moved from `entry` to `exit`.
    pub fn pnl(&self, entry: Decimal, exit: Decimal, size: Decimal) -> Decimal {
        (exit - entry) * size * self.sign()
    }

    /// True when `candidate` is a better (more protective) stop than `current`.
    pub fn is_more_favorable_stop(&self, candidate: Decimal, current: Decimal) -> bool {
        match self {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Side {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "LONG" | "BUY" => Ok(Side::Long),
            "SHORT" | "SELL" => Ok(Side::Short),
            other => Err(PerpError::Validation(format!("unknown side '{}'", other))),
        }
    }
}

/// Trade lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    /// Entry order submitted, not yet filled
    Pending,
    /// Entry filled; position live
    Open,
    /// Position exited; immutable from here on
    Closed,
    /// Entry never made it to the book
    Failed,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "PENDING",
            TradeStatus::Open => "OPEN",
            TradeStatus::Closed => "CLOSED",
            TradeStatus::Failed => "FAILED",
        }
    }

    pub fn can_transition_to(&self, target: TradeStatus) -> bool {
        use TradeStatus::*;

        matches!(
            (self, target),
            (Pending, Open) | (Pending, Failed) | (Open, Closed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeStatus::Closed | TradeStatus::Failed)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TradeStatus {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw {
            "PENDING" => Ok(TradeStatus::Pending),
            "OPEN" => Ok(TradeStatus::Open),
            "CLOSED" => Ok(TradeStatus::Closed),
            "FAILED" => Ok(TradeStatus::Failed),
            other => Err(PerpError::Validation(format!("unknown trade status '{}'", other))),
        }
    }
}

/// Why a position was (partially) exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitType {
    StopLoss,
    MaxLoss,
    TakeProfit,
    TrailingStop,
    EndOfDay,
    MaxAge,
    PartialProfit,
    Volatility,
    Illiquidity,
    Manual,
    RiskReduction,
    Emergency,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::StopLoss => "STOP_LOSS",
            ExitType::MaxLoss => "MAX_LOSS",
            ExitType::TakeProfit => "TAKE_PROFIT",
            ExitType::TrailingStop => "TRAILING_STOP",
            ExitType::EndOfDay => "END_OF_DAY",
            ExitType::MaxAge => "MAX_AGE",
            ExitType::PartialProfit => "PARTIAL_PROFIT",
            ExitType::Volatility => "VOLATILITY",
            ExitType::Illiquidity => "ILLIQUIDITY",
            ExitType::Manual => "MANUAL",
            ExitType::RiskReduction => "RISK_REDUCTION",
            ExitType::Emergency => "EMERGENCY",
        }
    }
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ExitType {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        Ok(match raw {
            "STOP_LOSS" => ExitType::StopLoss,
            "MAX_LOSS" => ExitType::MaxLoss,
            "TAKE_PROFIT" => ExitType::TakeProfit,
            "TRAILING_STOP" => ExitType::TrailingStop,
            "END_OF_DAY" => ExitType::EndOfDay,
            "MAX_AGE" => ExitType::MaxAge,
            "PARTIAL_PROFIT" => ExitType::PartialProfit,
            "VOLATILITY" => ExitType::Volatility,
            "ILLIQUIDITY" => ExitType::Illiquidity,
            "MANUAL" => ExitType::Manual,
            "RISK_REDUCTION" => ExitType::RiskReduction,
            "EMERGENCY" => ExitType::Emergency,
            other => return Err(PerpError::Validation(format!("unknown exit type '{}'", other))),
        })
    }
}

/// One logical position's full round-trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: Side,
    /// Size requested at entry; replaced by the filled quantity once open
    pub size: Decimal,
    /// Size still held after partial reductions
    pub remaining_size: Decimal,
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: TradeStatus,
    /// Accumulates partial reductions; final once CLOSED
    pub realized_pnl: Decimal,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<ExitType>,
    pub strategy_id: Option<String>,
    pub reasoning: Option<String>,
    pub entry_order_id: Option<Uuid>,
    pub stop_order_id: Option<Uuid>,
    pub take_profit_order_id: Option<Uuid>,
    pub needs_reconciliation: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Trade {
    pub fn new(symbol: &str, side: Side, size: Decimal) -> Self {
        Self {
            trade_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            size,
            remaining_size: size,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            status: TradeStatus::Pending,
            realized_pnl: Decimal::ZERO,
            exit_price: None,
            exit_reason: None,
            strategy_id: None,
            reasoning: None,
            entry_order_id: None,
            stop_order_id: None,
            take_profit_order_id: None,
            needs_reconciliation: false,
            failure_reason: None,
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
        }
    }

    fn transition(&mut self, to: TradeStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PerpError::InvalidStateTransition {
                entity: format!("trade {}", self.trade_id),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// PENDING -> OPEN with the actual fill.
    pub fn mark_open(&mut self, filled_qty: Decimal, avg_price: Decimal) -> Result<()> {
        self.transition(TradeStatus::Open)?;
        self.size = filled_qty;
        self.remaining_size = filled_qty;
        self.entry_price = Some(avg_price);
        self.opened_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(TradeStatus::Failed)?;
        self.failure_reason = Some(reason.into());
        self.closed_at = Some(Utc::now());
        Ok(())
    }

    /// Realize P&L on a partial reduction and shrink the remaining size.
    pub fn record_reduction(&mut self, qty: Decimal, fill_price: Decimal) -> Result<Decimal> {
        let entry = self.require_entry()?;
        if self.status != TradeStatus::Open {
            return Err(PerpError::State(format!(
                "cannot reduce trade {} in state {}",
                self.trade_id, self.status
            )));
        }
        let qty = qty.min(self.remaining_size);
        let pnl = self.side.pnl(entry, fill_price, qty);
        self.realized_pnl += pnl;
        self.remaining_size -= qty;
        Ok(pnl)
    }

    /// OPEN -> CLOSED, realizing P&L on the remaining size.
    pub fn mark_closed(&mut self, exit_price: Decimal, exit_type: ExitType) -> Result<Decimal> {
        let entry = self.require_entry()?;
        self.transition(TradeStatus::Closed)?;
        self.realized_pnl += self.side.pnl(entry, exit_price, self.remaining_size);
        self.remaining_size = Decimal::ZERO;
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(exit_type);
        self.closed_at = Some(Utc::now());
        Ok(self.realized_pnl)
    }

    fn require_entry(&self) -> Result<Decimal> {
        self.entry_price.ok_or_else(|| {
            PerpError::State(format!("trade {} has no entry price", self.trade_id))
        })
    }

    pub fn is_loss(&self) -> bool {
        self.status == TradeStatus::Closed && self.realized_pnl < Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_pnl() {
        let mut t = Trade::new("BTC-PERP", Side::Long, dec!(0.02));
        t.mark_open(dec!(0.02), dec!(50000)).unwrap();
        let pnl = t.mark_closed(dec!(51000), ExitType::TakeProfit).unwrap();
        assert_eq!(pnl, dec!(20));
        assert_eq!(t.status, TradeStatus::Closed);
    }

    #[test]
    fn test_short_pnl_sign_flipped() {
        let mut t = Trade::new("ETH-PERP", Side::Short, dec!(1));
        t.mark_open(dec!(1), dec!(3000)).unwrap();
        let pnl = t.mark_closed(dec!(3100), ExitType::StopLoss).unwrap();
        assert_eq!(pnl, dec!(-100));
        assert!(t.is_loss());
    }

    #[test]
    fn test_partial_then_close() {
        let mut t = Trade::new("BTC-PERP", Side::Long, dec!(1));
        t.mark_open(dec!(1), dec!(100)).unwrap();
        assert_eq!(t.record_reduction(dec!(0.3), dec!(110)).unwrap(), dec!(3));
        assert_eq!(t.remaining_size, dec!(0.7));
        let total = t.mark_closed(dec!(105), ExitType::TrailingStop).unwrap();
        assert_eq!(total, dec!(6.5));
    }

    #[test]
    fn test_cannot_close_twice() {
        let mut t = Trade::new("BTC-PERP", Side::Long, dec!(1));
        t.mark_open(dec!(1), dec!(100)).unwrap();
        t.mark_closed(dec!(101), ExitType::Manual).unwrap();
        assert!(t.mark_closed(dec!(102), ExitType::Manual).is_err());
    }

    #[test]
    fn test_pending_cannot_close() {
        let mut t = Trade::new("BTC-PERP", Side::Long, dec!(1));
        assert!(t.mark_closed(dec!(1), ExitType::Manual).is_err());
        assert!(!TradeStatus::Pending.can_transition_to(TradeStatus::Closed));
    }

    #[test]
    fn test_stop_favorability() {
        assert!(Side::Long.is_more_favorable_stop(dec!(101), dec!(100)));
        assert!(!Side::Long.is_more_favorable_stop(dec!(99), dec!(100)));
        assert!(Side::Short.is_more_favorable_stop(dec!(99), dec!(100)));
    }
}
