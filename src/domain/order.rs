use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PerpError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderSide {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(OrderSide::Buy),
            "SELL" => Ok(OrderSide::Sell),
            other => Err(PerpError::Validation(format!("unknown order side '{}'", other))),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    /// Stop-market order triggered when price crosses against the position
    StopLoss,
    /// Market order triggered when price crosses in the position's favour
    TakeProfit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
            OrderType::StopLoss => "STOP_LOSS",
            OrderType::TakeProfit => "TAKE_PROFIT",
        }
    }

    pub fn is_trigger(&self) -> bool {
        matches!(self, OrderType::StopLoss | OrderType::TakeProfit)
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderType {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            "STOP_LOSS" => Ok(OrderType::StopLoss),
            "TAKE_PROFIT" => Ok(OrderType::TakeProfit),
            other => Err(PerpError::Validation(format!("unknown order type '{}'", other))),
        }
    }
}

/// What an order does for its parent trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
    Exit,
    Reduce,
}

impl OrderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderRole::Entry => "ENTRY",
            OrderRole::StopLoss => "STOP_LOSS",
            OrderRole::TakeProfit => "TAKE_PROFIT",
            OrderRole::Exit => "EXIT",
            OrderRole::Reduce => "REDUCE",
        }
    }

    /// Everything except the entry shrinks the position.
    pub fn is_reduce_only(&self) -> bool {
        !matches!(self, OrderRole::Entry)
    }

    pub fn is_protective(&self) -> bool {
        matches!(self, OrderRole::StopLoss | OrderRole::TakeProfit)
    }
}

impl TryFrom<&str> for OrderRole {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw {
            "ENTRY" => Ok(OrderRole::Entry),
            "STOP_LOSS" => Ok(OrderRole::StopLoss),
            "TAKE_PROFIT" => Ok(OrderRole::TakeProfit),
            "EXIT" => Ok(OrderRole::Exit),
            "REDUCE" => Ok(OrderRole::Reduce),
            other => Err(PerpError::Validation(format!("unknown order role '{}'", other))),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order created but not yet submitted
    Pending,
    /// Order accepted by the exchange
    Submitted,
    /// Order partially filled
    PartiallyFilled,
    /// Order fully filled
    Filled,
    /// Order cancelled
    Cancelled,
    /// Order rejected by exchange
    Rejected,
    /// Submission failed; exchange state unknown until reconciled
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Cancelled
                | OrderStatus::Rejected
                | OrderStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Submitted | OrderStatus::PartiallyFilled
        )
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            (Pending, Submitted) => true,
            (Pending, Rejected) => true,
            (Pending, Failed) => true,

            (Submitted, PartiallyFilled) => true,
            (Submitted, Filled) => true,
            (Submitted, Cancelled) => true,
            (Submitted, Rejected) => true,
            (Submitted, Failed) => true,

            (PartiallyFilled, PartiallyFilled) => true,
            (PartiallyFilled, Filled) => true,
            (PartiallyFilled, Cancelled) => true,
            (PartiallyFilled, Failed) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for OrderStatus {
    type Error = PerpError;

    fn try_from(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "SUBMITTED" | "NEW" | "OPEN" => Ok(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Ok(OrderStatus::PartiallyFilled),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" | "CANCELED" => Ok(OrderStatus::Cancelled),
            "REJECTED" => Ok(OrderStatus::Rejected),
            "FAILED" => Ok(OrderStatus::Failed),
            other => Err(PerpError::Validation(format!("unknown order status '{}'", other))),
        }
    }
}

/// What we ask the exchange to do
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Idempotency token; a resent request with the same token never creates a second order
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: OrderSide, size: Decimal) -> Self {
        Self {
            client_order_id: Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            side,
            size,
            order_type: OrderType::Market,
            price: None,
            stop_price: None,
            reduce_only: false,
        }
    }

    pub fn limit(symbol: &str, side: OrderSide, size: Decimal, price: Decimal) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, size)
        }
    }

    pub fn trigger(
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        order_type: OrderType,
        stop_price: Decimal,
    ) -> Self {
        Self {
            order_type,
            stop_price: Some(stop_price),
            reduce_only: true,
            ..Self::market(symbol, side, size)
        }
    }

    pub fn with_client_id(mut self, client_order_id: impl Into<String>) -> Self {
        self.client_order_id = client_order_id.into();
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// Exchange acknowledgement of a placed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
}

/// Exchange view of an order's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub exchange_order_id: String,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelOutcome {
    Cancelled,
    /// Filled before the cancel reached the book
    AlreadyFilled,
    /// Already cancelled, rejected or unknown to the exchange
    AlreadyClosed,
}

/// Order (tracked in our ledger)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub order_id: Uuid,
    pub trade_id: Uuid,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub role: OrderRole,
    pub order_type: OrderType,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(
        trade_id: Uuid,
        symbol: &str,
        side: OrderSide,
        role: OrderRole,
        order_type: OrderType,
        size: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: Uuid::new_v4(),
            trade_id,
            exchange_order_id: None,
            symbol: symbol.to_string(),
            side,
            role,
            order_type,
            size,
            price: None,
            stop_price: None,
            status: OrderStatus::Pending,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_price(mut self, price: Option<Decimal>) -> Self {
        self.price = price;
        self
    }

    pub fn with_stop_price(mut self, stop_price: Option<Decimal>) -> Self {
        self.stop_price = stop_price;
        self
    }

    /// Build the exchange request; our order id doubles as the idempotency token.
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            client_order_id: self.order_id.to_string(),
            symbol: self.symbol.clone(),
            side: self.side,
            size: self.size,
            order_type: self.order_type,
            price: self.price,
            stop_price: self.stop_price,
            reduce_only: self.role.is_reduce_only(),
        }
    }

    pub fn transition(&mut self, to: OrderStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(PerpError::InvalidStateTransition {
                entity: format!("order {}", self.order_id),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Fold an exchange status report into the ledger copy.
    ///
    /// Reports that would move the order backwards are ignored; a report that
    /// repeats the current status only refreshes fill figures.
    pub fn apply_report(&mut self, report: &OrderStatusReport) -> Result<bool> {
        let mut changed = false;
        if report.filled_qty > self.filled_qty {
            self.filled_qty = report.filled_qty;
            changed = true;
        }
        if report.avg_fill_price.is_some() && report.avg_fill_price != self.avg_fill_price {
            self.avg_fill_price = report.avg_fill_price;
            changed = true;
        }
        if report.status != self.status && self.status.can_transition_to(report.status) {
            self.transition(report.status)?;
            changed = true;
        }
        if changed {
            self.updated_at = Utc::now();
        }
        Ok(changed)
    }

    pub fn remaining_qty(&self) -> Decimal {
        (self.size - self.filled_qty).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order() -> Order {
        Order::new(
            Uuid::new_v4(),
            "BTC-PERP",
            OrderSide::Buy,
            OrderRole::Entry,
            OrderType::Market,
            dec!(0.5),
        )
    }

    #[test]
    fn test_order_happy_path() {
        let mut o = order();
        o.transition(OrderStatus::Submitted).unwrap();
        o.transition(OrderStatus::PartiallyFilled).unwrap();
        o.transition(OrderStatus::Filled).unwrap();
        assert!(o.status.is_terminal());
    }

    #[test]
    fn test_terminal_orders_do_not_move() {
        let mut o = order();
        o.transition(OrderStatus::Submitted).unwrap();
        o.transition(OrderStatus::Cancelled).unwrap();
        let err = o.transition(OrderStatus::Filled).unwrap_err();
        assert!(matches!(err, PerpError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_pending_cannot_fill_directly() {
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Filled));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn test_apply_report_tracks_fills() {
        let mut o = order();
        o.transition(OrderStatus::Submitted).unwrap();
        let report = OrderStatusReport {
            exchange_order_id: "x1".into(),
            status: OrderStatus::PartiallyFilled,
            filled_qty: dec!(0.2),
            avg_fill_price: Some(dec!(50000)),
        };
        assert!(o.apply_report(&report).unwrap());
        assert_eq!(o.remaining_qty(), dec!(0.3));

        // stale report is a no-op
        let stale = OrderStatusReport {
            status: OrderStatus::Submitted,
            filled_qty: dec!(0.1),
            ..report.clone()
        };
        assert!(!o.apply_report(&stale).unwrap());
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
    }

    #[test]
    fn test_request_uses_order_id_as_token() {
        let o = order();
        let req = o.to_request();
        assert_eq!(req.client_order_id, o.order_id.to_string());
        assert!(!req.reduce_only);
    }
}
