use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Order, Position, RiskEvent, RiskEventType, Trade};
use crate::error::Result;

/// Storage contract used by the execution engine, risk gate and recovery.
///
/// Trades and orders are upserted on every state transition. Risk events
/// are append-only and come back in append order.
#[async_trait]
pub trait TradeStore: Send + Sync {
    async fn save_trade(&self, trade: &Trade) -> Result<()>;

    async fn get_trade(&self, trade_id: Uuid) -> Result<Option<Trade>>;

    /// PENDING and OPEN trades
    async fn load_active_trades(&self) -> Result<Vec<Trade>>;

    /// Closed trades with `closed_at >= since`, oldest first
    async fn closed_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<Trade>>;

    /// Most recent closed trades, newest first
    async fn recent_closed_trades(&self, limit: usize) -> Result<Vec<Trade>>;

    async fn save_order(&self, order: &Order) -> Result<()>;

    async fn orders_for_trade(&self, trade_id: Uuid) -> Result<Vec<Order>>;

    /// Orders not yet in a terminal status
    async fn load_active_orders(&self) -> Result<Vec<Order>>;

    /// Checkpoint a position including trailing-stop and profit-level state.
    async fn save_position(&self, position: &Position) -> Result<()>;

    async fn delete_position(&self, trade_id: Uuid) -> Result<()>;

    async fn load_positions(&self) -> Result<Vec<Position>>;

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<()>;

    /// Last `limit` events in append order
    async fn risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>>;

    /// Most recent event whose type is one of `types`
    async fn last_event_of(&self, types: &[RiskEventType]) -> Result<Option<RiskEvent>>;
}
