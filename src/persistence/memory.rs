use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::store::TradeStore;
use crate::domain::{Order, Position, RiskEvent, RiskEventType, Trade, TradeStatus};
use crate::error::Result;

/// Process-local store; contents die with the process.
#[derive(Default)]
pub struct InMemoryStore {
    trades: RwLock<HashMap<Uuid, Trade>>,
    orders: RwLock<HashMap<Uuid, Order>>,
    positions: RwLock<HashMap<Uuid, Position>>,
    events: RwLock<Vec<RiskEvent>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn event_count(&self) -> usize {
        self.events.read().await.len()
    }
}

#[async_trait]
impl TradeStore for InMemoryStore {
    async fn save_trade(&self, trade: &Trade) -> Result<()> {
        self.trades
            .write()
            .await
            .insert(trade.trade_id, trade.clone());
        Ok(())
    }

    async fn get_trade(&self, trade_id: Uuid) -> Result<Option<Trade>> {
        Ok(self.trades.read().await.get(&trade_id).cloned())
    }

    async fn load_active_trades(&self) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| matches!(t.status, TradeStatus::Pending | TradeStatus::Open))
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.created_at);
        Ok(trades)
    }

    async fn closed_trades_since(&self, since: DateTime<Utc>) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| t.status == TradeStatus::Closed)
            .filter(|t| t.closed_at.map(|c| c >= since).unwrap_or(false))
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.closed_at);
        Ok(trades)
    }

    async fn recent_closed_trades(&self, limit: usize) -> Result<Vec<Trade>> {
        let mut trades: Vec<Trade> = self
            .trades
            .read()
            .await
            .values()
            .filter(|t| t.status == TradeStatus::Closed)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        trades.truncate(limit);
        Ok(trades)
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        self.orders
            .write()
            .await
            .insert(order.order_id, order.clone());
        Ok(())
    }

    async fn orders_for_trade(&self, trade_id: Uuid) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.trade_id == trade_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn load_active_orders(&self) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    async fn save_position(&self, position: &Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.trade_id, position.clone());
        Ok(())
    }

    async fn delete_position(&self, trade_id: Uuid) -> Result<()> {
        self.positions.write().await.remove(&trade_id);
        Ok(())
    }

    async fn load_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.read().await.values().cloned().collect())
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn risk_events(&self, limit: usize) -> Result<Vec<RiskEvent>> {
        let events = self.events.read().await;
        let start = events.len().saturating_sub(limit);
        Ok(events[start..].to_vec())
    }

    async fn last_event_of(&self, types: &[RiskEventType]) -> Result<Option<RiskEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .rev()
            .find(|e| types.contains(&e.event_type))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExitType, Side};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_active_and_closed_queries() {
        let store = InMemoryStore::new();

        let mut open = Trade::new("BTC-PERP", Side::Long, dec!(0.1));
        open.mark_open(dec!(0.1), dec!(50000)).unwrap();
        store.save_trade(&open).await.unwrap();

        let mut closed = Trade::new("ETH-PERP", Side::Short, dec!(1));
        closed.mark_open(dec!(1), dec!(3000)).unwrap();
        closed.mark_closed(dec!(3100), ExitType::StopLoss).unwrap();
        store.save_trade(&closed).await.unwrap();

        let active = store.load_active_trades().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].trade_id, open.trade_id);

        let recent = store.recent_closed_trades(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].is_loss());
    }
}
