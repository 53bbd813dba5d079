use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, warn};
use uuid::Uuid;

use crate::domain::{Order, Trade, TradeStatus};
use crate::persistence::TradeStore;

/// Working set of non-terminal trades and their orders, written through to
/// the store on every transition.
///
/// Store failures are logged rather than returned: the exchange has already
/// acted by the time a transition is recorded, and the in-memory copy stays
/// authoritative for the running process.
pub struct TradeLedger {
    store: Arc<dyn TradeStore>,
    trades: RwLock<HashMap<Uuid, Trade>>,
    orders: RwLock<HashMap<Uuid, Order>>,
    /// Symbols awaiting reconciliation, with the reason they were flagged
    flagged: DashMap<String, String>,
}

impl TradeLedger {
    pub fn new(store: Arc<dyn TradeStore>) -> Self {
        Self {
            store,
            trades: RwLock::new(HashMap::new()),
            orders: RwLock::new(HashMap::new()),
            flagged: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    // ==================== Trades ====================

    pub async fn save_trade(&self, trade: &Trade) {
        {
            let mut trades = self.trades.write().await;
            if trade.status.is_terminal() {
                trades.remove(&trade.trade_id);
            } else {
                trades.insert(trade.trade_id, trade.clone());
            }
        }
        if trade.status.is_terminal() {
            self.orders
                .write()
                .await
                .retain(|_, o| o.trade_id != trade.trade_id || o.status.is_active());
        }
        if let Err(e) = self.store.save_trade(trade).await {
            error!(trade_id = %trade.trade_id, error = %e, "failed to persist trade");
        }
    }

    /// Active trade, falling back to the store for settled ones.
    pub async fn get_trade(&self, trade_id: Uuid) -> Option<Trade> {
        if let Some(trade) = self.trades.read().await.get(&trade_id) {
            return Some(trade.clone());
        }
        match self.store.get_trade(trade_id).await {
            Ok(trade) => trade,
            Err(e) => {
                warn!(%trade_id, error = %e, "trade lookup failed");
                None
            }
        }
    }

    /// The PENDING or OPEN trade on `symbol`, if any
    pub async fn active_trade_for(&self, symbol: &str) -> Option<Trade> {
        self.trades
            .read()
            .await
            .values()
            .find(|t| t.symbol == symbol)
            .cloned()
    }

    pub async fn active_trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self.trades.read().await.values().cloned().collect();
        trades.sort_by_key(|t| t.created_at);
        trades
    }

    pub async fn open_trades(&self) -> Vec<Trade> {
        self.active_trades()
            .await
            .into_iter()
            .filter(|t| t.status == TradeStatus::Open)
            .collect()
    }

    // ==================== Orders ====================

    pub async fn save_order(&self, order: &Order) {
        self.orders
            .write()
            .await
            .insert(order.order_id, order.clone());
        if let Err(e) = self.store.save_order(order).await {
            error!(order_id = %order.order_id, error = %e, "failed to persist order");
        }
    }

    pub async fn get_order(&self, order_id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&order_id).cloned()
    }

    pub async fn orders_for_trade(&self, trade_id: Uuid) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .read()
            .await
            .values()
            .filter(|o| o.trade_id == trade_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    /// Live stop-loss and take-profit orders of a trade
    pub async fn active_protective_orders(&self, trade_id: Uuid) -> Vec<Order> {
        self.orders_for_trade(trade_id)
            .await
            .into_iter()
            .filter(|o| o.role.is_protective() && o.status.is_active())
            .collect()
    }

    pub async fn active_orders_for_symbol(&self, symbol: &str) -> Vec<Order> {
        self.orders
            .read()
            .await
            .values()
            .filter(|o| o.symbol == symbol && o.status.is_active())
            .cloned()
            .collect()
    }

    // ==================== Reconciliation flags ====================

    pub fn flag(&self, symbol: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%symbol, %reason, "symbol flagged for reconciliation");
        self.flagged.insert(symbol.to_string(), reason);
    }

    pub fn clear_flag(&self, symbol: &str) -> bool {
        self.flagged.remove(symbol).is_some()
    }

    pub fn flag_reason(&self, symbol: &str) -> Option<String> {
        self.flagged.get(symbol).map(|r| r.clone())
    }

    pub fn is_flagged(&self, symbol: &str) -> bool {
        self.flagged.contains_key(symbol)
    }

    pub fn flagged_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.flagged.iter().map(|e| e.key().clone()).collect();
        symbols.sort();
        symbols
    }

    // ==================== Recovery ====================

    /// Seed the working set from persisted non-terminal state.
    pub async fn load(&self, trades: Vec<Trade>, orders: Vec<Order>) {
        {
            let mut map = self.trades.write().await;
            for trade in trades.into_iter().filter(|t| !t.status.is_terminal()) {
                if trade.needs_reconciliation {
                    self.flag(&trade.symbol, "flagged before restart");
                }
                map.insert(trade.trade_id, trade);
            }
        }
        let mut map = self.orders.write().await;
        for order in orders {
            map.insert(order.order_id, order);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExitType, OrderRole, OrderSide, OrderStatus, OrderType, Side};
    use crate::persistence::InMemoryStore;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_settled_trade_leaves_working_set() {
        let store = Arc::new(InMemoryStore::new());
        let ledger = TradeLedger::new(store.clone());

        let mut trade = Trade::new("BTC-PERP", Side::Long, dec!(1));
        ledger.save_trade(&trade).await;
        let mut stop = Order::new(
            trade.trade_id,
            "BTC-PERP",
            OrderSide::Sell,
            OrderRole::StopLoss,
            OrderType::StopLoss,
            dec!(1),
        );
        stop.transition(OrderStatus::Submitted).unwrap();
        ledger.save_order(&stop).await;
        assert!(ledger.active_trade_for("BTC-PERP").await.is_some());
        assert_eq!(ledger.active_protective_orders(trade.trade_id).await.len(), 1);

        trade.mark_open(dec!(1), dec!(100)).unwrap();
        stop.transition(OrderStatus::Cancelled).unwrap();
        ledger.save_order(&stop).await;
        trade.mark_closed(dec!(101), ExitType::Manual).unwrap();
        ledger.save_trade(&trade).await;

        assert!(ledger.active_trade_for("BTC-PERP").await.is_none());
        assert!(ledger.orders_for_trade(trade.trade_id).await.is_empty());
        // still reachable through the store
        let settled = ledger.get_trade(trade.trade_id).await.unwrap();
        assert_eq!(settled.status, TradeStatus::Closed);
    }

    #[test]
    fn test_flags() {
        let ledger = TradeLedger::new(Arc::new(InMemoryStore::new()));
        ledger.flag("ETH-PERP", "stop placement failed");
        assert!(ledger.is_flagged("ETH-PERP"));
        assert_eq!(ledger.flagged_symbols(), vec!["ETH-PERP".to_string()]);
        assert!(ledger.clear_flag("ETH-PERP"));
        assert!(!ledger.is_flagged("ETH-PERP"));
    }
}
