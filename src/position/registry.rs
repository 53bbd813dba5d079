use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::Position;
use crate::error::{PerpError, Result};

/// Active positions keyed by symbol; at most one per symbol.
///
/// Entries are created and removed by the execution engine only. Position
/// management writes price and exit bookkeeping back through `update`.
#[derive(Debug, Clone, Default)]
pub struct PositionRegistry {
    inner: Arc<RwLock<HashMap<String, Position>>>,
}

impl PositionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, position: Position) -> Result<()> {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(&position.symbol) {
            if existing.trade_id != position.trade_id {
                return Err(PerpError::State(format!(
                    "{} already has open trade {}",
                    position.symbol, existing.trade_id
                )));
            }
        }
        map.insert(position.symbol.clone(), position);
        Ok(())
    }

    pub async fn remove_trade(&self, trade_id: Uuid) -> Option<Position> {
        let mut map = self.inner.write().await;
        let symbol = map
            .iter()
            .find(|(_, p)| p.trade_id == trade_id)
            .map(|(s, _)| s.clone())?;
        map.remove(&symbol)
    }

    pub async fn get(&self, symbol: &str) -> Option<Position> {
        self.inner.read().await.get(symbol).cloned()
    }

    pub async fn get_by_trade(&self, trade_id: Uuid) -> Option<Position> {
        self.inner
            .read()
            .await
            .values()
            .find(|p| p.trade_id == trade_id)
            .cloned()
    }

    pub async fn contains(&self, symbol: &str) -> bool {
        self.inner.read().await.contains_key(symbol)
    }

    /// Apply `f` to the entry for `trade_id`, if it is still registered.
    pub async fn update<R>(&self, trade_id: Uuid, f: impl FnOnce(&mut Position) -> R) -> Option<R> {
        let mut map = self.inner.write().await;
        map.values_mut().find(|p| p.trade_id == trade_id).map(f)
    }

    pub async fn snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.inner.read().await.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        positions
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Notional currently held in `symbol`
    pub async fn exposure(&self, symbol: &str) -> Decimal {
        self.inner
            .read()
            .await
            .get(symbol)
            .map(Position::notional)
            .unwrap_or(Decimal::ZERO)
    }

    /// (total notional, total unrealized P&L, count)
    pub async fn totals(&self) -> (Decimal, Decimal, usize) {
        let map = self.inner.read().await;
        let exposure = map.values().map(Position::notional).sum();
        let unrealized = map.values().map(Position::unrealized_pnl).sum();
        (exposure, unrealized, map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Side, Trade};
    use rust_decimal_macros::dec;

    fn position(symbol: &str) -> Position {
        let mut t = Trade::new(symbol, Side::Long, dec!(1));
        t.mark_open(dec!(1), dec!(100)).unwrap();
        Position::from_trade(&t).unwrap()
    }

    #[tokio::test]
    async fn test_one_position_per_symbol() {
        let registry = PositionRegistry::new();
        let first = position("BTC-PERP");
        registry.insert(first.clone()).await.unwrap();
        // re-inserting the same trade is an update
        registry.insert(first.clone()).await.unwrap();
        assert!(registry.insert(position("BTC-PERP")).await.is_err());
        assert_eq!(registry.len().await, 1);

        assert!(registry.remove_trade(first.trade_id).await.is_some());
        assert!(!registry.contains("BTC-PERP").await);
    }

    #[tokio::test]
    async fn test_totals() {
        let registry = PositionRegistry::new();
        let mut p = position("BTC-PERP");
        p.update_price(dec!(110));
        registry.insert(p).await.unwrap();
        registry.insert(position("ETH-PERP")).await.unwrap();

        let (exposure, unrealized, count) = registry.totals().await;
        assert_eq!(exposure, dec!(210));
        assert_eq!(unrealized, dec!(10));
        assert_eq!(count, 2);
        assert_eq!(registry.exposure("BTC-PERP").await, dec!(110));
    }
}
