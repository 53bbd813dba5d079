use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::domain::Ticker;

#[derive(Debug, Clone, Copy)]
struct CachedPrice {
    price: Decimal,
    observed_at: DateTime<Utc>,
}

/// Last traded price per symbol, fed by ticker stream callbacks
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    prices: Arc<DashMap<String, CachedPrice>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, symbol: &str, price: Decimal, observed_at: DateTime<Utc>) {
        if price <= Decimal::ZERO {
            return;
        }
        self.prices
            .entry(symbol.to_string())
            .and_modify(|p| {
                // Out-of-order stream frames never roll the cache backwards
                if observed_at >= p.observed_at {
                    *p = CachedPrice { price, observed_at };
                }
            })
            .or_insert(CachedPrice { price, observed_at });
    }

    pub fn update_from_ticker(&self, ticker: &Ticker) {
        self.update(&ticker.symbol, ticker.last, ticker.timestamp);
    }

    /// Cached price if it is younger than `max_age` at `now`.
    pub fn fresh(&self, symbol: &str, max_age: Duration, now: DateTime<Utc>) -> Option<Decimal> {
        self.prices
            .get(symbol)
            .filter(|p| now - p.observed_at <= max_age)
            .map(|p| p.price)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_staleness_and_ordering() {
        let cache = PriceCache::new();
        let t0 = Utc::now();
        cache.update("BTC-PERP", dec!(50000), t0);
        cache.update("BTC-PERP", dec!(49000), t0 - Duration::seconds(10));

        assert_eq!(
            cache.fresh("BTC-PERP", Duration::seconds(5), t0),
            Some(dec!(50000))
        );
        assert_eq!(
            cache.fresh("BTC-PERP", Duration::seconds(5), t0 + Duration::seconds(6)),
            None
        );
        assert_eq!(cache.fresh("ETH-PERP", Duration::seconds(5), t0), None);
    }
}
