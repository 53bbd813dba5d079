use chrono::{Duration, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;

use crate::domain::{Candle, MarketConditions};
use crate::error::Result;
use crate::exchange::{retry_read, ExchangeConnector, RetryPolicy};

const BOOK_DEPTH: usize = 50;

/// Spread reported for a one-sided book
const ONE_SIDED_SPREAD_BPS: i64 = 10_000;

/// Per-symbol volatility and liquidity, cached with a TTL.
///
/// The market-monitoring loop refreshes it on its own cadence; the risk gate
/// and the lifecycle manager read through it.
pub struct MarketMonitor {
    exchange: Arc<dyn ExchangeConnector>,
    retry: RetryPolicy,
    ttl: Duration,
    lookback: usize,
    depth_band_bps: Decimal,
    cache: DashMap<String, MarketConditions>,
}

impl MarketMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeConnector>,
        retry: RetryPolicy,
        ttl_secs: u64,
        lookback: usize,
        depth_band_bps: Decimal,
    ) -> Self {
        Self {
            exchange,
            retry,
            ttl: Duration::seconds(ttl_secs as i64),
            lookback: lookback.max(2),
            depth_band_bps,
            cache: DashMap::new(),
        }
    }

    /// Cached conditions if still inside the TTL
    pub fn cached(&self, symbol: &str) -> Option<MarketConditions> {
        let now = Utc::now();
        self.cache
            .get(symbol)
            .filter(|c| now - c.observed_at <= self.ttl)
            .map(|c| c.clone())
    }

    /// Cached value, or a fresh read when the cache is cold or stale.
    pub async fn conditions(&self, symbol: &str) -> Result<MarketConditions> {
        match self.cached(symbol) {
            Some(c) => Ok(c),
            None => self.refresh(symbol).await,
        }
    }

    pub async fn refresh(&self, symbol: &str) -> Result<MarketConditions> {
        let exchange = &self.exchange;
        let candles = retry_read(&self.retry, "get_candles", || {
            exchange.get_candles(symbol, self.lookback)
        })
        .await?;
        let book = retry_read(&self.retry, "get_orderbook", || {
            exchange.get_orderbook(symbol, BOOK_DEPTH)
        })
        .await?;

        let conditions = MarketConditions {
            symbol: symbol.to_string(),
            volatility: volatility(&candles),
            spread_bps: book
                .spread_bps()
                .unwrap_or_else(|| Decimal::from(ONE_SIDED_SPREAD_BPS)),
            depth_notional: book.depth_notional(self.depth_band_bps),
            observed_at: Utc::now(),
        };
        debug!(
            %symbol,
            volatility = %conditions.volatility,
            spread_bps = %conditions.spread_bps.round_dp(2),
            depth = %conditions.depth_notional.round_dp(0),
            "market conditions refreshed"
        );
        self.cache.insert(symbol.to_string(), conditions.clone());
        Ok(conditions)
    }

    /// Seed or override the cache (stream-derived conditions, tests).
    pub fn insert(&self, conditions: MarketConditions) {
        self.cache.insert(conditions.symbol.clone(), conditions);
    }
}

/// Population standard deviation of close-to-close returns.
pub fn volatility(candles: &[Candle]) -> Decimal {
    let returns: Vec<f64> = candles
        .windows(2)
        .filter_map(|w| {
            let prev = w[0].close.to_f64()?;
            let next = w[1].close.to_f64()?;
            (prev > 0.0).then(|| next / prev - 1.0)
        })
        .collect();
    if returns.len() < 2 {
        return Decimal::ZERO;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Decimal::from_f64(variance.sqrt())
        .map(|v| v.round_dp(8))
        .unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::exchange::PaperExchange;
    use rust_decimal_macros::dec;

    fn candle(close: Decimal) -> Candle {
        Candle {
            open_time: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        }
    }

    #[test]
    fn test_flat_series_has_zero_volatility() {
        let candles: Vec<Candle> = (0..10).map(|_| candle(dec!(100))).collect();
        assert_eq!(volatility(&candles), Decimal::ZERO);
    }

    #[test]
    fn test_alternating_series_volatility() {
        // returns alternate +10% / -9.0909..%, stddev ~ 0.0955
        let candles: Vec<Candle> = [100, 110, 100, 110, 100]
            .iter()
            .map(|c| candle(Decimal::from(*c)))
            .collect();
        let v = volatility(&candles);
        assert!(v > dec!(0.09) && v < dec!(0.10), "{}", v);
    }

    #[tokio::test]
    async fn test_refresh_populates_cache() {
        let mut cfg = PaperConfig::default();
        cfg.prices.insert("BTC-PERP".into(), dec!(50000));
        let exchange: Arc<dyn ExchangeConnector> = Arc::new(PaperExchange::new(cfg));
        let monitor = MarketMonitor::new(exchange, RetryPolicy::none(), 60, 20, dec!(50));

        assert!(monitor.cached("BTC-PERP").is_none());
        let c = monitor.conditions("BTC-PERP").await.unwrap();
        assert_eq!(c.volatility, Decimal::ZERO);
        assert!(c.spread_bps < dec!(5));
        assert!(c.depth_notional > dec!(10000));
        assert!(monitor.cached("BTC-PERP").is_some());
    }
}
