use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::Side;

/// Top-of-book snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Price level (price, size)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Orderbook {
    pub symbol: String,
    /// Best first
    pub bids: Vec<BookLevel>,
    /// Best first
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl Orderbook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }

    /// Spread in basis points of mid; None on a one-sided book.
    pub fn spread_bps(&self) -> Option<Decimal> {
        let (bid, ask) = (self.best_bid()?, self.best_ask()?);
        let mid = (bid + ask) / Decimal::TWO;
        if mid.is_zero() {
            return None;
        }
        Some((ask - bid) / mid * Decimal::from(10_000))
    }

    /// Notional resting within `band_bps` of mid on both sides.
    pub fn depth_notional(&self, band_bps: Decimal) -> Decimal {
        let Some(mid) = self.mid() else {
            return Decimal::ZERO;
        };
        let band = mid * band_bps / Decimal::from(10_000);
        let bids: Decimal = self
            .bids
            .iter()
            .filter(|l| l.price >= mid - band)
            .map(|l| l.price * l.size)
            .sum();
        let asks: Decimal = self
            .asks
            .iter()
            .filter(|l| l.price <= mid + band)
            .map(|l| l.price * l.size)
            .sum();
        bids + asks
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicTrade {
    pub symbol: String,
    pub price: Decimal,
    pub size: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Equity including unrealized P&L
    pub total: Decimal,
    /// Free margin
    pub available: Decimal,
}

/// Position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Derived per-symbol trading conditions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketConditions {
    pub symbol: String,
    /// Standard deviation of candle close-to-close returns
    pub volatility: Decimal,
    pub spread_bps: Decimal,
    pub depth_notional: Decimal,
    pub observed_at: DateTime<Utc>,
}
