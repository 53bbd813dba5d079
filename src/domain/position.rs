use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use super::trade::{Side, Trade};
use crate::error::{PerpError, Result};

/// Trailing stop state carried by a position
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrailingStop {
    pub active: bool,
    /// Best price seen since arming (highest for long, lowest for short)
    pub high_water_mark: Option<Decimal>,
    pub stop_price: Option<Decimal>,
}

impl TrailingStop {
    /// Arm or ratchet the stop towards `candidate`.
    ///
    /// Returns true only when the stop moved. A candidate that would loosen
    /// the stop is ignored.
    pub fn ratchet(&mut self, side: Side, price: Decimal, candidate: Decimal) -> bool {
        let better_mark = match (side, self.high_water_mark) {
            (_, None) => true,
            (Side::Long, Some(mark)) => price > mark,
            (Side::Short, Some(mark)) => price < mark,
        };
        if better_mark {
            self.high_water_mark = Some(price);
        }

        match self.stop_price {
            Some(current) if self.active && !side.is_more_favorable_stop(candidate, current) => {
                false
            }
            _ => {
                self.active = true;
                self.stop_price = Some(candidate);
                true
            }
        }
    }

    pub fn is_hit(&self, side: Side, price: Decimal) -> bool {
        match (self.active, self.stop_price) {
            (true, Some(stop)) => match side {
                Side::Long => price <= stop,
                Side::Short => price >= stop,
            },
            _ => false,
        }
    }
}

/// In-memory view of an OPEN trade plus its exit bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub trade_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub trailing_stop: TrailingStop,
    /// Indices of profit-taking levels that already fired
    pub profit_levels_hit: BTreeSet<usize>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn from_trade(trade: &Trade) -> Result<Self> {
        let entry_price = trade.entry_price.ok_or_else(|| {
            PerpError::State(format!(
                "trade {} has no entry price; cannot track position",
                trade.trade_id
            ))
        })?;
        let opened_at = trade.opened_at.unwrap_or(trade.created_at);
        Ok(Self {
            trade_id: trade.trade_id,
            symbol: trade.symbol.clone(),
            side: trade.side,
            size: trade.remaining_size,
            entry_price,
            current_price: entry_price,
            stop_loss: trade.stop_loss,
            take_profit: trade.take_profit,
            trailing_stop: TrailingStop::default(),
            profit_levels_hit: BTreeSet::new(),
            opened_at,
            updated_at: Utc::now(),
        })
    }

    pub fn update_price(&mut self, price: Decimal) {
        self.current_price = price;
        self.updated_at = Utc::now();
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.current_price
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.side.pnl(self.entry_price, self.current_price, self.size)
    }

    /// Return on entry price as a fraction; 0.02 == 2% in the position's favour.
    pub fn unrealized_pnl_pct(&self) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.current_price - self.entry_price) / self.entry_price * self.side.sign()
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_ratchet_is_monotonic() {
        let mut ts = TrailingStop::default();
        assert!(ts.ratchet(Side::Long, dec!(110), dec!(107.8)));
        assert!(ts.ratchet(Side::Long, dec!(115), dec!(112.7)));
        // price pulls back: candidate is lower, stop stays
        assert!(!ts.ratchet(Side::Long, dec!(113), dec!(110.74)));
        assert_eq!(ts.stop_price, Some(dec!(112.7)));
        assert_eq!(ts.high_water_mark, Some(dec!(115)));
    }

    #[test]
    fn test_short_ratchet_moves_down_only() {
        let mut ts = TrailingStop::default();
        ts.ratchet(Side::Short, dec!(90), dec!(91.8));
        assert!(!ts.ratchet(Side::Short, dec!(92), dec!(93.84)));
        assert!(ts.ratchet(Side::Short, dec!(85), dec!(86.7)));
        assert_eq!(ts.stop_price, Some(dec!(86.7)));
        assert!(ts.is_hit(Side::Short, dec!(87)));
    }

    #[test]
    fn test_unrealized_pct_short() {
        let mut t = Trade::new("ETH-PERP", Side::Short, dec!(2));
        t.mark_open(dec!(2), dec!(2000)).unwrap();
        let mut p = Position::from_trade(&t).unwrap();
        p.update_price(dec!(1900));
        assert_eq!(p.unrealized_pnl(), dec!(200));
        assert_eq!(p.unrealized_pnl_pct(), dec!(0.05));
    }
}
