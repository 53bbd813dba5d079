use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::trade::Side;
use crate::error::{PerpError, Result};

/// Candidate trade supplied by an external strategy feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    #[serde(default = "Uuid::new_v4")]
    pub signal_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub confidence: Decimal,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    pub strategy_id: String,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl TradingSignal {
    pub fn new(symbol: &str, side: Side, confidence: Decimal, strategy_id: &str) -> Self {
        let now = Utc::now();
        Self {
            signal_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            side,
            confidence,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            strategy_id: strategy_id.to_string(),
            reasoning: None,
            created_at: now,
            expires_at: Some(now + Duration::minutes(5)),
        }
    }

    pub fn with_levels(
        mut self,
        entry: Option<Decimal>,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        self.entry_price = entry;
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| now >= t).unwrap_or(false)
    }

    /// Shape checks that do not need market data.
    pub fn validate(&self) -> Result<()> {
        if self.symbol.trim().is_empty() {
            return Err(PerpError::Validation("signal has empty symbol".into()));
        }
        if self.confidence < Decimal::ZERO || self.confidence > Decimal::ONE {
            return Err(PerpError::Validation(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        for (name, value) in [
            ("entry_price", self.entry_price),
            ("stop_loss", self.stop_loss),
            ("take_profit", self.take_profit),
        ] {
            if let Some(v) = value {
                if v <= Decimal::ZERO {
                    return Err(PerpError::Validation(format!("{} must be positive", name)));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_confidence_bounds() {
        let s = TradingSignal::new("BTC-PERP", Side::Long, dec!(1.2), "momo");
        assert!(s.validate().is_err());
        let s = TradingSignal::new("BTC-PERP", Side::Long, dec!(0.7), "momo");
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_expiry() {
        let mut s = TradingSignal::new("BTC-PERP", Side::Long, dec!(0.7), "momo");
        s.expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(s.is_expired(Utc::now()));
    }

    #[test]
    fn test_deserialize_minimal_json() {
        let raw = r#"{"symbol":"ETH-PERP","side":"SHORT","confidence":"0.8","strategy_id":"mr"}"#;
        let s: TradingSignal = serde_json::from_str(raw).unwrap();
        assert_eq!(s.side, Side::Short);
        assert!(s.expires_at.is_none());
    }
}
