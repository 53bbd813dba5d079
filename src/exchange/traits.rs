use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::domain::{
    AccountBalance, CancelOutcome, Candle, ExchangePosition, OrderAck, OrderRequest,
    OrderStatusReport, Orderbook, PublicTrade, Ticker,
};
use crate::error::Result;

/// Streamed market-data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamChannel {
    Ticker,
    Orderbook,
    Trades,
}

impl StreamChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamChannel::Ticker => "ticker",
            StreamChannel::Orderbook => "orderbook",
            StreamChannel::Trades => "trades",
        }
    }
}

impl std::fmt::Display for StreamChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything a stream subscriber can observe, including liveness transitions
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connected,
    Disconnected { reason: String },
    Error(String),
    Ticker(Ticker),
    Orderbook(Orderbook),
    Trade(PublicTrade),
}

pub type StreamCallback = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// Venue abstraction used by the risk gate, execution engine and orchestrator.
///
/// Reads are safe to retry. Mutations are not: `place_order` and
/// `place_stop_order` dedupe on `OrderRequest::client_order_id`, but callers
/// must still surface a failed mutation for reconciliation instead of resending.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_paper(&self) -> bool;

    // ==================== Reads ====================

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<Orderbook>;

    /// Most recent `limit` candles, oldest first
    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>>;

    async fn get_account_balance(&self) -> Result<AccountBalance>;

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>>;

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal> {
        Ok(self.get_ticker(symbol).await?.last)
    }

    async fn is_valid_symbol(&self, symbol: &str) -> Result<bool>;

    async fn get_minimum_order_size(&self, symbol: &str) -> Result<Decimal>;

    async fn get_order_status(&self, exchange_order_id: &str) -> Result<OrderStatusReport>;

    // ==================== Mutations ====================

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn place_stop_order(&self, request: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<CancelOutcome>;

    // ==================== Streaming ====================

    async fn subscribe(
        &self,
        channel: StreamChannel,
        symbols: &[String],
        callback: StreamCallback,
    ) -> Result<()>;

    async fn subscribe_ticker(&self, symbols: &[String], callback: StreamCallback) -> Result<()> {
        self.subscribe(StreamChannel::Ticker, symbols, callback).await
    }

    async fn subscribe_orderbook(
        &self,
        symbols: &[String],
        callback: StreamCallback,
    ) -> Result<()> {
        self.subscribe(StreamChannel::Orderbook, symbols, callback).await
    }

    async fn subscribe_trades(&self, symbols: &[String], callback: StreamCallback) -> Result<()> {
        self.subscribe(StreamChannel::Trades, symbols, callback).await
    }

    /// Cheap liveness probe for the health loop
    async fn ping(&self) -> Result<()>;

    /// Release streams and connections
    async fn disconnect(&self) -> Result<()>;
}
