//! Paper-trading venue
//!
//! A deterministic in-memory exchange implementing the full connector
//! contract. Market orders fill at the current mark (plus configured
//! slippage), limit and trigger orders rest until a price update crosses
//! them, and client order ids are honoured as idempotency tokens.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use super::traits::{ExchangeConnector, StreamCallback, StreamChannel, StreamEvent};
use crate::config::PaperConfig;
use crate::domain::{
    AccountBalance, BookLevel, CancelOutcome, Candle, ExchangePosition, OrderAck, OrderRequest,
    OrderSide, OrderStatus, OrderStatusReport, OrderType, Orderbook, PublicTrade, Side, Ticker,
};
use crate::error::{PerpError, Result};

const BPS: Decimal = dec!(10000);

#[derive(Debug, Clone)]
struct PaperOrder {
    exchange_order_id: String,
    request: OrderRequest,
    status: OrderStatus,
    filled_qty: Decimal,
    avg_fill_price: Option<Decimal>,
}

impl PaperOrder {
    fn report(&self) -> OrderStatusReport {
        OrderStatusReport {
            exchange_order_id: self.exchange_order_id.clone(),
            status: self.status,
            filled_qty: self.filled_qty,
            avg_fill_price: self.avg_fill_price,
        }
    }

    fn ack(&self) -> OrderAck {
        OrderAck {
            exchange_order_id: self.exchange_order_id.clone(),
            client_order_id: self.request.client_order_id.clone(),
            status: self.status,
        }
    }
}

/// Signed net position
#[derive(Debug, Clone, Default)]
struct NetPosition {
    qty: Decimal,
    avg_price: Decimal,
}

impl NetPosition {
    /// Apply a signed fill; returns realized P&L of any closed portion.
    fn apply(&mut self, delta: Decimal, price: Decimal) -> Decimal {
        if self.qty.is_zero() || self.qty.is_sign_negative() == delta.is_sign_negative() {
            let total = self.qty.abs() + delta.abs();
            self.avg_price = (self.qty.abs() * self.avg_price + delta.abs() * price) / total;
            self.qty += delta;
            return Decimal::ZERO;
        }

        let closing = delta.abs().min(self.qty.abs());
        let direction = if self.qty.is_sign_negative() {
            Decimal::NEGATIVE_ONE
        } else {
            Decimal::ONE
        };
        let realized = (price - self.avg_price) * closing * direction;
        self.qty -= closing * direction;

        let remainder = delta.abs() - closing;
        if self.qty.is_zero() {
            self.avg_price = Decimal::ZERO;
        }
        if remainder > Decimal::ZERO {
            self.qty = if delta.is_sign_negative() {
                -remainder
            } else {
                remainder
            };
            self.avg_price = price;
        }
        realized
    }
}

#[derive(Default)]
struct PaperBook {
    prices: HashMap<String, Decimal>,
    min_sizes: HashMap<String, Decimal>,
    candles: HashMap<String, Vec<Candle>>,
    cash: Decimal,
    positions: HashMap<String, NetPosition>,
    orders: HashMap<String, PaperOrder>,
    client_index: HashMap<String, String>,
    held_symbols: HashSet<String>,
    next_id: u64,
}

impl PaperBook {
    fn price(&self, symbol: &str) -> Result<Decimal> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| PerpError::terminal(format!("unknown symbol {}", symbol)))
    }

    fn fill(&mut self, exchange_order_id: &str, price: Decimal) -> Option<PublicTrade> {
        let order = self.orders.get_mut(exchange_order_id)?;
        let qty = order.request.size - order.filled_qty;
        if qty <= Decimal::ZERO {
            return None;
        }
        order.filled_qty += qty;
        order.avg_fill_price = Some(price);
        order.status = OrderStatus::Filled;

        let symbol = order.request.symbol.clone();
        let delta = match order.request.side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let realized = self
            .positions
            .entry(symbol.clone())
            .or_default()
            .apply(delta, price);
        self.cash += realized;
        debug!(%symbol, %exchange_order_id, %qty, %price, %realized, "paper fill");

        Some(PublicTrade {
            symbol,
            price,
            size: qty,
            timestamp: Utc::now(),
        })
    }

    /// Fill every resting order the current mark crosses.
    fn sweep(&mut self, symbol: &str, slippage_bps: Decimal) -> Vec<PublicTrade> {
        let Some(mark) = self.prices.get(symbol).copied() else {
            return Vec::new();
        };
        let held = self.held_symbols.contains(symbol);

        let mut crossing: Vec<(String, Decimal)> = self
            .orders
            .values()
            .filter(|o| o.request.symbol == symbol && o.status.is_active())
            .filter_map(|o| {
                let req = &o.request;
                let buy = req.side == OrderSide::Buy;
                let fill_price = match req.order_type {
                    OrderType::Market if !held => Some(slipped(mark, req.side, slippage_bps)),
                    OrderType::Limit if !held => {
                        let limit = req.price?;
                        let crosses = if buy { mark <= limit } else { mark >= limit };
                        crosses.then_some(limit)
                    }
                    OrderType::StopLoss => {
                        let stop = req.stop_price?;
                        let crosses = if buy { mark >= stop } else { mark <= stop };
                        crosses.then(|| slipped(mark, req.side, slippage_bps))
                    }
                    OrderType::TakeProfit => {
                        let target = req.stop_price?;
                        let crosses = if buy { mark <= target } else { mark >= target };
                        crosses.then(|| slipped(mark, req.side, slippage_bps))
                    }
                    _ => None,
                };
                fill_price.map(|px| (o.exchange_order_id.clone(), px))
            })
            .collect();
        crossing.sort();

        crossing
            .into_iter()
            .filter_map(|(id, px)| self.fill(&id, px))
            .collect()
    }

    fn balance(&self) -> AccountBalance {
        let mut unrealized = Decimal::ZERO;
        let mut margin = Decimal::ZERO;
        for (symbol, pos) in &self.positions {
            if pos.qty.is_zero() {
                continue;
            }
            let mark = self.prices.get(symbol).copied().unwrap_or(pos.avg_price);
            unrealized += (mark - pos.avg_price) * pos.qty;
            margin += pos.qty.abs() * mark;
        }
        let total = self.cash + unrealized;
        AccountBalance {
            total,
            available: (total - margin).max(Decimal::ZERO),
        }
    }
}

fn slipped(mark: Decimal, side: OrderSide, slippage_bps: Decimal) -> Decimal {
    let adj = mark * slippage_bps / BPS;
    match side {
        OrderSide::Buy => mark + adj,
        OrderSide::Sell => mark - adj,
    }
}

struct Subscriber {
    channel: StreamChannel,
    symbols: HashSet<String>,
    callback: StreamCallback,
}

/// In-memory exchange used for paper trading and as the deterministic test venue
pub struct PaperExchange {
    config: PaperConfig,
    book: Mutex<PaperBook>,
    subscribers: RwLock<Vec<Subscriber>>,
    mutation_calls: AtomicU64,
    fail_next_mutation: Mutex<Option<String>>,
    offline: AtomicBool,
}

impl PaperExchange {
    pub fn new(config: PaperConfig) -> Self {
        // config keys arrive lowercased from the config crate
        let book = PaperBook {
            prices: config
                .prices
                .iter()
                .map(|(symbol, price)| (symbol.to_uppercase(), *price))
                .collect(),
            cash: config.initial_balance,
            ..Default::default()
        };
        info!(
            balance = %config.initial_balance,
            symbols = config.prices.len(),
            "Paper exchange initialised"
        );
        Self {
            config,
            book: Mutex::new(book),
            subscribers: RwLock::new(Vec::new()),
            mutation_calls: AtomicU64::new(0),
            fail_next_mutation: Mutex::new(None),
            offline: AtomicBool::new(false),
        }
    }

    // ==================== Simulation controls ====================

    /// Move the mark, fill anything it crosses and notify subscribers.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let fills = {
            let mut book = self.book.lock().await;
            book.prices.insert(symbol.to_string(), price);
            book.sweep(symbol, self.config.slippage_bps)
        };

        let ticker = self.ticker_for(symbol, price);
        self.publish(StreamChannel::Ticker, symbol, StreamEvent::Ticker(ticker))
            .await;
        for trade in fills {
            self.publish(StreamChannel::Trades, symbol, StreamEvent::Trade(trade))
                .await;
        }
    }

    pub async fn set_min_order_size(&self, symbol: &str, size: Decimal) {
        self.book
            .lock()
            .await
            .min_sizes
            .insert(symbol.to_string(), size);
    }

    pub async fn set_cash(&self, cash: Decimal) {
        self.book.lock().await.cash = cash;
    }

    pub async fn set_candles(&self, symbol: &str, candles: Vec<Candle>) {
        self.book
            .lock()
            .await
            .candles
            .insert(symbol.to_string(), candles);
    }

    /// While held, market and limit orders on `symbol` rest instead of filling.
    pub async fn hold_fills(&self, symbol: &str, held: bool) {
        let fills = {
            let mut book = self.book.lock().await;
            if held {
                book.held_symbols.insert(symbol.to_string());
                Vec::new()
            } else {
                book.held_symbols.remove(symbol);
                book.sweep(symbol, self.config.slippage_bps)
            }
        };
        for trade in fills {
            self.publish(StreamChannel::Trades, symbol, StreamEvent::Trade(trade))
                .await;
        }
    }

    /// Make the next mutating call fail with a transient error.
    pub async fn fail_next_mutation(&self, message: &str) {
        *self.fail_next_mutation.lock().await = Some(message.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of mutating calls received, including failed ones.
    pub fn mutation_count(&self) -> u64 {
        self.mutation_calls.load(Ordering::SeqCst)
    }

    pub async fn order_report(&self, exchange_order_id: &str) -> Option<OrderStatusReport> {
        self.book
            .lock()
            .await
            .orders
            .get(exchange_order_id)
            .map(PaperOrder::report)
    }

    pub async fn active_order_count(&self, symbol: &str) -> usize {
        self.book
            .lock()
            .await
            .orders
            .values()
            .filter(|o| o.request.symbol == symbol && o.status.is_active())
            .count()
    }

    pub async fn net_position(&self, symbol: &str) -> Decimal {
        self.book
            .lock()
            .await
            .positions
            .get(symbol)
            .map(|p| p.qty)
            .unwrap_or(Decimal::ZERO)
    }

    // ==================== Internals ====================

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PerpError::retryable("paper exchange offline"));
        }
        Ok(())
    }

    async fn begin_mutation(&self) -> Result<()> {
        self.mutation_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        if let Some(message) = self.fail_next_mutation.lock().await.take() {
            return Err(PerpError::retryable(message));
        }
        Ok(())
    }

    fn ticker_for(&self, symbol: &str, price: Decimal) -> Ticker {
        let half = price * self.config.half_spread_bps / BPS;
        Ticker {
            symbol: symbol.to_string(),
            bid: price - half,
            ask: price + half,
            last: price,
            volume_24h: Decimal::ZERO,
            timestamp: Utc::now(),
        }
    }

    async fn publish(&self, channel: StreamChannel, symbol: &str, event: StreamEvent) {
        let subscribers = self.subscribers.read().await;
        for sub in subscribers
            .iter()
            .filter(|s| s.channel == channel && s.symbols.contains(symbol))
        {
            (sub.callback)(event.clone());
        }
    }

    async fn submit(&self, request: &OrderRequest) -> Result<OrderAck> {
        self.begin_mutation().await?;
        if request.size <= Decimal::ZERO {
            return Err(PerpError::terminal("order size must be positive"));
        }

        let (ack, fills) = {
            let mut book = self.book.lock().await;
            book.price(&request.symbol)?;

            if let Some(existing) = book.client_index.get(&request.client_order_id) {
                let order = book
                    .orders
                    .get(existing)
                    .ok_or_else(|| PerpError::Internal("paper client index out of sync".into()))?;
                debug!(client_order_id = %request.client_order_id, "duplicate submission deduped");
                return Ok(order.ack());
            }

            book.next_id += 1;
            let exchange_order_id = format!("paper-{}", book.next_id);
            let order = PaperOrder {
                exchange_order_id: exchange_order_id.clone(),
                request: request.clone(),
                status: OrderStatus::Submitted,
                filled_qty: Decimal::ZERO,
                avg_fill_price: None,
            };
            book.client_index
                .insert(request.client_order_id.clone(), exchange_order_id.clone());
            book.orders.insert(exchange_order_id.clone(), order);

            let fills = book.sweep(&request.symbol, self.config.slippage_bps);
            let ack = book
                .orders
                .get(&exchange_order_id)
                .map(PaperOrder::ack)
                .ok_or_else(|| PerpError::Internal("paper order vanished".into()))?;
            (ack, fills)
        };

        for trade in fills {
            let symbol = trade.symbol.clone();
            self.publish(StreamChannel::Trades, &symbol, StreamEvent::Trade(trade))
                .await;
        }
        Ok(ack)
    }
}

#[async_trait]
impl ExchangeConnector for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    fn is_paper(&self) -> bool {
        true
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.check_online()?;
        let price = self.book.lock().await.price(symbol)?;
        Ok(self.ticker_for(symbol, price))
    }

    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<Orderbook> {
        self.check_online()?;
        let mid = self.book.lock().await.price(symbol)?;
        let half = mid * self.config.half_spread_bps / BPS;
        let tick = mid / BPS;

        let levels = depth.max(1);
        let mut bids = Vec::with_capacity(levels);
        let mut asks = Vec::with_capacity(levels);
        for i in 0..levels {
            let step = tick * Decimal::from(i as u64);
            let size = self.config.level_size * Decimal::from(i as u64 + 1);
            bids.push(BookLevel {
                price: mid - half - step,
                size,
            });
            asks.push(BookLevel {
                price: mid + half + step,
                size,
            });
        }
        Ok(Orderbook {
            symbol: symbol.to_string(),
            bids,
            asks,
            timestamp: Utc::now(),
        })
    }

    async fn get_candles(&self, symbol: &str, limit: usize) -> Result<Vec<Candle>> {
        self.check_online()?;
        let book = self.book.lock().await;
        if let Some(candles) = book.candles.get(symbol) {
            let start = candles.len().saturating_sub(limit);
            return Ok(candles[start..].to_vec());
        }
        let price = book.price(symbol)?;
        let now = Utc::now();
        Ok((0..limit.min(2))
            .map(|i| Candle {
                open_time: now - ChronoDuration::minutes((limit.min(2) - i) as i64),
                open: price,
                high: price,
                low: price,
                close: price,
                volume: Decimal::ZERO,
            })
            .collect())
    }

    async fn get_account_balance(&self) -> Result<AccountBalance> {
        self.check_online()?;
        Ok(self.book.lock().await.balance())
    }

    async fn get_positions(&self) -> Result<Vec<ExchangePosition>> {
        self.check_online()?;
        let book = self.book.lock().await;
        Ok(book
            .positions
            .iter()
            .filter(|(_, p)| !p.qty.is_zero())
            .map(|(symbol, p)| {
                let mark = book.prices.get(symbol).copied().unwrap_or(p.avg_price);
                ExchangePosition {
                    symbol: symbol.clone(),
                    side: if p.qty.is_sign_negative() {
                        Side::Short
                    } else {
                        Side::Long
                    },
                    size: p.qty.abs(),
                    entry_price: p.avg_price,
                    unrealized_pnl: (mark - p.avg_price) * p.qty,
                }
            })
            .collect())
    }

    async fn is_valid_symbol(&self, symbol: &str) -> Result<bool> {
        self.check_online()?;
        Ok(self.book.lock().await.prices.contains_key(symbol))
    }

    async fn get_minimum_order_size(&self, symbol: &str) -> Result<Decimal> {
        self.check_online()?;
        let book = self.book.lock().await;
        book.price(symbol)?;
        Ok(book
            .min_sizes
            .get(symbol)
            .copied()
            .unwrap_or(self.config.min_order_size))
    }

    async fn get_order_status(&self, exchange_order_id: &str) -> Result<OrderStatusReport> {
        self.check_online()?;
        self.book
            .lock()
            .await
            .orders
            .get(exchange_order_id)
            .map(PaperOrder::report)
            .ok_or_else(|| PerpError::terminal(format!("unknown order {}", exchange_order_id)))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if request.order_type.is_trigger() {
            return Err(PerpError::terminal("use place_stop_order for trigger orders"));
        }
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(PerpError::terminal("limit order without price"));
        }
        self.submit(request).await
    }

    async fn place_stop_order(&self, request: &OrderRequest) -> Result<OrderAck> {
        if !request.order_type.is_trigger() || request.stop_price.is_none() {
            return Err(PerpError::terminal("stop order needs a trigger type and stop price"));
        }
        self.submit(request).await
    }

    async fn cancel_order(&self, exchange_order_id: &str) -> Result<CancelOutcome> {
        self.begin_mutation().await?;
        let mut book = self.book.lock().await;
        let Some(order) = book.orders.get_mut(exchange_order_id) else {
            return Ok(CancelOutcome::AlreadyClosed);
        };
        Ok(match order.status {
            OrderStatus::Filled => CancelOutcome::AlreadyFilled,
            s if s.is_terminal() => CancelOutcome::AlreadyClosed,
            _ => {
                order.status = OrderStatus::Cancelled;
                CancelOutcome::Cancelled
            }
        })
    }

    async fn subscribe(
        &self,
        channel: StreamChannel,
        symbols: &[String],
        callback: StreamCallback,
    ) -> Result<()> {
        self.check_online()?;
        callback(StreamEvent::Connected);
        self.subscribers.write().await.push(Subscriber {
            channel,
            symbols: symbols.iter().cloned().collect(),
            callback,
        });
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }

    async fn disconnect(&self) -> Result<()> {
        let subscribers = std::mem::take(&mut *self.subscribers.write().await);
        for sub in subscribers {
            (sub.callback)(StreamEvent::Disconnected {
                reason: "paper exchange disconnected".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn exchange() -> PaperExchange {
        let mut cfg = PaperConfig::default();
        cfg.prices.insert("BTC-PERP".to_string(), dec!(50000));
        PaperExchange::new(cfg)
    }

    #[tokio::test]
    async fn test_market_order_fills_at_mark() {
        let ex = exchange();
        let ack = ex
            .place_order(&OrderRequest::market("BTC-PERP", OrderSide::Buy, dec!(0.1)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        let report = ex.get_order_status(&ack.exchange_order_id).await.unwrap();
        assert_eq!(report.avg_fill_price, Some(dec!(50000)));
        assert_eq!(ex.net_position("BTC-PERP").await, dec!(0.1));
    }

    #[tokio::test]
    async fn test_client_id_dedupes() {
        let ex = exchange();
        let req = OrderRequest::market("BTC-PERP", OrderSide::Buy, dec!(0.1)).with_client_id("entry-1");
        let a = ex.place_order(&req).await.unwrap();
        let b = ex.place_order(&req).await.unwrap();
        assert_eq!(a.exchange_order_id, b.exchange_order_id);
        assert_eq!(ex.net_position("BTC-PERP").await, dec!(0.1));
        assert_eq!(ex.mutation_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_triggers_on_cross() {
        let ex = exchange();
        ex.place_order(&OrderRequest::market("BTC-PERP", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        let stop = ex
            .place_stop_order(&OrderRequest::trigger(
                "BTC-PERP",
                OrderSide::Sell,
                dec!(1),
                OrderType::StopLoss,
                dec!(49000),
            ))
            .await
            .unwrap();
        assert_eq!(stop.status, OrderStatus::Submitted);

        ex.set_price("BTC-PERP", dec!(48900)).await;
        let report = ex.order_report(&stop.exchange_order_id).await.unwrap();
        assert_eq!(report.status, OrderStatus::Filled);
        assert_eq!(ex.net_position("BTC-PERP").await, Decimal::ZERO);

        let balance = ex.get_account_balance().await.unwrap();
        assert_eq!(balance.total, dec!(8900));
    }

    #[tokio::test]
    async fn test_cancel_after_fill_reports_filled() {
        let ex = exchange();
        let ack = ex
            .place_order(&OrderRequest::market("BTC-PERP", OrderSide::Buy, dec!(0.1)))
            .await
            .unwrap();
        let outcome = ex.cancel_order(&ack.exchange_order_id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::AlreadyFilled);
    }

    #[tokio::test]
    async fn test_held_fills_rest_until_released() {
        let ex = exchange();
        ex.hold_fills("BTC-PERP", true).await;
        let ack = ex
            .place_order(&OrderRequest::market("BTC-PERP", OrderSide::Sell, dec!(0.5)))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Submitted);
        ex.hold_fills("BTC-PERP", false).await;
        assert_eq!(ex.net_position("BTC-PERP").await, dec!(-0.5));
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let ex = exchange();
        ex.fail_next_mutation("connection reset").await;
        let req = OrderRequest::market("BTC-PERP", OrderSide::Buy, dec!(0.1));
        assert!(ex.place_order(&req).await.is_err());
        assert!(ex.place_order(&req).await.is_ok());
    }

    #[tokio::test]
    async fn test_ticker_stream_callback() {
        let ex = exchange();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        ex.subscribe_ticker(
            &["BTC-PERP".to_string()],
            Arc::new(move |event: StreamEvent| {
                if let Ok(mut v) = sink.lock() {
                    v.push(event);
                }
            }),
        )
        .await
        .unwrap();
        ex.set_price("BTC-PERP", dec!(50100)).await;

        let events = seen.lock().unwrap();
        assert_eq!(events[0], StreamEvent::Connected);
        assert!(matches!(&events[1], StreamEvent::Ticker(t) if t.last == dec!(50100)));
    }

    #[test]
    fn test_net_position_flip() {
        let mut p = NetPosition::default();
        p.apply(dec!(1), dec!(100));
        let realized = p.apply(dec!(-3), dec!(110));
        assert_eq!(realized, dec!(10));
        assert_eq!(p.qty, dec!(-2));
        assert_eq!(p.avg_price, dec!(110));
    }
}
