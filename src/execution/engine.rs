//! Trade execution engine
//!
//! Turns approved trade requests into exchange orders and carries each trade
//! through PENDING -> OPEN -> CLOSED (or FAILED). Every order mutation,
//! including cancels, passes through the risk gate first and runs under the
//! symbol's lock, so a gate approval and the order it approved are never
//! interleaved with another mutation on the same symbol.
//!
//! Mutations are never retried. A failed mutation flags the symbol for
//! reconciliation; no new entry is attempted there until
//! [`ExecutionEngine::reconcile_symbol`] finds local and exchange state in
//! agreement.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ledger::TradeLedger;
use super::locks::SymbolLocks;
use crate::config::ExecutionConfig;
use crate::coordination::ShutdownToken;
use crate::domain::{
    CancelOutcome, ExitType, Order, OrderRole, OrderStatus, OrderType, Position, RiskDecision,
    RiskEvent, RiskEventType, Side, Trade, TradeStatus,
};
use crate::error::{PerpError, Result};
use crate::exchange::{retry_read, ExchangeConnector, RetryPolicy};
use crate::position::PositionRegistry;
use crate::risk::{round_down, AuditLog, OrderCheck, RiskGate, RiskStateManager};
use crate::services::Metrics;

/// A request to open one position
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    /// Limit entry when set, market otherwise
    pub entry_price: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub strategy_id: Option<String>,
    pub reasoning: Option<String>,
}

impl TradeRequest {
    pub fn market(symbol: &str, side: Side, size: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            strategy_id: None,
            reasoning: None,
        }
    }

    pub fn with_limit(mut self, price: Decimal) -> Self {
        self.entry_price = Some(price);
        self
    }

    pub fn with_levels(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    pub fn with_strategy(mut self, strategy_id: &str, reasoning: Option<String>) -> Self {
        self.strategy_id = Some(strategy_id.to_string());
        self.reasoning = reasoning;
        self
    }
}

/// Outcome of comparing one symbol's local and exchange state
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub symbol: String,
    /// Signed open size we track (+long / -short)
    pub local_size: Decimal,
    /// Signed size the exchange reports
    pub exchange_size: Decimal,
    pub orders_refreshed: usize,
    pub matched: bool,
}

/// Fills collected by a reducing order sequence
struct ReduceFill {
    qty: Decimal,
    notional: Decimal,
}

impl ReduceFill {
    fn avg_price(&self) -> Option<Decimal> {
        (self.qty > Decimal::ZERO).then(|| self.notional / self.qty)
    }
}

pub struct ExecutionEngine {
    config: ExecutionConfig,
    exchange: Arc<dyn ExchangeConnector>,
    gate: Arc<RiskGate>,
    risk: Arc<RiskStateManager>,
    registry: PositionRegistry,
    ledger: Arc<TradeLedger>,
    audit: AuditLog,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    locks: SymbolLocks,
    shutdown: ShutdownToken,
    monitors: DashMap<Uuid, JoinHandle<()>>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ExecutionConfig,
        exchange: Arc<dyn ExchangeConnector>,
        gate: Arc<RiskGate>,
        risk: Arc<RiskStateManager>,
        registry: PositionRegistry,
        ledger: Arc<TradeLedger>,
        audit: AuditLog,
        metrics: Arc<Metrics>,
        retry: RetryPolicy,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            config,
            exchange,
            gate,
            risk,
            registry,
            ledger,
            audit,
            metrics,
            retry,
            locks: SymbolLocks::new(),
            shutdown,
            monitors: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<TradeLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &PositionRegistry {
        &self.registry
    }

    pub fn locks(&self) -> &SymbolLocks {
        &self.locks
    }

    /// OCO monitors still running
    pub fn active_monitors(&self) -> usize {
        self.monitors.iter().filter(|h| !h.is_finished()).count()
    }

    // ==================== Entry ====================

    /// Validate, gate and submit an entry, wait for the fill, then attach
    /// the protective stop-loss / take-profit pair.
    pub async fn execute_trade(self: &Arc<Self>, request: TradeRequest) -> Result<Trade> {
        let _guard = self.locks.lock(&request.symbol).await;

        if let Some(reason) = self.ledger.flag_reason(&request.symbol) {
            return Err(PerpError::State(format!(
                "{} is awaiting reconciliation: {}",
                request.symbol, reason
            )));
        }
        if let Some(active) = self.ledger.active_trade_for(&request.symbol).await {
            return Err(PerpError::Validation(format!(
                "{} already has {} trade {}",
                request.symbol, active.status, active.trade_id
            )));
        }

        let reference_price = self.validate_request(&request).await?;
        let order_type = if request.entry_price.is_some() {
            OrderType::Limit
        } else {
            OrderType::Market
        };
        let entry_side = request.side.entry_order_side();

        let correlation_id = self
            .gate
            .check_order(&OrderCheck::entry(
                &request.symbol,
                entry_side,
                request.size,
                reference_price,
                order_type,
            ))
            .await
            .into_result()?;

        let mut trade = Trade::new(&request.symbol, request.side, request.size);
        trade.stop_loss = request.stop_loss;
        trade.take_profit = request.take_profit;
        trade.strategy_id = request.strategy_id.clone();
        trade.reasoning = request.reasoning.clone();

        let mut order = Order::new(
            trade.trade_id,
            &request.symbol,
            entry_side,
            OrderRole::Entry,
            order_type,
            request.size,
        )
        .with_price(request.entry_price);
        trade.entry_order_id = Some(order.order_id);
        self.ledger.save_trade(&trade).await;
        self.ledger.save_order(&order).await;

        info!(
            trade_id = %trade.trade_id,
            %correlation_id,
            symbol = %trade.symbol,
            side = %trade.side,
            size = %trade.size,
            %order_type,
            "submitting entry"
        );

        if let Err(e) = self.submit(&mut order).await {
            let reason = format!("entry submission failed: {}", e);
            trade.needs_reconciliation = true;
            trade.mark_failed(reason.clone())?;
            self.ledger.save_trade(&trade).await;
            self.ledger.flag(&trade.symbol, reason);
            self.metrics.inc_trades_failed();
            return Err(e);
        }

        self.await_fill(&mut order, self.config.fill_timeout()).await;
        self.settle_entry(trade, order, reference_price).await
    }

    async fn validate_request(&self, request: &TradeRequest) -> Result<Decimal> {
        let symbol = request.symbol.as_str();
        if request.size <= Decimal::ZERO {
            return Err(PerpError::Validation(format!(
                "size must be positive, got {}",
                request.size
            )));
        }
        if matches!(request.entry_price, Some(p) if p <= Decimal::ZERO) {
            return Err(PerpError::Validation("entry price must be positive".into()));
        }

        let valid = retry_read(&self.retry, "is_valid_symbol", || {
            self.exchange.is_valid_symbol(symbol)
        })
        .await?;
        if !valid {
            return Err(PerpError::Validation(format!("unknown symbol {}", symbol)));
        }

        let min_size = self.min_order_size(symbol).await?;
        if request.size < min_size {
            return Err(PerpError::Validation(format!(
                "size {} below minimum {} for {}",
                request.size, min_size, symbol
            )));
        }

        let reference = match request.entry_price {
            Some(price) => price,
            None => {
                retry_read(&self.retry, "get_current_price", || {
                    self.exchange.get_current_price(symbol)
                })
                .await?
            }
        };

        let (stop_ok, target_ok) = match request.side {
            Side::Long => (
                request.stop_loss.map_or(true, |s| s < reference),
                request.take_profit.map_or(true, |t| t > reference),
            ),
            Side::Short => (
                request.stop_loss.map_or(true, |s| s > reference),
                request.take_profit.map_or(true, |t| t < reference),
            ),
        };
        if !stop_ok {
            return Err(PerpError::Validation(format!(
                "stop-loss {:?} is on the wrong side of {} for a {} entry",
                request.stop_loss, reference, request.side
            )));
        }
        if !target_ok {
            return Err(PerpError::Validation(format!(
                "take-profit {:?} is on the wrong side of {} for a {} entry",
                request.take_profit, reference, request.side
            )));
        }

        let balance = retry_read(&self.retry, "get_account_balance", || {
            self.exchange.get_account_balance()
        })
        .await?;
        let leverage = if self.config.leverage > Decimal::ZERO {
            self.config.leverage
        } else {
            Decimal::ONE
        };
        let margin = request.size * reference / leverage;
        if balance.available < margin {
            return Err(PerpError::Validation(format!(
                "insufficient balance: {} available, {} required",
                balance.available, margin
            )));
        }

        Ok(reference)
    }

    /// Finish an entry whose order has stopped moving or run out of time.
    ///
    /// A still-live order is cancelled once; whatever filled becomes the
    /// position.
    async fn settle_entry(
        self: &Arc<Self>,
        mut trade: Trade,
        mut order: Order,
        fallback_price: Decimal,
    ) -> Result<Trade> {
        let timed_out = order.status.is_active();
        if timed_out {
            warn!(
                trade_id = %trade.trade_id,
                order_id = %order.order_id,
                filled = %order.filled_qty,
                "entry not filled in time, cancelling"
            );
            if let Err(e) = self.cancel_order(&mut order, &trade, false).await {
                let reason = format!("entry cancel failed: {}", e);
                trade.needs_reconciliation = true;
                trade.mark_failed(reason.clone())?;
                self.ledger.save_trade(&trade).await;
                self.ledger.flag(&trade.symbol, reason);
                self.metrics.inc_trades_failed();
                return Err(e);
            }
        }

        if order.filled_qty <= Decimal::ZERO {
            let reason = if timed_out {
                format!("entry not filled within {}ms", self.config.fill_timeout_ms)
            } else {
                format!("entry order {}", order.status)
            };
            trade.mark_failed(reason.clone())?;
            self.ledger.save_trade(&trade).await;
            self.metrics.inc_trades_failed();
            info!(trade_id = %trade.trade_id, %reason, "trade failed");
            return Err(if timed_out {
                PerpError::Timeout(reason)
            } else {
                PerpError::terminal(reason)
            });
        }

        let fill_price = order
            .avg_fill_price
            .or(order.price)
            .unwrap_or(fallback_price);
        trade.mark_open(order.filled_qty, fill_price)?;
        self.ledger.save_trade(&trade).await;
        self.metrics.inc_trades_opened();
        info!(
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            side = %trade.side,
            size = %trade.size,
            entry_price = %fill_price,
            partial = timed_out,
            "trade opened"
        );

        let position = Position::from_trade(&trade)?;
        self.registry.insert(position.clone()).await?;
        self.checkpoint(&position).await;

        self.place_protective_orders(&mut trade).await;
        self.ledger.save_trade(&trade).await;
        self.ensure_monitor(trade.trade_id);
        Ok(trade)
    }

    // ==================== Protective orders ====================

    /// Place whichever of the stop-loss / take-profit legs is set but not live.
    async fn place_protective_orders(&self, trade: &mut Trade) {
        let live = self.ledger.active_protective_orders(trade.trade_id).await;
        let legs = [
            (OrderRole::StopLoss, OrderType::StopLoss, trade.stop_loss),
            (OrderRole::TakeProfit, OrderType::TakeProfit, trade.take_profit),
        ];

        for (role, order_type, level) in legs {
            let Some(level) = level else { continue };
            if live.iter().any(|o| o.role == role) {
                continue;
            }
            if self.ledger.is_flagged(&trade.symbol) {
                warn!(
                    trade_id = %trade.trade_id,
                    %level,
                    role = role.as_str(),
                    "symbol awaiting reconciliation; leg left to software exits"
                );
                break;
            }
            match self.place_protective(trade, role, order_type, level).await {
                Ok(order) => match role {
                    OrderRole::StopLoss => trade.stop_order_id = Some(order.order_id),
                    _ => trade.take_profit_order_id = Some(order.order_id),
                },
                Err(e @ PerpError::RiskDenied { .. }) => {
                    warn!(trade_id = %trade.trade_id, error = %e, "protective leg denied");
                }
                Err(e) => {
                    self.mark_needs_reconciliation(
                        trade,
                        format!("{} placement failed: {}", role.as_str(), e),
                    )
                    .await;
                    break;
                }
            }
        }
    }

    async fn place_protective(
        &self,
        trade: &Trade,
        role: OrderRole,
        order_type: OrderType,
        level: Decimal,
    ) -> Result<Order> {
        let exit_side = trade.side.exit_order_side();
        self.gate
            .check_order(&OrderCheck::reduce(
                &trade.symbol,
                exit_side,
                trade.remaining_size,
                level,
                order_type,
                role,
                trade.remaining_size,
            ))
            .await
            .into_result()?;

        let mut order = Order::new(
            trade.trade_id,
            &trade.symbol,
            exit_side,
            role,
            order_type,
            trade.remaining_size,
        )
        .with_stop_price(Some(level));
        self.ledger.save_order(&order).await;
        self.submit(&mut order).await?;
        debug!(trade_id = %trade.trade_id, role = role.as_str(), %level, "protective leg placed");
        Ok(order)
    }

    fn ensure_monitor(self: &Arc<Self>, trade_id: Uuid) {
        let running = self
            .monitors
            .get(&trade_id)
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if running {
            return;
        }
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.run_monitor(trade_id).await });
        self.monitors.insert(trade_id, handle);
    }

    /// Restart OCO monitors for every open trade, after recovery.
    pub fn resume_monitors(self: &Arc<Self>, trade_ids: &[Uuid]) {
        for trade_id in trade_ids {
            self.ensure_monitor(*trade_id);
        }
    }

    async fn run_monitor(self: Arc<Self>, trade_id: Uuid) {
        let mut ticker = interval(self.config.monitor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(%trade_id, "OCO monitor started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.poll_protective_orders(trade_id).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(%trade_id, error = %e, "OCO monitor pass failed"),
            }
        }

        self.monitors.remove(&trade_id);
        debug!(%trade_id, "OCO monitor stopped");
    }

    /// One monitor pass. Returns true once the trade no longer needs watching.
    async fn poll_protective_orders(&self, trade_id: Uuid) -> Result<bool> {
        let Some(symbol) = self.ledger.get_trade(trade_id).await.and_then(|t| {
            (t.status == TradeStatus::Open).then_some(t.symbol)
        }) else {
            return Ok(true);
        };

        let _guard = self.locks.lock(&symbol).await;
        let Some(mut trade) = self
            .ledger
            .get_trade(trade_id)
            .await
            .filter(|t| t.status == TradeStatus::Open)
        else {
            return Ok(true);
        };

        // an earlier settle left a sibling live; reconciliation finishes it
        if self.filled_protective_leg(&trade).await.is_some() {
            return Ok(false);
        }

        let legs = self.ledger.active_protective_orders(trade_id).await;
        if legs.is_empty() {
            return Ok(true);
        }
        for mut leg in legs {
            self.refresh_order(&mut leg).await;
            if leg.status == OrderStatus::Filled {
                self.settle_protective_fill(&mut trade, &leg).await?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One leg filled: cancel its sibling, then close the trade at the fill.
    async fn settle_protective_fill(&self, trade: &mut Trade, filled: &Order) -> Result<()> {
        let exit_type = match filled.role {
            OrderRole::TakeProfit => ExitType::TakeProfit,
            _ => ExitType::StopLoss,
        };

        let siblings: Vec<Order> = self
            .ledger
            .active_protective_orders(trade.trade_id)
            .await
            .into_iter()
            .filter(|o| o.order_id != filled.order_id)
            .collect();
        let mut cancel_failure = None;
        for mut sibling in siblings {
            match self.cancel_order(&mut sibling, trade, false).await {
                Ok(CancelOutcome::AlreadyFilled) => {
                    error!(
                        trade_id = %trade.trade_id,
                        order_id = %sibling.order_id,
                        "both protective legs filled"
                    );
                    self.mark_needs_reconciliation(trade, "both protective legs filled")
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    self.mark_needs_reconciliation(
                        trade,
                        format!("sibling {} cancel failed: {}", sibling.order_id, e),
                    )
                    .await;
                    cancel_failure.get_or_insert(e);
                }
            }
        }
        // the trade stays OPEN while a sibling may still be live
        if let Some(e) = cancel_failure {
            warn!(
                trade_id = %trade.trade_id,
                role = filled.role.as_str(),
                "protective fill left unsettled until reconciled"
            );
            return Err(e);
        }

        let price = filled
            .avg_fill_price
            .or(filled.stop_price)
            .ok_or_else(|| {
                PerpError::State(format!("filled order {} has no price", filled.order_id))
            })?;
        if filled.filled_qty < trade.remaining_size {
            let remainder = trade.remaining_size - filled.filled_qty;
            trade.record_reduction(filled.filled_qty, price)?;
            self.mark_needs_reconciliation(
                trade,
                format!("{} filled short by {}", filled.role.as_str(), remainder),
            )
            .await;
            return Ok(());
        }
        self.finalize_close(trade, price, exit_type).await?;
        Ok(())
    }

    // ==================== Exits ====================

    /// Close the whole position: pull the protective legs, then exit with a
    /// limit at `exit_price` less the slippage concession, falling back to a
    /// market order after the close timeout. Market straight away when no
    /// price is given.
    pub async fn close_position(
        &self,
        trade_id: Uuid,
        exit_type: ExitType,
        exit_price: Option<Decimal>,
    ) -> Result<Trade> {
        let symbol = self.trade_symbol(trade_id).await?;
        let _guard = self.locks.lock(&symbol).await;
        self.close_locked(trade_id, exit_type, exit_price, false).await
    }

    /// Market close that overrides exposure denials; always audited.
    pub async fn emergency_close_position(&self, trade_id: Uuid, reason: &str) -> Result<Trade> {
        let symbol = self.trade_symbol(trade_id).await?;
        let _guard = self.locks.lock(&symbol).await;

        let result = self
            .close_locked(trade_id, ExitType::Emergency, None, true)
            .await;
        let outcome = match &result {
            Ok(trade) => format!(
                "Emergency close of trade {} ({}): exited at {:?}, P&L {}",
                trade_id, reason, trade.exit_price, trade.realized_pnl
            ),
            Err(e) => format!("Emergency close of trade {} ({}) failed: {}", trade_id, reason, e),
        };
        self.audit
            .record(RiskEvent::new(
                Uuid::new_v4(),
                RiskEventType::EmergencyClose,
                Some(&symbol),
                RiskDecision::Action,
                outcome,
                self.risk.snapshot().await,
            ))
            .await;
        result
    }

    /// Emergency-close every open trade; returns how many closes failed.
    pub async fn emergency_close_all(&self, reason: &str) -> usize {
        let mut failures = 0;
        for trade in self.ledger.open_trades().await {
            if let Err(e) = self.emergency_close_position(trade.trade_id, reason).await {
                error!(trade_id = %trade.trade_id, error = %e, "emergency close failed");
                failures += 1;
            }
        }
        failures
    }

    async fn close_locked(
        &self,
        trade_id: Uuid,
        exit_type: ExitType,
        exit_price: Option<Decimal>,
        emergency: bool,
    ) -> Result<Trade> {
        let mut trade = self.open_trade(trade_id).await?;

        // a leg already closed the position on the exchange; finish that instead
        if let Some(leg) = self.filled_protective_leg(&trade).await {
            info!(%trade_id, role = leg.role.as_str(), "settling earlier protective fill");
            self.settle_protective_fill(&mut trade, &leg).await?;
            return Ok(trade);
        }

        for mut leg in self.ledger.active_protective_orders(trade_id).await {
            match self.cancel_order(&mut leg, &trade, emergency).await {
                Ok(CancelOutcome::AlreadyFilled) => {
                    info!(%trade_id, role = leg.role.as_str(), "protective leg filled before exit");
                    self.settle_protective_fill(&mut trade, &leg).await?;
                    if trade.status == TradeStatus::Closed {
                        return Ok(trade);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(%trade_id, role = leg.role.as_str(), error = %e, "protective cancel failed; exit aborted");
                    self.mark_needs_reconciliation(&mut trade, format!("cancel failed: {}", e))
                        .await;
                    return Err(e);
                }
            }
        }

        let reference = match exit_price {
            Some(price) => price,
            None => self.reference_price(&trade).await,
        };
        let limit = if emergency {
            None
        } else {
            exit_price.map(|p| self.concession(trade.side, p))
        };
        let qty = trade.remaining_size;
        let fill = self
            .execute_reducing(&mut trade, qty, OrderRole::Exit, limit, reference, emergency)
            .await?;
        let avg = fill.avg_price().unwrap_or(reference);

        if fill.qty < qty {
            trade.record_reduction(fill.qty, avg)?;
            self.sync_position_size(&trade).await;
            self.ledger.save_trade(&trade).await;
            return Err(PerpError::Timeout(format!(
                "exit for trade {} filled {} of {}",
                trade_id, fill.qty, qty
            )));
        }

        self.finalize_close(&mut trade, avg, exit_type).await?;
        Ok(trade)
    }

    /// Shrink an open position by `qty`, re-sizing its protective legs.
    ///
    /// Falls through to a full close when the remainder would drop below the
    /// exchange minimum.
    pub async fn reduce_position_size(
        &self,
        trade_id: Uuid,
        qty: Decimal,
        exit_type: ExitType,
    ) -> Result<Trade> {
        let symbol = self.trade_symbol(trade_id).await?;
        let _guard = self.locks.lock(&symbol).await;
        let mut trade = self.open_trade(trade_id).await?;

        let min_size = self.min_order_size(&symbol).await?;
        let qty = round_down(qty.min(trade.remaining_size), min_size);
        if qty.is_zero() {
            return Err(PerpError::Validation(format!(
                "reduction below minimum order size {}",
                min_size
            )));
        }
        if trade.remaining_size - qty < min_size {
            return self.close_locked(trade_id, exit_type, None, false).await;
        }

        let reference = self.reference_price(&trade).await;
        let fill = self
            .execute_reducing(&mut trade, qty, OrderRole::Reduce, None, reference, false)
            .await?;
        let avg = fill.avg_price().unwrap_or(reference);
        let pnl = trade.record_reduction(fill.qty, avg)?;
        self.ledger.save_trade(&trade).await;
        self.sync_position_size(&trade).await;
        info!(
            %trade_id,
            reduced = %fill.qty,
            remaining = %trade.remaining_size,
            %pnl,
            reason = %exit_type,
            "position reduced"
        );

        self.resize_protective_orders(&mut trade).await?;
        self.ledger.save_trade(&trade).await;
        Ok(trade)
    }

    /// Submit a reducing order (limit first when given, then market for the
    /// rest) and collect the fills.
    async fn execute_reducing(
        &self,
        trade: &mut Trade,
        qty: Decimal,
        role: OrderRole,
        limit: Option<Decimal>,
        reference: Decimal,
        emergency: bool,
    ) -> Result<ReduceFill> {
        let mut fill = ReduceFill {
            qty: Decimal::ZERO,
            notional: Decimal::ZERO,
        };

        if let Some(limit_price) = limit {
            let mut order = self
                .reducing_order(trade, role, OrderType::Limit, qty, limit_price, emergency)
                .await?;
            self.await_fill(&mut order, self.config.close_timeout()).await;
            if order.status.is_active() {
                debug!(trade_id = %trade.trade_id, "limit exit unfilled, falling back to market");
                if let Err(e) = self.cancel_order(&mut order, trade, emergency).await {
                    self.mark_needs_reconciliation(trade, format!("exit cancel failed: {}", e))
                        .await;
                    return Err(e);
                }
            }
            fill.qty += order.filled_qty;
            fill.notional += order.filled_qty * order.avg_fill_price.unwrap_or(limit_price);
        }

        let rest = qty - fill.qty;
        if rest > Decimal::ZERO {
            let mut order = self
                .reducing_order(trade, role, OrderType::Market, rest, reference, emergency)
                .await?;
            self.await_fill(&mut order, self.config.close_timeout()).await;
            fill.qty += order.filled_qty;
            fill.notional += order.filled_qty * order.avg_fill_price.unwrap_or(reference);
            if order.status != OrderStatus::Filled {
                self.mark_needs_reconciliation(
                    trade,
                    format!("market {} order {} ended {}", role.as_str(), order.order_id, order.status),
                )
                .await;
                if fill.qty.is_zero() {
                    return Err(PerpError::Timeout(format!(
                        "{} order for trade {} did not fill",
                        role.as_str(),
                        trade.trade_id
                    )));
                }
            }
        }
        Ok(fill)
    }

    async fn reducing_order(
        &self,
        trade: &mut Trade,
        role: OrderRole,
        order_type: OrderType,
        qty: Decimal,
        price: Decimal,
        emergency: bool,
    ) -> Result<Order> {
        let side = trade.side.exit_order_side();
        let mut check = OrderCheck::reduce(
            &trade.symbol,
            side,
            qty,
            price,
            order_type,
            role,
            trade.remaining_size,
        );
        if emergency {
            check = check.emergency();
        }
        self.gate.check_order(&check).await.into_result()?;

        let limit = (order_type == OrderType::Limit).then_some(price);
        let mut order = Order::new(trade.trade_id, &trade.symbol, side, role, order_type, qty)
            .with_price(limit);
        self.ledger.save_order(&order).await;
        if let Err(e) = self.submit(&mut order).await {
            self.mark_needs_reconciliation(
                trade,
                format!("{} submission failed: {}", role.as_str(), e),
            )
            .await;
            return Err(e);
        }
        Ok(order)
    }

    /// Replace protective legs whose size no longer matches the position.
    async fn resize_protective_orders(&self, trade: &mut Trade) -> Result<()> {
        for mut old in self.ledger.active_protective_orders(trade.trade_id).await {
            if old.size == trade.remaining_size {
                continue;
            }
            let Some(level) = old.stop_price else { continue };
            if self.ledger.is_flagged(&trade.symbol) {
                break;
            }

            // replacement first so the position is never unprotected
            match self.place_protective(trade, old.role, old.order_type, level).await {
                Ok(order) => match old.role {
                    OrderRole::StopLoss => trade.stop_order_id = Some(order.order_id),
                    _ => trade.take_profit_order_id = Some(order.order_id),
                },
                Err(e @ PerpError::RiskDenied { .. }) => {
                    warn!(trade_id = %trade.trade_id, error = %e, "resized leg denied");
                    continue;
                }
                Err(e) => {
                    self.mark_needs_reconciliation(trade, format!("leg resize failed: {}", e))
                        .await;
                    break;
                }
            }

            match self.cancel_order(&mut old, trade, false).await {
                Ok(CancelOutcome::AlreadyFilled) => {
                    self.settle_protective_fill(trade, &old).await?;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) => {
                    self.mark_needs_reconciliation(trade, format!("old leg cancel failed: {}", e))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// Move the stop. Only ever tightens: a level that would loosen the
    /// current stop is rejected.
    pub async fn update_stop_loss(self: &Arc<Self>, trade_id: Uuid, new_stop: Decimal) -> Result<Trade> {
        let symbol = self.trade_symbol(trade_id).await?;
        let _guard = self.locks.lock(&symbol).await;
        let mut trade = self.open_trade(trade_id).await?;

        if new_stop <= Decimal::ZERO {
            return Err(PerpError::Validation("stop must be positive".into()));
        }
        if let Some(current) = trade.stop_loss {
            if !trade.side.is_more_favorable_stop(new_stop, current) {
                return Err(PerpError::Validation(format!(
                    "stop {} would loosen current stop {} on {} trade",
                    new_stop, current, trade.side
                )));
            }
        }

        trade.stop_loss = Some(new_stop);
        self.registry
            .update(trade_id, |p| p.stop_loss = Some(new_stop))
            .await;
        if let Some(position) = self.registry.get_by_trade(trade_id).await {
            self.checkpoint(&position).await;
        }
        self.ledger.save_trade(&trade).await;

        if self.ledger.is_flagged(&symbol) {
            warn!(%trade_id, %new_stop, "exchange stop left unchanged until reconciled");
            return Ok(trade);
        }

        let old_stops: Vec<Order> = self
            .ledger
            .active_protective_orders(trade_id)
            .await
            .into_iter()
            .filter(|o| o.role == OrderRole::StopLoss)
            .collect();

        match self
            .place_protective(&trade, OrderRole::StopLoss, OrderType::StopLoss, new_stop)
            .await
        {
            Ok(order) => trade.stop_order_id = Some(order.order_id),
            Err(e @ PerpError::RiskDenied { .. }) => {
                warn!(%trade_id, error = %e, "replacement stop denied; software stop still applies");
                return Ok(trade);
            }
            Err(e) => {
                self.mark_needs_reconciliation(&mut trade, format!("stop update failed: {}", e))
                    .await;
                return Err(e);
            }
        }

        for mut old in old_stops {
            match self.cancel_order(&mut old, &trade, false).await {
                Ok(CancelOutcome::AlreadyFilled) => {
                    self.settle_protective_fill(&mut trade, &old).await?;
                    return Ok(trade);
                }
                Ok(_) => {}
                Err(e) => {
                    self.mark_needs_reconciliation(&mut trade, format!("old stop cancel failed: {}", e))
                        .await;
                }
            }
        }

        self.ledger.save_trade(&trade).await;
        self.ensure_monitor(trade_id);
        info!(%trade_id, %new_stop, "stop-loss moved");
        Ok(trade)
    }

    // ==================== Reconciliation ====================

    /// Compare one symbol against the exchange and clear its flag when they agree.
    ///
    /// Refreshes every live local order first, so fills that happened while
    /// we were not looking (including across a restart) settle normally.
    pub async fn reconcile_symbol(self: &Arc<Self>, symbol: &str) -> Result<ReconcileReport> {
        let guard = self.locks.lock(symbol).await;

        let mut refreshed = 0;
        for mut order in self.ledger.active_orders_for_symbol(symbol).await {
            if self.refresh_order(&mut order).await {
                refreshed += 1;
            }
        }

        if let Some(mut trade) = self.ledger.active_trade_for(symbol).await {
            match trade.status {
                TradeStatus::Pending => {
                    let trade_id = trade.trade_id;
                    if let Err(e) = self.resume_pending(trade).await {
                        warn!(%trade_id, error = %e, "pending entry resolved without a position");
                    }
                }
                TradeStatus::Open => {
                    if let Some(leg) = self.filled_protective_leg(&trade).await {
                        self.settle_protective_fill(&mut trade, &leg).await?;
                    }
                }
                _ => {}
            }
        }

        // live orders that no trade relies on can still move the position:
        // anything left behind by a finished trade, and superseded protective legs
        let mut orphans = 0;
        for mut order in self.ledger.active_orders_for_symbol(symbol).await {
            let Some(owner) = self.ledger.get_trade(order.trade_id).await else {
                continue;
            };
            let current_leg = match order.role {
                OrderRole::StopLoss => owner.stop_order_id,
                OrderRole::TakeProfit => owner.take_profit_order_id,
                _ => None,
            };
            let orphaned = owner.status.is_terminal()
                || (order.role.is_protective() && current_leg != Some(order.order_id));
            if !orphaned {
                continue;
            }
            match self.cancel_order(&mut order, &owner, false).await {
                Ok(CancelOutcome::AlreadyFilled) => {
                    error!(order_id = %order.order_id, trade_id = %owner.trade_id, "orphaned order filled");
                }
                Ok(_) => {
                    info!(order_id = %order.order_id, trade_id = %owner.trade_id, "orphaned order cancelled");
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "orphaned order still live");
                    orphans += 1;
                }
            }
        }

        let positions = retry_read(&self.retry, "get_positions", || self.exchange.get_positions())
            .await?;
        let exchange_size = positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.size * p.side.sign())
            .unwrap_or(Decimal::ZERO);
        let local = self
            .ledger
            .active_trade_for(symbol)
            .await
            .filter(|t| t.status == TradeStatus::Open);
        let local_size = local
            .as_ref()
            .map(|t| t.remaining_size * t.side.sign())
            .unwrap_or(Decimal::ZERO);
        let matched = local_size == exchange_size && orphans == 0;

        let was_flagged = self.ledger.is_flagged(symbol);
        if matched {
            self.ledger.clear_flag(symbol);
            if let Some(mut trade) = local {
                if trade.needs_reconciliation {
                    trade.needs_reconciliation = false;
                    self.ledger.save_trade(&trade).await;
                }
                self.place_protective_orders(&mut trade).await;
                self.ledger.save_trade(&trade).await;
                self.ensure_monitor(trade.trade_id);
            }
            if was_flagged {
                info!(%symbol, %local_size, "symbol reconciled; automated trading resumes");
            }
        } else {
            self.ledger.flag(
                symbol,
                format!(
                    "local size {} != exchange size {}, {} orphaned orders live",
                    local_size, exchange_size, orphans
                ),
            );
            error!(%symbol, %local_size, %exchange_size, orphans, "reconciliation mismatch");
        }
        drop(guard);

        if was_flagged || !matched {
            self.audit
                .record(RiskEvent::new(
                    Uuid::new_v4(),
                    RiskEventType::Reconciliation,
                    Some(symbol),
                    RiskDecision::Action,
                    format!(
                        "{}: local {} exchange {} ({} orders refreshed)",
                        if matched { "Reconciled" } else { "Mismatch" },
                        local_size,
                        exchange_size,
                        refreshed
                    ),
                    self.risk.snapshot().await,
                ))
                .await;
        }

        Ok(ReconcileReport {
            symbol: symbol.to_string(),
            local_size,
            exchange_size,
            orders_refreshed: refreshed,
            matched,
        })
    }

    /// Resolve an entry left PENDING, typically by a restart mid-fill.
    async fn resume_pending(self: &Arc<Self>, trade: Trade) -> Result<Trade> {
        let order = match trade.entry_order_id {
            Some(id) => self.ledger.get_order(id).await,
            None => None,
        };
        match order {
            Some(order) if order.exchange_order_id.is_some() => {
                let fallback = order.price.unwrap_or(Decimal::ZERO);
                self.settle_entry(trade, order, fallback).await
            }
            _ => {
                let mut trade = trade;
                trade.mark_failed("entry never acknowledged by the exchange")?;
                self.ledger.save_trade(&trade).await;
                self.metrics.inc_trades_failed();
                warn!(trade_id = %trade.trade_id, "pending trade had no live entry; marked failed");
                Ok(trade)
            }
        }
    }

    // ==================== Order plumbing ====================

    /// Send a new order once. Failures are recorded on the order, never retried.
    async fn submit(&self, order: &mut Order) -> Result<()> {
        let request = order.to_request();
        let placed = if order.order_type.is_trigger() {
            self.exchange.place_stop_order(&request).await
        } else {
            self.exchange.place_order(&request).await
        };

        match placed {
            Ok(ack) => {
                order.exchange_order_id = Some(ack.exchange_order_id.clone());
                order.transition(OrderStatus::Submitted)?;
                if ack.status == OrderStatus::Rejected {
                    order.transition(OrderStatus::Rejected)?;
                }
                self.metrics.inc_orders_submitted();
                self.ledger.save_order(order).await;
                debug!(
                    order_id = %order.order_id,
                    exchange_order_id = %ack.exchange_order_id,
                    role = order.role.as_str(),
                    "order acknowledged"
                );
                Ok(())
            }
            Err(e) => {
                order.error = Some(e.to_string());
                order.transition(OrderStatus::Failed)?;
                self.metrics.inc_orders_failed();
                self.ledger.save_order(order).await;
                error!(
                    order_id = %order.order_id,
                    symbol = %order.symbol,
                    role = order.role.as_str(),
                    error = %e,
                    "order submission failed"
                );
                Err(e)
            }
        }
    }

    /// Poll until the order is terminal or `wait` elapses.
    async fn await_fill(&self, order: &mut Order, wait: Duration) {
        let poll = async {
            loop {
                self.refresh_order(order).await;
                if order.status.is_terminal() {
                    return;
                }
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        };
        if tokio::time::timeout(wait, poll).await.is_err() {
            debug!(order_id = %order.order_id, "fill wait elapsed after {:?}", wait);
        }
    }

    /// Fold the exchange's view into the ledger copy; true when anything changed.
    async fn refresh_order(&self, order: &mut Order) -> bool {
        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            return false;
        };
        let report = match retry_read(&self.retry, "get_order_status", || {
            self.exchange.get_order_status(&exchange_order_id)
        })
        .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(order_id = %order.order_id, error = %e, "order status read failed");
                return false;
            }
        };

        let was_filled = order.status == OrderStatus::Filled;
        match order.apply_report(&report) {
            Ok(true) => {
                if !was_filled && order.status == OrderStatus::Filled {
                    self.metrics.inc_orders_filled();
                }
                self.ledger.save_order(order).await;
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(order_id = %order.order_id, error = %e, "ignoring inconsistent order report");
                false
            }
        }
    }

    /// Gate and cancel one order, then refresh it so late fills are captured.
    async fn cancel_order(
        &self,
        order: &mut Order,
        trade: &Trade,
        emergency: bool,
    ) -> Result<CancelOutcome> {
        let price = order
            .price
            .or(order.stop_price)
            .or(trade.entry_price)
            .unwrap_or(Decimal::ZERO);
        let mut check = OrderCheck::cancel(
            &order.symbol,
            order.side,
            order.remaining_qty(),
            price,
            order.role,
        );
        if emergency {
            check = check.emergency();
        }
        self.gate.check_order(&check).await.into_result()?;

        let Some(exchange_order_id) = order.exchange_order_id.clone() else {
            return Ok(CancelOutcome::AlreadyClosed);
        };
        let outcome = match self.exchange.cancel_order(&exchange_order_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                order.error = Some(format!("cancel failed: {}", e));
                self.ledger.save_order(order).await;
                error!(order_id = %order.order_id, error = %e, "cancel failed");
                return Err(e);
            }
        };

        self.refresh_order(order).await;
        if outcome == CancelOutcome::Cancelled && order.status.is_active() {
            order.transition(OrderStatus::Cancelled)?;
            self.ledger.save_order(order).await;
        }
        debug!(order_id = %order.order_id, ?outcome, "cancel processed");
        Ok(outcome)
    }

    // ==================== Helpers ====================

    async fn finalize_close(
        &self,
        trade: &mut Trade,
        exit_price: Decimal,
        exit_type: ExitType,
    ) -> Result<Decimal> {
        let pnl = trade.mark_closed(exit_price, exit_type)?;
        self.ledger.save_trade(trade).await;
        self.registry.remove_trade(trade.trade_id).await;
        if let Err(e) = self.ledger.store().delete_position(trade.trade_id).await {
            warn!(trade_id = %trade.trade_id, error = %e, "failed to drop position checkpoint");
        }
        self.metrics.inc_trades_closed();
        self.risk
            .record_closed_trade(&trade.symbol, pnl, Utc::now())
            .await;
        info!(
            trade_id = %trade.trade_id,
            symbol = %trade.symbol,
            %exit_type,
            %exit_price,
            %pnl,
            "trade closed"
        );
        Ok(pnl)
    }

    /// A protective leg that filled for the whole open size but was never settled.
    async fn filled_protective_leg(&self, trade: &Trade) -> Option<Order> {
        self.ledger
            .orders_for_trade(trade.trade_id)
            .await
            .into_iter()
            .find(|o| {
                o.role.is_protective()
                    && o.status == OrderStatus::Filled
                    && o.filled_qty >= trade.remaining_size
            })
    }

    async fn mark_needs_reconciliation(&self, trade: &mut Trade, reason: impl Into<String>) {
        trade.needs_reconciliation = true;
        self.ledger.flag(&trade.symbol, reason);
        self.ledger.save_trade(trade).await;
    }

    async fn sync_position_size(&self, trade: &Trade) {
        let remaining = trade.remaining_size;
        self.registry
            .update(trade.trade_id, |p| p.size = remaining)
            .await;
        if let Some(position) = self.registry.get_by_trade(trade.trade_id).await {
            self.checkpoint(&position).await;
        }
    }

    /// Persist a position snapshot, including trailing and profit-level state.
    pub async fn checkpoint(&self, position: &Position) {
        if let Err(e) = self.ledger.store().save_position(position).await {
            warn!(trade_id = %position.trade_id, error = %e, "position checkpoint failed");
        }
    }

    async fn open_trade(&self, trade_id: Uuid) -> Result<Trade> {
        let trade = self
            .ledger
            .get_trade(trade_id)
            .await
            .ok_or_else(|| PerpError::State(format!("unknown trade {}", trade_id)))?;
        if trade.status != TradeStatus::Open {
            error!(%trade_id, status = %trade.status, "operation requires an OPEN trade");
            return Err(PerpError::State(format!(
                "trade {} is {}, not OPEN",
                trade_id, trade.status
            )));
        }
        Ok(trade)
    }

    async fn trade_symbol(&self, trade_id: Uuid) -> Result<String> {
        self.ledger
            .get_trade(trade_id)
            .await
            .map(|t| t.symbol)
            .ok_or_else(|| PerpError::State(format!("unknown trade {}", trade_id)))
    }

    async fn min_order_size(&self, symbol: &str) -> Result<Decimal> {
        retry_read(&self.retry, "get_minimum_order_size", || {
            self.exchange.get_minimum_order_size(symbol)
        })
        .await
    }

    /// Last price, else the tracked mark, else the entry.
    async fn reference_price(&self, trade: &Trade) -> Decimal {
        match retry_read(&self.retry, "get_current_price", || {
            self.exchange.get_current_price(&trade.symbol)
        })
        .await
        {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol = %trade.symbol, error = %e, "price read failed, using last known");
                match self.registry.get_by_trade(trade.trade_id).await {
                    Some(position) => position.current_price,
                    None => trade.entry_price.unwrap_or(Decimal::ZERO),
                }
            }
        }
    }

    /// Limit price for an exit, conceding `exit_slippage` to get filled.
    fn concession(&self, side: Side, price: Decimal) -> Decimal {
        match side {
            Side::Long => price * (Decimal::ONE - self.config.exit_slippage),
            Side::Short => price * (Decimal::ONE + self.config.exit_slippage),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PaperConfig, RiskConfig};
    use crate::domain::{AccountBalance, DenyCode, OrderSide, PauseReason};
    use crate::exchange::{MockExchangeConnector, PaperExchange};
    use crate::market::MarketMonitor;
    use crate::persistence::{InMemoryStore, TradeStore};
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock;

    struct Fixture {
        engine: Arc<ExecutionEngine>,
        paper: Arc<PaperExchange>,
        store: Arc<InMemoryStore>,
        risk: Arc<RiskStateManager>,
        metrics: Arc<Metrics>,
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            fill_timeout_ms: 150,
            poll_interval_ms: 5,
            close_timeout_ms: 80,
            monitor_interval_ms: 5,
            ..ExecutionConfig::default()
        }
    }

    async fn build(exchange: Arc<dyn ExchangeConnector>, store: Arc<InMemoryStore>) -> (Arc<ExecutionEngine>, Arc<RiskStateManager>, Arc<Metrics>) {
        let audit = AuditLog::new(store.clone());
        let registry = PositionRegistry::new();
        let risk = Arc::new(RiskStateManager::new(
            Arc::new(RwLock::new(RiskConfig::default())),
            exchange.clone(),
            registry.clone(),
            audit.clone(),
            RetryPolicy::none(),
        ));
        let market = Arc::new(MarketMonitor::new(
            exchange.clone(),
            RetryPolicy::none(),
            60,
            20,
            dec!(50),
        ));
        let metrics = Arc::new(Metrics::new());
        let gate = Arc::new(RiskGate::new(
            risk.clone(),
            registry.clone(),
            market,
            audit.clone(),
            metrics.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(
            fast_config(),
            exchange,
            gate,
            risk.clone(),
            registry,
            Arc::new(TradeLedger::new(store)),
            audit,
            metrics.clone(),
            RetryPolicy::none(),
            ShutdownToken::never(),
        ));
        (engine, risk, metrics)
    }

    async fn fixture() -> Fixture {
        let mut cfg = PaperConfig::default();
        cfg.prices.insert("BTC-PERP".into(), dec!(50000));
        let paper = Arc::new(PaperExchange::new(cfg));
        let store = Arc::new(InMemoryStore::new());
        let (engine, risk, metrics) = build(paper.clone(), store.clone()).await;
        Fixture {
            engine,
            paper,
            store,
            risk,
            metrics,
        }
    }

    fn protected_long(size: Decimal) -> TradeRequest {
        TradeRequest::market("BTC-PERP", Side::Long, size)
            .with_levels(Some(dec!(49000)), Some(dec!(52000)))
            .with_strategy("test", None)
    }

    async fn wait_closed(f: &Fixture, trade_id: Uuid) -> Trade {
        for _ in 0..200 {
            if let Some(t) = f.store.get_trade(trade_id).await.unwrap() {
                if t.status == TradeStatus::Closed {
                    return t;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("trade {} never closed", trade_id);
    }

    #[tokio::test]
    async fn test_market_entry_opens_and_protects() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();

        assert_eq!(trade.status, TradeStatus::Open);
        assert_eq!(trade.entry_price, Some(dec!(50000)));
        assert!(trade.stop_order_id.is_some());
        assert!(trade.take_profit_order_id.is_some());
        assert!(f.engine.registry().contains("BTC-PERP").await);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 2);
        // entry plus both protective legs went through the gate
        assert_eq!(f.metrics.gate_approved.load(std::sync::atomic::Ordering::Relaxed), 3);
        assert_eq!(f.store.load_positions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_fill_cancels_take_profit_then_closes() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();

        f.paper.set_price("BTC-PERP", dec!(48900)).await;
        let closed = wait_closed(&f, trade.trade_id).await;

        assert_eq!(closed.exit_reason, Some(ExitType::StopLoss));
        assert_eq!(closed.realized_pnl, dec!(-11));
        let orders = f.store.orders_for_trade(trade.trade_id).await.unwrap();
        let tp = orders
            .iter()
            .find(|o| o.role == OrderRole::TakeProfit)
            .unwrap();
        assert_eq!(tp.status, OrderStatus::Cancelled);
        assert!(tp.updated_at <= closed.closed_at.unwrap());
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 0);
        assert!(!f.engine.registry().contains("BTC-PERP").await);

        let state = f.risk.cached().await;
        assert_eq!(state.daily_pnl, dec!(-11));
        assert_eq!(state.consecutive_losses, 1);
    }

    #[tokio::test]
    async fn test_denied_entry_never_reaches_exchange() {
        let mut mock = MockExchangeConnector::new();
        mock.expect_is_valid_symbol().returning(|_| Ok(true));
        mock.expect_get_minimum_order_size()
            .returning(|_| Ok(dec!(0.001)));
        mock.expect_get_current_price()
            .returning(|_| Ok(dec!(50000)));
        mock.expect_get_account_balance().returning(|| {
            Ok(AccountBalance {
                total: dec!(10000),
                available: dec!(10000),
            })
        });
        mock.expect_place_order().times(0);
        mock.expect_place_stop_order().times(0);
        mock.expect_cancel_order().times(0);

        let store = Arc::new(InMemoryStore::new());
        let (engine, risk, metrics) = build(Arc::new(mock), store.clone()).await;
        risk.pause(PauseReason::Manual).await;

        let err = engine
            .execute_trade(protected_long(dec!(0.01)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PerpError::RiskDenied {
                code: DenyCode::TradingPaused,
                ..
            }
        ));
        assert!(engine.ledger().active_trade_for("BTC-PERP").await.is_none());
        assert!(store.load_active_trades().await.unwrap().is_empty());
        assert_eq!(metrics.gate_denials(DenyCode::TradingPaused), 1);
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_unfilled_entry_is_cancelled_and_failed() {
        let f = fixture().await;
        f.paper.hold_fills("BTC-PERP", true).await;

        let err = f
            .engine
            .execute_trade(TradeRequest::market("BTC-PERP", Side::Long, dec!(0.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, PerpError::Timeout(_)));
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 0);
        assert!(f.engine.ledger().active_trade_for("BTC-PERP").await.is_none());
        assert!(!f.engine.registry().contains("BTC-PERP").await);
        assert_eq!(f.metrics.trades_failed.load(std::sync::atomic::Ordering::Relaxed), 1);
        // no reconciliation needed after a clean cancel
        assert!(!f.engine.ledger().is_flagged("BTC-PERP"));
    }

    #[tokio::test]
    async fn test_submission_failure_blocks_symbol_until_reconciled() {
        let f = fixture().await;
        f.paper.fail_next_mutation("connection reset").await;

        let err = f
            .engine
            .execute_trade(protected_long(dec!(0.01)))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(f.engine.ledger().is_flagged("BTC-PERP"));
        assert_eq!(f.paper.mutation_count(), 1);

        // no automatic resend
        let blocked = f.engine.execute_trade(protected_long(dec!(0.01))).await;
        assert!(matches!(blocked, Err(PerpError::State(_))));
        assert_eq!(f.paper.mutation_count(), 1);

        // the exchange never saw the order, so the books agree
        let report = f.engine.reconcile_symbol("BTC-PERP").await.unwrap();
        assert!(report.matched);
        assert!(!f.engine.ledger().is_flagged("BTC-PERP"));
        f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_keeps_flag_on_mismatch() {
        let f = fixture().await;
        f.paper
            .place_order(&crate::domain::OrderRequest::market(
                "BTC-PERP",
                OrderSide::Buy,
                dec!(0.005),
            ))
            .await
            .unwrap();

        let report = f.engine.reconcile_symbol("BTC-PERP").await.unwrap();
        assert!(!report.matched);
        assert_eq!(report.exchange_size, dec!(0.005));
        assert!(f.engine.ledger().is_flagged("BTC-PERP"));
    }

    #[tokio::test]
    async fn test_limit_exit_fills_with_concession() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();
        f.paper.set_price("BTC-PERP", dec!(51000)).await;

        let closed = f
            .engine
            .close_position(trade.trade_id, ExitType::Manual, Some(dec!(51000)))
            .await
            .unwrap();
        // 51000 less 20 bps
        assert_eq!(closed.exit_price, Some(dec!(50898)));
        assert_eq!(closed.realized_pnl, dec!(8.98));
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 0);
        assert_eq!(f.paper.net_position("BTC-PERP").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_unfilled_limit_exit_falls_back_to_market() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();

        let closed = f
            .engine
            .close_position(trade.trade_id, ExitType::Manual, Some(dec!(51500)))
            .await
            .unwrap();
        assert_eq!(closed.exit_price, Some(dec!(50000)));
        assert_eq!(closed.realized_pnl, Decimal::ZERO);
        assert_eq!(f.paper.net_position("BTC-PERP").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_closing_twice_is_a_state_error() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();
        f.engine
            .close_position(trade.trade_id, ExitType::Manual, None)
            .await
            .unwrap();
        let again = f
            .engine
            .close_position(trade.trade_id, ExitType::Manual, None)
            .await;
        assert!(matches!(again, Err(PerpError::State(_))));
    }

    #[tokio::test]
    async fn test_stop_update_only_tightens() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();

        let moved = f
            .engine
            .update_stop_loss(trade.trade_id, dec!(49500))
            .await
            .unwrap();
        assert_eq!(moved.stop_loss, Some(dec!(49500)));
        assert_ne!(moved.stop_order_id, trade.stop_order_id);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 2);
        let position = f.engine.registry().get("BTC-PERP").await.unwrap();
        assert_eq!(position.stop_loss, Some(dec!(49500)));

        let looser = f.engine.update_stop_loss(trade.trade_id, dec!(49200)).await;
        assert!(matches!(looser, Err(PerpError::Validation(_))));
    }

    #[tokio::test]
    async fn test_partial_reduction_resizes_legs() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.02))).await.unwrap();
        f.paper.set_price("BTC-PERP", dec!(50500)).await;

        let reduced = f
            .engine
            .reduce_position_size(trade.trade_id, dec!(0.01), ExitType::PartialProfit)
            .await
            .unwrap();
        assert_eq!(reduced.status, TradeStatus::Open);
        assert_eq!(reduced.remaining_size, dec!(0.01));
        assert_eq!(reduced.realized_pnl, dec!(5));

        let legs = f.engine.ledger().active_protective_orders(trade.trade_id).await;
        assert_eq!(legs.len(), 2);
        assert!(legs.iter().all(|o| o.size == dec!(0.01)));
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 2);
        assert_eq!(f.engine.registry().get("BTC-PERP").await.unwrap().size, dec!(0.01));
    }

    #[tokio::test]
    async fn test_emergency_close_is_audited() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();

        let closed = f
            .engine
            .emergency_close_position(trade.trade_id, "operator")
            .await
            .unwrap();
        assert_eq!(closed.exit_reason, Some(ExitType::Emergency));
        let events = f.store.risk_events(100).await.unwrap();
        assert!(events
            .iter()
            .any(|e| e.event_type == RiskEventType::EmergencyClose));
    }

    #[tokio::test]
    async fn test_failed_leg_cancel_keeps_trade_open() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();
        f.paper.fail_next_mutation("connection reset").await;

        let err = f
            .engine
            .close_position(trade.trade_id, ExitType::Manual, None)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let kept = f.store.get_trade(trade.trade_id).await.unwrap().unwrap();
        assert_eq!(kept.status, TradeStatus::Open);
        assert!(kept.needs_reconciliation);
        assert!(f.engine.ledger().is_flagged("BTC-PERP"));
        // no exit was sent, both legs still protect the position
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 2);
        assert_eq!(f.paper.net_position("BTC-PERP").await, dec!(0.01));

        let report = f.engine.reconcile_symbol("BTC-PERP").await.unwrap();
        assert!(report.matched);
        let closed = f
            .engine
            .close_position(trade.trade_id, ExitType::Manual, None)
            .await
            .unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 0);
        assert_eq!(f.paper.net_position("BTC-PERP").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_stop_fill_waits_for_sibling_cancel() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();
        f.paper.fail_next_mutation("connection reset").await;
        f.paper.set_price("BTC-PERP", dec!(48900)).await;

        for _ in 0..200 {
            if f.engine.ledger().is_flagged("BTC-PERP") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.engine.ledger().is_flagged("BTC-PERP"));
        let pending = f.store.get_trade(trade.trade_id).await.unwrap().unwrap();
        assert_eq!(pending.status, TradeStatus::Open);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 1);
        assert_eq!(f.paper.net_position("BTC-PERP").await, Decimal::ZERO);

        let report = f.engine.reconcile_symbol("BTC-PERP").await.unwrap();
        assert!(report.matched);
        let closed = f.store.get_trade(trade.trade_id).await.unwrap().unwrap();
        assert_eq!(closed.status, TradeStatus::Closed);
        assert_eq!(closed.exit_reason, Some(ExitType::StopLoss));
        assert_eq!(closed.realized_pnl, dec!(-11));
        let tp = f
            .store
            .orders_for_trade(trade.trade_id)
            .await
            .unwrap()
            .into_iter()
            .find(|o| o.role == OrderRole::TakeProfit)
            .unwrap();
        assert_eq!(tp.status, OrderStatus::Cancelled);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 0);
        assert!(!f.engine.ledger().is_flagged("BTC-PERP"));
    }

    #[tokio::test]
    async fn test_reconcile_cancels_leg_left_by_closed_trade() {
        let f = fixture().await;
        let trade = f.engine.execute_trade(protected_long(dec!(0.01))).await.unwrap();
        let closed = f
            .engine
            .close_position(trade.trade_id, ExitType::Manual, None)
            .await
            .unwrap();

        let mut stray = Order::new(
            closed.trade_id,
            "BTC-PERP",
            OrderSide::Sell,
            OrderRole::StopLoss,
            OrderType::StopLoss,
            dec!(0.01),
        )
        .with_stop_price(Some(dec!(45000)));
        f.engine.ledger().save_order(&stray).await;
        f.engine.submit(&mut stray).await.unwrap();
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 1);

        // flat on both sides, but the live stop keeps the symbol flagged
        f.paper.fail_next_mutation("connection reset").await;
        let report = f.engine.reconcile_symbol("BTC-PERP").await.unwrap();
        assert!(!report.matched);
        assert_eq!(report.exchange_size, Decimal::ZERO);
        assert!(f.engine.ledger().is_flagged("BTC-PERP"));
        let blocked = f.engine.execute_trade(protected_long(dec!(0.01))).await;
        assert!(matches!(blocked, Err(PerpError::State(_))));

        let report = f.engine.reconcile_symbol("BTC-PERP").await.unwrap();
        assert!(report.matched);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 0);
        let stray = f.engine.ledger().get_order(stray.order_id).await.unwrap();
        assert_eq!(stray.status, OrderStatus::Cancelled);
        assert!(!f.engine.ledger().is_flagged("BTC-PERP"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_entries_on_one_symbol_open_once() {
        let f = fixture().await;

        let (a, b) = tokio::join!(
            f.engine.execute_trade(protected_long(dec!(0.01))),
            f.engine.execute_trade(protected_long(dec!(0.01))),
        );

        let opened = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(opened, 1);
        let refused = a.err().or(b.err()).unwrap();
        assert!(matches!(refused, PerpError::Validation(_)));
        assert_eq!(f.paper.net_position("BTC-PERP").await, dec!(0.01));
        assert_eq!(f.store.load_active_trades().await.unwrap().len(), 1);
        assert_eq!(f.paper.active_order_count("BTC-PERP").await, 2);
    }
}
