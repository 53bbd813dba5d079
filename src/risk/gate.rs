//! Pre-trade risk gate
//!
//! Every order mutation passes through `RiskGate::check_order` first. Entry
//! orders run the full check list in a fixed order and stop at the first
//! denial. Reduce-only orders (protective legs, exits, reductions) only need
//! to stay within the tracked open size. Each call appends exactly one
//! `RiskEvent` and bumps one metrics counter.

use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::audit::AuditLog;
use super::state::{RiskStateManager, SharedLimits};
use crate::config::RiskConfig;
use crate::domain::{
    DenyCode, OrderRole, OrderSide, OrderType, RiskDecision, RiskEvent, RiskEventType, RiskState,
};
use crate::error::{PerpError, Result};
use crate::market::MarketMonitor;
use crate::position::PositionRegistry;
use crate::services::Metrics;

/// What the caller intends to do with the order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    Submit,
    Cancel,
}

/// Order under evaluation
#[derive(Debug, Clone)]
pub struct OrderCheck {
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    /// Reference price used for notional (limit, trigger or last price)
    pub price: Decimal,
    pub order_type: OrderType,
    pub role: OrderRole,
    pub action: GateAction,
    /// Size still held; required for reduce-only orders
    pub position_size: Option<Decimal>,
    /// Emergency close: exposure denials become an audited override
    pub emergency: bool,
}

impl OrderCheck {
    pub fn entry(
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
        order_type: OrderType,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            size,
            price,
            order_type,
            role: OrderRole::Entry,
            action: GateAction::Submit,
            position_size: None,
            emergency: false,
        }
    }

    pub fn reduce(
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
        order_type: OrderType,
        role: OrderRole,
        position_size: Decimal,
    ) -> Self {
        Self {
            role,
            position_size: Some(position_size),
            ..Self::entry(symbol, side, size, price, order_type)
        }
    }

    pub fn cancel(symbol: &str, side: OrderSide, size: Decimal, price: Decimal, role: OrderRole) -> Self {
        Self {
            role,
            action: GateAction::Cancel,
            ..Self::entry(symbol, side, size, price, OrderType::Market)
        }
    }

    pub fn emergency(mut self) -> Self {
        self.emergency = true;
        self
    }

    pub fn notional(&self) -> Decimal {
        self.size * self.price
    }

    fn describe(&self) -> String {
        let verb = match self.action {
            GateAction::Submit => "submit",
            GateAction::Cancel => "cancel",
        };
        format!(
            "{} {} {} {} {} @ {}",
            verb,
            self.role.as_str(),
            self.side,
            self.size,
            self.symbol,
            self.price
        )
    }
}

/// Verdict returned to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub approved: bool,
    pub reason: String,
    pub correlation_id: Uuid,
    pub code: Option<DenyCode>,
}

impl GateDecision {
    /// Approval as the correlation id, denial as `PerpError::RiskDenied`.
    pub fn into_result(self) -> Result<Uuid> {
        if self.approved {
            return Ok(self.correlation_id);
        }
        Err(PerpError::RiskDenied {
            code: self.code.unwrap_or(DenyCode::InvalidRequest),
            reason: self.reason,
            correlation_id: self.correlation_id,
        })
    }
}

type Denial = (DenyCode, String);

pub struct RiskGate {
    limits: SharedLimits,
    state: Arc<RiskStateManager>,
    registry: PositionRegistry,
    market: Arc<MarketMonitor>,
    audit: AuditLog,
    metrics: Arc<Metrics>,
}

impl RiskGate {
    pub fn new(
        state: Arc<RiskStateManager>,
        registry: PositionRegistry,
        market: Arc<MarketMonitor>,
        audit: AuditLog,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            limits: state.limits().clone(),
            state,
            registry,
            market,
            audit,
            metrics,
        }
    }

    pub async fn check_order(&self, check: &OrderCheck) -> GateDecision {
        let correlation_id = Uuid::new_v4();
        let limits = self.limits.read().await.clone();

        let (verdict, snapshot) = if check.role.is_reduce_only() || check.action == GateAction::Cancel {
            (self.evaluate_reducing(check), self.state.snapshot().await)
        } else {
            match self.state.current().await {
                Ok(state) => (
                    self.evaluate_entry(check, &state, &limits).await,
                    state.snapshot(),
                ),
                Err(e) => (
                    Err((
                        DenyCode::InvalidRequest,
                        format!("Risk state unavailable: {}", e),
                    )),
                    self.state.snapshot().await,
                ),
            }
        };

        let (decision, event) = match verdict {
            Ok(()) => {
                let reason = format!("Approved: {}", check.describe());
                let event = RiskEvent::new(
                    correlation_id,
                    RiskEventType::GateDecision,
                    Some(&check.symbol),
                    RiskDecision::Approved,
                    reason.clone(),
                    snapshot,
                );
                (
                    GateDecision {
                        approved: true,
                        reason,
                        correlation_id,
                        code: None,
                    },
                    event,
                )
            }
            Err((DenyCode::PositionExposure, why)) if check.emergency => {
                let reason = format!("Emergency override: {}", why);
                let event = RiskEvent::new(
                    correlation_id,
                    RiskEventType::EmergencyOverride,
                    Some(&check.symbol),
                    RiskDecision::Approved,
                    reason.clone(),
                    snapshot,
                )
                .with_code(Some(DenyCode::PositionExposure));
                (
                    GateDecision {
                        approved: true,
                        reason,
                        correlation_id,
                        code: None,
                    },
                    event,
                )
            }
            Err((code, reason)) => {
                let event = RiskEvent::new(
                    correlation_id,
                    RiskEventType::GateDecision,
                    Some(&check.symbol),
                    RiskDecision::Denied,
                    reason.clone(),
                    snapshot,
                )
                .with_code(Some(code));
                (
                    GateDecision {
                        approved: false,
                        reason,
                        correlation_id,
                        code: Some(code),
                    },
                    event,
                )
            }
        };

        self.metrics.inc_gate_decision(decision.code);
        self.audit.record(event).await;
        decision
    }

    fn evaluate_reducing(&self, check: &OrderCheck) -> std::result::Result<(), Denial> {
        if check.action == GateAction::Cancel {
            return Ok(());
        }
        if check.size <= Decimal::ZERO || check.price <= Decimal::ZERO {
            return Err((
                DenyCode::InvalidRequest,
                format!("Invalid order: size {} price {}", check.size, check.price),
            ));
        }
        let Some(open) = check.position_size else {
            return Err((
                DenyCode::InvalidRequest,
                format!("No tracked position for reduce-only order on {}", check.symbol),
            ));
        };
        if check.size > open {
            return Err((
                DenyCode::PositionExposure,
                format!(
                    "Reduce-only size {} exceeds open position size {} on {}",
                    check.size, open, check.symbol
                ),
            ));
        }
        Ok(())
    }

    async fn evaluate_entry(
        &self,
        check: &OrderCheck,
        state: &RiskState,
        limits: &RiskConfig,
    ) -> std::result::Result<(), Denial> {
        if check.size <= Decimal::ZERO || check.price <= Decimal::ZERO {
            return Err((
                DenyCode::InvalidRequest,
                format!("Invalid order: size {} price {}", check.size, check.price),
            ));
        }
        let pv = state.portfolio_value;
        if pv <= Decimal::ZERO {
            return Err((
                DenyCode::InvalidRequest,
                format!("Portfolio value {} cannot support new exposure", pv),
            ));
        }
        let notional = check.notional();

        // 1. Daily loss
        let loss_floor = -(limits.max_daily_loss * pv);
        if state.daily_pnl < loss_floor {
            return Err((
                DenyCode::DailyLoss,
                format!(
                    "Daily loss limit exceeded: daily P&L {} below {} ({}% of {})",
                    state.daily_pnl,
                    loss_floor,
                    limits.max_daily_loss * Decimal::ONE_HUNDRED,
                    pv
                ),
            ));
        }

        // 2. Per-symbol exposure
        let existing = self.registry.exposure(&check.symbol).await;
        let symbol_fraction = (existing + notional) / pv;
        if symbol_fraction > limits.max_position_size {
            return Err((
                DenyCode::PositionExposure,
                format!(
                    "Position exposure on {} would be {}% of portfolio, limit {}%",
                    check.symbol,
                    pct(symbol_fraction),
                    pct(limits.max_position_size)
                ),
            ));
        }

        // 3. Loss streak
        if state.consecutive_losses >= limits.max_consecutive_losses {
            let until = state
                .breaker_tripped_at
                .map(|t| (t + limits.breaker_cooldown()).to_rfc3339())
                .unwrap_or_else(|| "cooldown".to_string());
            return Err((
                DenyCode::ConsecutiveLosses,
                format!(
                    "Consecutive-loss breaker tripped: {} losing trades in a row (limit {}), blocked until {}",
                    state.consecutive_losses, limits.max_consecutive_losses, until
                ),
            ));
        }

        // 4. Pauses
        if state.trading_paused {
            let why = state
                .pause_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unspecified".to_string());
            return Err((DenyCode::TradingPaused, format!("Trading paused: {}", why)));
        }
        if state.event_pause {
            return Err((DenyCode::TradingPaused, "Event pause active".to_string()));
        }

        // 5. Portfolio
        let drawdown = state.drawdown();
        if drawdown > limits.max_drawdown {
            return Err((
                DenyCode::PortfolioRisk,
                format!(
                    "Drawdown {}% exceeds limit {}%",
                    pct(drawdown),
                    pct(limits.max_drawdown)
                ),
            ));
        }
        let (total_exposure, unrealized, open) = self.registry.totals().await;
        let total_fraction = (total_exposure + notional) / pv;
        if total_fraction > limits.max_total_exposure {
            return Err((
                DenyCode::PortfolioRisk,
                format!(
                    "Aggregate exposure would be {}% of portfolio, limit {}%",
                    pct(total_fraction),
                    pct(limits.max_total_exposure)
                ),
            ));
        }
        if limits.max_open_positions > 0
            && open >= limits.max_open_positions
            && !self.registry.contains(&check.symbol).await
        {
            return Err((
                DenyCode::PortfolioRisk,
                format!(
                    "Max open positions reached: {} of {}",
                    open, limits.max_open_positions
                ),
            ));
        }
        let aggregate = state.daily_pnl + unrealized;
        if aggregate < loss_floor {
            return Err((
                DenyCode::PortfolioRisk,
                format!(
                    "Aggregate daily loss {} (realized plus unrealized) below {}",
                    aggregate, loss_floor
                ),
            ));
        }

        // 6. Balance
        if state.available_balance < limits.min_account_balance {
            return Err((
                DenyCode::MinimumBalance,
                format!(
                    "Available balance {} below minimum {}",
                    state.available_balance, limits.min_account_balance
                ),
            ));
        }

        // 7. Market
        let conditions = match self.market.conditions(&check.symbol).await {
            Ok(c) => c,
            Err(e) => {
                return Err((
                    DenyCode::MarketConditions,
                    format!("Market data unavailable for {}: {}", check.symbol, e),
                ))
            }
        };
        if conditions.volatility > limits.max_volatility {
            return Err((
                DenyCode::MarketConditions,
                format!(
                    "Volatility {} on {} above limit {}",
                    conditions.volatility, check.symbol, limits.max_volatility
                ),
            ));
        }
        if conditions.spread_bps > limits.max_spread_bps {
            return Err((
                DenyCode::MarketConditions,
                format!(
                    "Spread {}bps on {} above limit {}bps",
                    conditions.spread_bps.round_dp(2),
                    check.symbol,
                    limits.max_spread_bps
                ),
            ));
        }
        if conditions.depth_notional < limits.min_depth_notional {
            return Err((
                DenyCode::MarketConditions,
                format!(
                    "Book depth {} on {} below minimum {}",
                    conditions.depth_notional.round_dp(0),
                    check.symbol,
                    limits.min_depth_notional
                ),
            ));
        }

        debug!(symbol = %check.symbol, %notional, "entry passed all risk checks");
        Ok(())
    }
}

fn pct(fraction: Decimal) -> Decimal {
    (fraction * Decimal::ONE_HUNDRED).round_dp(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::domain::{MarketConditions, PauseReason};
    use crate::exchange::{ExchangeConnector, PaperExchange, RetryPolicy};
    use crate::persistence::InMemoryStore;
    use crate::persistence::TradeStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tokio::sync::RwLock;

    struct Fixture {
        gate: RiskGate,
        state: Arc<RiskStateManager>,
        market: Arc<MarketMonitor>,
        store: Arc<InMemoryStore>,
        metrics: Arc<Metrics>,
    }

    async fn fixture(limits: RiskConfig) -> Fixture {
        let mut paper = PaperConfig::default();
        paper.prices.insert("BTC-PERP".into(), dec!(50000));
        let exchange: Arc<dyn ExchangeConnector> = Arc::new(PaperExchange::new(paper));
        let store = Arc::new(InMemoryStore::new());
        let audit = AuditLog::new(store.clone());
        let registry = PositionRegistry::new();
        let state = Arc::new(RiskStateManager::new(
            Arc::new(RwLock::new(limits)),
            exchange.clone(),
            registry.clone(),
            audit.clone(),
            RetryPolicy::none(),
        ));
        state.refresh().await.unwrap();
        let market = Arc::new(MarketMonitor::new(
            exchange,
            RetryPolicy::none(),
            60,
            20,
            dec!(50),
        ));
        let metrics = Arc::new(Metrics::new());
        let gate = RiskGate::new(
            state.clone(),
            registry,
            market.clone(),
            audit,
            metrics.clone(),
        );
        Fixture {
            gate,
            state,
            market,
            store,
            metrics,
        }
    }

    fn small_entry() -> OrderCheck {
        OrderCheck::entry(
            "BTC-PERP",
            OrderSide::Buy,
            dec!(0.01),
            dec!(50000),
            OrderType::Market,
        )
    }

    #[tokio::test]
    async fn test_approves_within_limits() {
        let f = fixture(RiskConfig::default()).await;
        let d = f.gate.check_order(&small_entry()).await;
        assert!(d.approved, "{}", d.reason);
        assert_eq!(f.store.event_count().await, 1);
        assert_eq!(f.metrics.gate_approved.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_daily_loss_denial() {
        let f = fixture(RiskConfig::default()).await;
        let mut state = f.state.cached().await;
        state.daily_pnl = dec!(-520);
        f.state.replace(state).await;

        let d = f.gate.check_order(&small_entry()).await;
        assert!(!d.approved);
        assert!(d.reason.contains("Daily loss limit"), "{}", d.reason);
        assert_eq!(d.code, Some(DenyCode::DailyLoss));

        let events = f.store.risk_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].correlation_id, d.correlation_id);
        assert_eq!(events[0].decision, RiskDecision::Denied);
        assert_eq!(f.metrics.gate_denials(DenyCode::DailyLoss), 1);
    }

    #[tokio::test]
    async fn test_exposure_checked_before_breaker() {
        let f = fixture(RiskConfig::default()).await;
        let mut state = f.state.cached().await;
        state.consecutive_losses = 10;
        f.state.replace(state).await;

        // 0.1 BTC = 5000 = 50% of portfolio
        let big = OrderCheck {
            size: dec!(0.1),
            ..small_entry()
        };
        assert_eq!(
            f.gate.check_order(&big).await.code,
            Some(DenyCode::PositionExposure)
        );
        let d = f.gate.check_order(&small_entry()).await;
        assert_eq!(d.code, Some(DenyCode::ConsecutiveLosses));
        assert!(d.reason.contains("Consecutive-loss breaker"));
    }

    #[tokio::test]
    async fn test_pause_and_event_pause() {
        let f = fixture(RiskConfig::default()).await;
        f.state.set_event_pause(true).await;
        assert_eq!(
            f.gate.check_order(&small_entry()).await.code,
            Some(DenyCode::TradingPaused)
        );
        f.state.set_event_pause(false).await;
        f.state.pause(PauseReason::Manual).await;
        let d = f.gate.check_order(&small_entry()).await;
        assert!(d.reason.contains("manual"));
    }

    #[tokio::test]
    async fn test_drawdown_and_balance() {
        let f = fixture(RiskConfig::default()).await;
        let mut state = f.state.cached().await;
        state.peak_portfolio_value = dec!(20000);
        f.state.replace(state.clone()).await;
        assert_eq!(
            f.gate.check_order(&small_entry()).await.code,
            Some(DenyCode::PortfolioRisk)
        );

        state.peak_portfolio_value = dec!(10000);
        state.available_balance = dec!(50);
        f.state.replace(state).await;
        assert_eq!(
            f.gate.check_order(&small_entry()).await.code,
            Some(DenyCode::MinimumBalance)
        );
    }

    #[tokio::test]
    async fn test_market_conditions_denial() {
        let f = fixture(RiskConfig::default()).await;
        f.market.insert(MarketConditions {
            symbol: "BTC-PERP".into(),
            volatility: dec!(0.5),
            spread_bps: dec!(1),
            depth_notional: dec!(1000000),
            observed_at: Utc::now(),
        });
        let d = f.gate.check_order(&small_entry()).await;
        assert_eq!(d.code, Some(DenyCode::MarketConditions));
        assert!(d.reason.contains("Volatility"));
    }

    #[tokio::test]
    async fn test_reduce_only_ignores_entry_blocks() {
        let f = fixture(RiskConfig::default()).await;
        f.state.pause(PauseReason::EmergencyStop).await;
        let stop = OrderCheck::reduce(
            "BTC-PERP",
            OrderSide::Sell,
            dec!(0.5),
            dec!(49000),
            OrderType::StopLoss,
            OrderRole::StopLoss,
            dec!(0.5),
        );
        assert!(f.gate.check_order(&stop).await.approved);

        let oversized = OrderCheck {
            size: dec!(0.6),
            ..stop.clone()
        };
        let d = f.gate.check_order(&oversized).await;
        assert_eq!(d.code, Some(DenyCode::PositionExposure));

        let overridden = f.gate.check_order(&oversized.emergency()).await;
        assert!(overridden.approved);
        let events = f.store.risk_events(10).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, RiskEventType::EmergencyOverride);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_denial_into_result() {
        let f = fixture(RiskConfig::default()).await;
        f.state.set_event_pause(true).await;
        let err = f.gate.check_order(&small_entry()).await.into_result().unwrap_err();
        assert!(matches!(
            err,
            PerpError::RiskDenied {
                code: DenyCode::TradingPaused,
                ..
            }
        ));
    }
}
