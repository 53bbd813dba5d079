//! Signal intake
//!
//! Admission control in front of the execution engine: shape and expiry
//! checks, a confidence floor, the end-of-day cutoff, one trade per symbol,
//! a per-symbol cooldown and a rolling hourly cap. Admitted signals are sized
//! from the account's risk budget and handed to the engine on their own task,
//! so a slow fill on one symbol never stalls intake for the others.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashSet;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::services::Services;
use crate::coordination::ShutdownToken;
use crate::domain::{Trade, TradingSignal};
use crate::error::{PerpError, Result};
use crate::exchange::retry_read;
use crate::execution::TradeRequest;
use crate::risk::{position_size, SizingInput};

/// Why a signal was dropped before or during execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Invalid,
    Expired,
    LowConfidence,
    EmergencyStop,
    EndOfDay,
    PositionOpen,
    Cooldown,
    HourlyCap,
    TooSmall,
    MarketData,
    RiskDenied,
    ExecutionFailed,
}

impl Rejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rejection::Invalid => "invalid",
            Rejection::Expired => "expired",
            Rejection::LowConfidence => "low_confidence",
            Rejection::EmergencyStop => "emergency_stop",
            Rejection::EndOfDay => "end_of_day",
            Rejection::PositionOpen => "position_open",
            Rejection::Cooldown => "cooldown",
            Rejection::HourlyCap => "hourly_cap",
            Rejection::TooSmall => "too_small",
            Rejection::MarketData => "market_data",
            Rejection::RiskDenied => "risk_denied",
            Rejection::ExecutionFailed => "execution_failed",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sending half of the signal queue
#[derive(Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<TradingSignal>,
}

impl SignalSender {
    pub(crate) fn new(tx: mpsc::Sender<TradingSignal>) -> Self {
        Self { tx }
    }

    pub async fn submit(&self, signal: TradingSignal) -> Result<()> {
        self.tx
            .send(signal)
            .await
            .map_err(|_| PerpError::Internal("signal queue closed".into()))
    }
}

pub struct SignalIntake {
    services: Arc<Services>,
    last_accepted: HashMap<String, DateTime<Utc>>,
    accepted_window: VecDeque<DateTime<Utc>>,
    /// Symbols with an admitted signal still executing
    in_flight: Arc<DashSet<String>>,
}

impl SignalIntake {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            last_accepted: HashMap::new(),
            accepted_window: VecDeque::new(),
            in_flight: Arc::new(DashSet::new()),
        }
    }

    /// Admission checks and sizing. On success the cooldown and hourly
    /// budget are charged and the symbol is marked in flight.
    pub async fn admit(
        &mut self,
        signal: &TradingSignal,
        now: DateTime<Utc>,
    ) -> std::result::Result<TradeRequest, (Rejection, String)> {
        let cfg = &self.services.config.orchestrator;

        if let Err(e) = signal.validate() {
            return Err((Rejection::Invalid, e.to_string()));
        }
        if signal.is_expired(now) {
            return Err((Rejection::Expired, format!("expired at {:?}", signal.expires_at)));
        }
        if signal.confidence < cfg.min_signal_confidence {
            return Err((
                Rejection::LowConfidence,
                format!("confidence {} below {}", signal.confidence, cfg.min_signal_confidence),
            ));
        }
        if self.services.emergency.is_stopped() {
            return Err((Rejection::EmergencyStop, "emergency stop active".into()));
        }
        // the position pass would flatten anything opened past the cutoff
        let exits = &self.services.config.exits;
        if exits.end_of_day_exit {
            if let Some(cutoff) = exits.end_of_day_cutoff_time() {
                if now.time() >= cutoff {
                    return Err((
                        Rejection::EndOfDay,
                        format!("past end-of-day cutoff {} UTC", cutoff),
                    ));
                }
            }
        }

        // one position per symbol, decided before the gate is consulted
        if self.in_flight.contains(&signal.symbol)
            || self.services.registry.contains(&signal.symbol).await
            || self
                .services
                .engine
                .ledger()
                .active_trade_for(&signal.symbol)
                .await
                .is_some()
        {
            return Err((
                Rejection::PositionOpen,
                format!("{} already has an active trade", signal.symbol),
            ));
        }

        let cooldown = Duration::seconds(cfg.signal_cooldown_secs as i64);
        if let Some(last) = self.last_accepted.get(&signal.symbol) {
            if now - *last < cooldown {
                return Err((
                    Rejection::Cooldown,
                    format!("{} accepted a signal at {}", signal.symbol, last),
                ));
            }
        }

        let hour_ago = now - Duration::hours(1);
        while self.accepted_window.front().is_some_and(|t| *t <= hour_ago) {
            self.accepted_window.pop_front();
        }
        if self.accepted_window.len() >= cfg.max_signals_per_hour {
            return Err((
                Rejection::HourlyCap,
                format!("{} signals accepted in the last hour", self.accepted_window.len()),
            ));
        }

        let request = self.size(signal).await?;

        self.last_accepted.insert(signal.symbol.clone(), now);
        self.accepted_window.push_back(now);
        self.in_flight.insert(signal.symbol.clone());
        Ok(request)
    }

    async fn size(
        &self,
        signal: &TradingSignal,
    ) -> std::result::Result<TradeRequest, (Rejection, String)> {
        let services = &self.services;
        let exchange = &services.exchange;
        let symbol = signal.symbol.as_str();
        let market_data = |e: PerpError| (Rejection::MarketData, e.to_string());

        let entry = match signal.entry_price {
            Some(price) => price,
            None => retry_read(&services.retry, "get_current_price", || {
                exchange.get_current_price(symbol)
            })
            .await
            .map_err(market_data)?,
        };
        let step = retry_read(&services.retry, "get_minimum_order_size", || {
            exchange.get_minimum_order_size(symbol)
        })
        .await
        .map_err(market_data)?;
        let state = services.risk.current().await.map_err(market_data)?;
        let limits = services.risk.limits().read().await.clone();

        let size = position_size(&SizingInput {
            portfolio_value: state.portfolio_value,
            max_portfolio_risk: limits.max_portfolio_risk,
            max_position_size: limits.max_position_size,
            entry_price: entry,
            stop_loss: signal.stop_loss,
            size_step: step,
        });
        if size.is_zero() || size < step {
            return Err((
                Rejection::TooSmall,
                format!("sized {} below minimum {}", size, step),
            ));
        }

        let mut request = TradeRequest::market(symbol, signal.side, size)
            .with_levels(signal.stop_loss, signal.take_profit)
            .with_strategy(&signal.strategy_id, signal.reasoning.clone());
        if let Some(price) = signal.entry_price {
            request = request.with_limit(price);
        }
        Ok(request)
    }

    /// Admit and execute inline; used by tests and one-shot callers.
    pub async fn handle(&mut self, signal: TradingSignal) -> std::result::Result<Trade, Rejection> {
        let request = self.screen(&signal).await?;
        let result = self.services.engine.execute_trade(request).await;
        self.in_flight.remove(&signal.symbol);
        settle(&self.services, &signal, result)
    }

    async fn screen(&mut self, signal: &TradingSignal) -> std::result::Result<TradeRequest, Rejection> {
        self.services.metrics.inc_signals_received();
        match self.admit(signal, Utc::now()).await {
            Ok(request) => {
                self.services.metrics.inc_signal_accepted();
                info!(
                    signal_id = %signal.signal_id,
                    symbol = %signal.symbol,
                    side = %signal.side,
                    size = %request.size,
                    strategy = %signal.strategy_id,
                    "signal accepted"
                );
                Ok(request)
            }
            Err((rejection, detail)) => {
                self.services.metrics.inc_signal_rejected(rejection.as_str());
                debug!(
                    signal_id = %signal.signal_id,
                    symbol = %signal.symbol,
                    reason = %rejection,
                    %detail,
                    "signal rejected"
                );
                Err(rejection)
            }
        }
    }

    /// Drain the signal queue until shutdown; each admitted signal executes
    /// on its own task.
    pub async fn run(mut self, mut rx: mpsc::Receiver<TradingSignal>, shutdown: ShutdownToken) {
        info!("signal intake loop started");
        let mut executions = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(done) = executions.join_next(), if !executions.is_empty() => {
                    if let Err(e) = done {
                        warn!(error = %e, "signal execution task failed");
                    }
                }
                maybe = rx.recv() => {
                    let Some(signal) = maybe else {
                        info!("signal feed closed");
                        break;
                    };
                    let Ok(request) = self.screen(&signal).await else { continue };
                    let services = self.services.clone();
                    let in_flight = self.in_flight.clone();
                    executions.spawn(async move {
                        let result = services.engine.execute_trade(request).await;
                        in_flight.remove(&signal.symbol);
                        if let Ok(trade) = settle(&services, &signal, result) {
                            debug!(trade_id = %trade.trade_id, symbol = %trade.symbol, "signal executed");
                        }
                    });
                }
            }
        }

        // entries already submitted finish their fill wait on their own
        while let Some(done) = executions.join_next().await {
            if let Err(e) = done {
                warn!(error = %e, "signal execution task failed");
            }
        }
        info!("signal intake loop stopped");
    }
}

fn settle(
    services: &Services,
    signal: &TradingSignal,
    result: Result<Trade>,
) -> std::result::Result<Trade, Rejection> {
    match result {
        Ok(trade) => Ok(trade),
        Err(e) => {
            let rejection = match e {
                PerpError::RiskDenied { .. } => Rejection::RiskDenied,
                _ => Rejection::ExecutionFailed,
            };
            services.metrics.inc_signal_rejected(rejection.as_str());
            warn!(
                signal_id = %signal.signal_id,
                symbol = %signal.symbol,
                reason = %rejection,
                error = %e,
                "signal not executed"
            );
            Err(rejection)
        }
    }
}
