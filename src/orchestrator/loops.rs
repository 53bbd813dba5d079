//! The periodic orchestrator loops
//!
//! Each loop owns one task, ticks on its own interval with
//! `MissedTickBehavior::Delay`, and checks the shutdown token at every
//! iteration boundary.

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashSet;
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::services::Services;
use crate::coordination::{EmergencyReason, ShutdownToken};
use crate::domain::{ExitType, Position, RiskDecision, RiskEvent, RiskEventType, Side};
use crate::exchange::retry_read;
use crate::position::ExitDecision;
use crate::risk::{risk_score, RiskLevel};

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut tick = interval(period.max(Duration::from_millis(1)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

// ==================== Market monitoring ====================

/// Refresh volatility and liquidity for every watched or held symbol and
/// raise an alert when a symbol moves outside the entry limits.
pub async fn market_loop(services: Arc<Services>, shutdown: ShutdownToken) {
    let period = Duration::from_secs(services.config.orchestrator.market_interval_secs);
    let mut tick = ticker(period);
    let mut alerted: HashSet<String> = HashSet::new();
    info!(?period, "market monitoring loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        market_pass(&services, &mut alerted).await;
    }
    info!("market monitoring loop stopped");
}

pub async fn market_pass(services: &Services, alerted: &mut HashSet<String>) {
    let mut symbols: BTreeSet<String> = services
        .config
        .orchestrator
        .symbols
        .iter()
        .cloned()
        .collect();
    for position in services.registry.snapshot().await {
        symbols.insert(position.symbol);
    }

    let limits = services.risk.limits().read().await.clone();
    let refreshed = join_all(symbols.into_iter().map(|symbol| async move {
        let result = services.market.refresh(&symbol).await;
        (symbol, result)
    }))
    .await;

    for (symbol, result) in refreshed {
        let conditions = match result {
            Ok(c) => c,
            Err(e) => {
                warn!(%symbol, error = %e, "market conditions unavailable");
                continue;
            }
        };

        let mut problems = Vec::new();
        if conditions.volatility > limits.max_volatility {
            problems.push(format!("volatility {}", conditions.volatility.round_dp(4)));
        }
        if conditions.spread_bps > limits.max_spread_bps {
            problems.push(format!("spread {}bps", conditions.spread_bps.round_dp(1)));
        }
        if conditions.depth_notional < limits.min_depth_notional {
            problems.push(format!("depth {}", conditions.depth_notional.round_dp(0)));
        }

        if problems.is_empty() {
            if alerted.remove(&symbol) {
                info!(%symbol, "market conditions back within limits");
            }
            continue;
        }
        // alert once per excursion
        if alerted.insert(symbol.clone()) {
            warn!(%symbol, problems = %problems.join(", "), "extreme market conditions");
            services
                .audit
                .record(RiskEvent::new(
                    Uuid::new_v4(),
                    RiskEventType::MarketAlert,
                    Some(&symbol),
                    RiskDecision::Action,
                    format!("Extreme market conditions: {}", problems.join(", ")),
                    services.risk.snapshot().await,
                ))
                .await;
        }
    }
}

// ==================== Position management ====================

/// Evaluate exit conditions for every open position on each tick.
///
/// Exits and stop moves run on their own tasks; a trade with an action in
/// flight is skipped until that action finishes.
pub async fn position_loop(services: Arc<Services>, shutdown: ShutdownToken) {
    let period = Duration::from_millis(services.config.orchestrator.position_interval_ms);
    let mut tick = ticker(period);
    let in_flight: Arc<DashSet<Uuid>> = Arc::new(DashSet::new());
    info!(?period, "position management loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        for (trade_id, decision) in position_pass(&services, &in_flight).await {
            let services = services.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                apply_decision(&services, trade_id, decision).await;
                in_flight.remove(&trade_id);
            });
        }
    }
    info!("position management loop stopped");
}

/// One evaluation pass; returns the decisions that need an action and marks
/// their trades in flight.
pub async fn position_pass(
    services: &Services,
    in_flight: &DashSet<Uuid>,
) -> Vec<(Uuid, ExitDecision)> {
    let now = Utc::now();
    let staleness = ChronoDuration::seconds(services.config.orchestrator.price_staleness_secs as i64);
    let mut actions = Vec::new();

    for position in services.registry.snapshot().await {
        if in_flight.contains(&position.trade_id) {
            continue;
        }
        let symbol = position.symbol.as_str();
        let price = match services.prices.fresh(symbol, staleness, now) {
            Some(price) => price,
            None => {
                let exchange = &services.exchange;
                match retry_read(&services.retry, "get_current_price", || {
                    exchange.get_current_price(symbol)
                })
                .await
                {
                    Ok(price) => price,
                    Err(e) => {
                        warn!(%symbol, error = %e, "no price for position; skipping tick");
                        continue;
                    }
                }
            }
        };
        let conditions = services.market.cached(symbol);

        let evaluated = services
            .registry
            .update(position.trade_id, |p| {
                let before = (p.trailing_stop.clone(), p.profit_levels_hit.clone());
                p.update_price(price);
                let decision = services
                    .lifecycle
                    .check_exit_conditions(p, conditions.as_ref(), now);
                let changed = before != (p.trailing_stop.clone(), p.profit_levels_hit.clone());
                (decision, changed, p.clone())
            })
            .await;
        let Some((decision, changed, updated)) = evaluated else { continue };

        if changed {
            services.engine.checkpoint(&updated).await;
        }
        if decision.should_exit || decision.update_stop_loss {
            debug!(
                trade_id = %updated.trade_id,
                %symbol,
                %price,
                reason = %decision.reason,
                "position action"
            );
            in_flight.insert(updated.trade_id);
            actions.push((updated.trade_id, decision));
        }
    }
    actions
}

pub async fn apply_decision(services: &Services, trade_id: Uuid, decision: ExitDecision) {
    let engine = &services.engine;

    if decision.should_exit {
        let exit_type = decision.exit_type.unwrap_or(ExitType::Manual);
        if let Some(partial) = decision.partial {
            let Some(position) = services.registry.get_by_trade(trade_id).await else {
                return;
            };
            // fractions apply to what is still open, not the original size
            let qty = position.size * partial.fraction;
            match engine.reduce_position_size(trade_id, qty, exit_type).await {
                Ok(trade) => info!(
                    %trade_id,
                    level = partial.level,
                    remaining = %trade.remaining_size,
                    "profit level taken"
                ),
                Err(e) => warn!(%trade_id, level = partial.level, error = %e, "partial exit failed"),
            }
            return;
        }
        match engine
            .close_position(trade_id, exit_type, decision.exit_price)
            .await
        {
            Ok(trade) => info!(
                %trade_id,
                %exit_type,
                pnl = %trade.realized_pnl,
                reason = %decision.reason,
                "position exited"
            ),
            Err(e) => error!(%trade_id, %exit_type, error = %e, "exit failed"),
        }
        return;
    }

    if let (true, Some(stop)) = (decision.update_stop_loss, decision.new_stop_loss) {
        if let Err(e) = engine.update_stop_loss(trade_id, stop).await {
            warn!(%trade_id, %stop, error = %e, "stop update failed");
        }
    }
}

// ==================== Risk monitoring ====================

pub async fn risk_loop(services: Arc<Services>, shutdown: ShutdownToken) {
    let period = Duration::from_secs(services.config.orchestrator.risk_interval_secs);
    let mut tick = ticker(period);
    info!(?period, "risk monitoring loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        risk_pass(&services).await;
    }
    info!("risk monitoring loop stopped");
}

/// Refresh aggregates, act on the portfolio risk level and retry
/// reconciliation for flagged symbols.
pub async fn risk_pass(services: &Services) -> RiskLevel {
    let now = Utc::now();
    if let Err(e) = services.risk.refresh().await {
        warn!(error = %e, "risk state refresh failed");
    }
    services.risk.maybe_auto_recover(now).await;

    for symbol in services.engine.ledger().flagged_symbols() {
        match services.engine.reconcile_symbol(&symbol).await {
            Ok(report) if !report.matched => warn!(
                %symbol,
                local = %report.local_size,
                exchange = %report.exchange_size,
                "symbol still out of sync"
            ),
            Ok(_) => {}
            Err(e) => warn!(%symbol, error = %e, "reconciliation attempt failed"),
        }
    }

    let state = services.risk.cached().await;
    let limits = services.risk.limits().read().await.clone();
    let cfg = &services.config.orchestrator;
    let score = risk_score(&state, &limits);
    let level = RiskLevel::classify(score, cfg.high_risk_score, cfg.critical_risk_score);
    debug!(%score, %level, "portfolio risk scored");

    if services.emergency.is_stopped() {
        return level;
    }
    match level {
        RiskLevel::Critical => {
            error!(%score, "portfolio risk critical; closing everything");
            services
                .emergency
                .trigger(EmergencyReason::CriticalRisk, "risk_monitor")
                .await;
        }
        RiskLevel::High => tighten_losing_stops(services, score).await,
        RiskLevel::Normal => {}
    }
    level
}

async fn tighten_losing_stops(services: &Services, score: Decimal) {
    let distance = services.config.orchestrator.tighten_stop_distance;
    let mut tightened = Vec::new();

    for position in services.registry.snapshot().await {
        if position.unrealized_pnl() >= Decimal::ZERO {
            continue;
        }
        let Some(stop) = tightened_stop(&position, distance) else {
            continue;
        };
        match services
            .engine
            .update_stop_loss(position.trade_id, stop)
            .await
        {
            Ok(_) => tightened.push(format!("{}@{}", position.symbol, stop)),
            Err(e) => warn!(trade_id = %position.trade_id, error = %e, "stop tightening failed"),
        }
    }

    if tightened.is_empty() {
        return;
    }
    warn!(%score, stops = %tightened.join(", "), "tightened stops on losing positions");
    services
        .audit
        .record(RiskEvent::new(
            Uuid::new_v4(),
            RiskEventType::StopsTightened,
            None,
            RiskDecision::Action,
            format!(
                "Risk score {} above high threshold; tightened {}",
                score.round_dp(3),
                tightened.join(", ")
            ),
            services.risk.snapshot().await,
        ))
        .await;
}

/// Stop `distance` away from the current price, if tighter than the current one.
fn tightened_stop(position: &Position, distance: Decimal) -> Option<Decimal> {
    let price = position.current_price;
    let candidate = match position.side {
        Side::Long => price * (Decimal::ONE - distance),
        Side::Short => price * (Decimal::ONE + distance),
    };
    match position.stop_loss {
        Some(current) if !position.side.is_more_favorable_stop(candidate, current) => None,
        _ => Some(candidate),
    }
}

// ==================== Health ====================

/// Heartbeat the connector and log a status line; never touches trading state.
pub async fn health_loop(services: Arc<Services>, shutdown: ShutdownToken) {
    let period = Duration::from_secs(services.config.orchestrator.health_interval_secs);
    let mut tick = ticker(period);
    info!(?period, "health loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {}
        }
        health_pass(&services).await;
    }
    info!("health loop stopped");
}

pub async fn health_pass(services: &Services) {
    let result = services.exchange.ping().await.map_err(|e| e.to_string());
    if let Err(e) = &result {
        warn!(connector = services.exchange.name(), error = %e, "heartbeat failed");
    }
    services.health.record_heartbeat(result).await;

    let report = services.health.report().await;
    let open = services.registry.len().await;
    let flagged = services.engine.ledger().flagged_symbols();
    if report.status.is_healthy() {
        debug!(status = ?report.status, open, "health check");
    } else {
        warn!(
            status = ?report.status,
            failures = services.health.heartbeat_failures(),
            open,
            "health degraded"
        );
    }
    if !flagged.is_empty() {
        warn!(symbols = ?flagged, "symbols awaiting reconciliation");
    }
    services.metrics.log_status();
}
