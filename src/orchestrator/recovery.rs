//! Startup recovery
//!
//! Rebuilds the in-memory working set from the store before any loop runs:
//! emergency state, live trades and orders, position checkpoints (trailing
//! and profit-level bookkeeping), the daily P&L and loss streak. Every symbol
//! with live state is then reconciled against the exchange.

use chrono::{Duration, Utc};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

use super::services::Services;
use crate::domain::{Position, TradeStatus};
use crate::error::Result;

const STREAK_LOOKBACK: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub emergency_active: bool,
    pub trades_loaded: usize,
    pub positions_restored: usize,
    pub checkpoints_restored: usize,
    pub stale_checkpoints: usize,
    pub symbols_reconciled: usize,
    pub reconcile_failures: usize,
}

pub async fn recover(services: &Services) -> Result<RecoveryReport> {
    let mut report = RecoveryReport {
        emergency_active: services.emergency.load_state().await?,
        ..Default::default()
    };

    let store = &services.store;
    let trades = store.load_active_trades().await?;
    let orders = store.load_active_orders().await?;
    report.trades_loaded = trades.len();

    let mut checkpoints: HashMap<_, Position> = store
        .load_positions()
        .await?
        .into_iter()
        .map(|p| (p.trade_id, p))
        .collect();

    let ledger = services.engine.ledger();
    ledger.load(trades.clone(), orders).await;

    for trade in trades.iter().filter(|t| t.status == TradeStatus::Open) {
        let position = match checkpoints.remove(&trade.trade_id) {
            Some(mut saved) => {
                // the trade row is authoritative for size and levels
                saved.size = trade.remaining_size;
                saved.stop_loss = trade.stop_loss;
                saved.take_profit = trade.take_profit;
                report.checkpoints_restored += 1;
                saved
            }
            None => match Position::from_trade(trade) {
                Ok(position) => position,
                Err(e) => {
                    warn!(trade_id = %trade.trade_id, error = %e, "cannot restore position");
                    ledger.flag(&trade.symbol, "open trade without entry price");
                    continue;
                }
            },
        };
        if let Err(e) = services.registry.insert(position).await {
            warn!(trade_id = %trade.trade_id, error = %e, "duplicate position on recovery");
            ledger.flag(&trade.symbol, e.to_string());
            continue;
        }
        report.positions_restored += 1;
    }

    // whatever is left belongs to trades that are no longer open
    for trade_id in checkpoints.into_keys() {
        if let Err(e) = store.delete_position(trade_id).await {
            warn!(%trade_id, error = %e, "failed to delete stale checkpoint");
        }
        report.stale_checkpoints += 1;
    }

    let now = Utc::now();
    let midnight = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|t| t.and_utc())
        .unwrap_or(now - Duration::days(1));
    let today = store.closed_trades_since(midnight).await?;
    let recent = store.recent_closed_trades(STREAK_LOOKBACK).await?;
    services.risk.rebuild_from_trades(&today, &recent, now).await;
    if let Err(e) = services.risk.refresh().await {
        warn!(error = %e, "initial account refresh failed; gate will retry");
    }

    let mut symbols: BTreeSet<String> = trades.iter().map(|t| t.symbol.clone()).collect();
    symbols.extend(ledger.flagged_symbols());
    for symbol in &symbols {
        match services.engine.reconcile_symbol(symbol).await {
            Ok(r) if r.matched => report.symbols_reconciled += 1,
            Ok(r) => {
                report.reconcile_failures += 1;
                warn!(
                    %symbol,
                    local = %r.local_size,
                    exchange = %r.exchange_size,
                    "position mismatch after restart"
                );
            }
            Err(e) => {
                report.reconcile_failures += 1;
                warn!(%symbol, error = %e, "reconciliation failed after restart");
            }
        }
    }

    let open: Vec<_> = ledger
        .open_trades()
        .await
        .into_iter()
        .map(|t| t.trade_id)
        .collect();
    services.engine.resume_monitors(&open);

    info!(
        emergency = report.emergency_active,
        trades = report.trades_loaded,
        positions = report.positions_restored,
        checkpoints = report.checkpoints_restored,
        stale = report.stale_checkpoints,
        reconciled = report.symbols_reconciled,
        mismatched = report.reconcile_failures,
        "recovery complete"
    );
    Ok(report)
}
