//! Live risk state
//!
//! `RiskStateManager` owns the daily P&L, drawdown, exposure and loss-streak
//! aggregates the gate reads, together with the pause reasons that stop new
//! entries. The aggregates can be rebuilt from closed trades after a restart.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::audit::AuditLog;
use crate::config::RiskConfig;
use crate::domain::{
    PauseReason, PortfolioSnapshot, RiskDecision, RiskEvent, RiskEventType, RiskState, Trade,
};
use crate::error::Result;
use crate::exchange::{retry_read, ExchangeConnector, RetryPolicy};
use crate::position::PositionRegistry;

/// Risk limits shared between the gate, the risk loop and the admin handle
pub type SharedLimits = Arc<RwLock<RiskConfig>>;

/// Owner of the account's `RiskState`.
///
/// Aggregates (balance, exposure) are refreshed on a bounded interval so the
/// gate does not hit the exchange on every call. Loss accounting moves only
/// when a trade settles.
pub struct RiskStateManager {
    limits: SharedLimits,
    exchange: Arc<dyn ExchangeConnector>,
    registry: PositionRegistry,
    audit: AuditLog,
    retry: RetryPolicy,
    state: RwLock<RiskState>,
}

impl RiskStateManager {
    pub fn new(
        limits: SharedLimits,
        exchange: Arc<dyn ExchangeConnector>,
        registry: PositionRegistry,
        audit: AuditLog,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            limits,
            exchange,
            registry,
            audit,
            retry,
            state: RwLock::new(RiskState::new(Utc::now().date_naive())),
        }
    }

    pub fn limits(&self) -> &SharedLimits {
        &self.limits
    }

    /// Cached state without touching the exchange
    pub async fn cached(&self) -> RiskState {
        self.state.read().await.clone()
    }

    pub async fn snapshot(&self) -> PortfolioSnapshot {
        self.state.read().await.snapshot()
    }

    /// State no older than `risk.state_refresh_secs`.
    ///
    /// A failed refresh falls back to the last good state; only a manager that
    /// has never refreshed reports the error.
    pub async fn current(&self) -> Result<RiskState> {
        let max_age = self.limits.read().await.state_refresh();
        {
            let state = self.state.read().await;
            if let Some(at) = state.refreshed_at {
                if Utc::now() - at < max_age {
                    return Ok(state.clone());
                }
            }
        }

        match self.refresh().await {
            Ok(state) => Ok(state),
            Err(e) => {
                let state = self.state.read().await;
                if state.refreshed_at.is_some() {
                    warn!(error = %e, "risk state refresh failed, using stale state");
                    Ok(state.clone())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Re-read balance and recompute exposure aggregates.
    pub async fn refresh(&self) -> Result<RiskState> {
        let exchange = &self.exchange;
        let balance = retry_read(&self.retry, "get_account_balance", || {
            exchange.get_account_balance()
        })
        .await?;
        let (exposure, unrealized, open) = self.registry.totals().await;
        let now = Utc::now();

        let mut state = self.state.write().await;
        roll_day(&mut state, now.date_naive());
        state.portfolio_value = balance.total;
        state.available_balance = balance.available;
        state.peak_portfolio_value = state.peak_portfolio_value.max(balance.total);
        state.total_exposure = exposure;
        state.unrealized_pnl = unrealized;
        state.open_positions = open;
        state.refreshed_at = Some(now);
        debug!(
            portfolio = %state.portfolio_value,
            exposure = %state.total_exposure,
            daily_pnl = %state.daily_pnl,
            open,
            "risk state refreshed"
        );
        Ok(state.clone())
    }

    /// Settle a closed trade's realized P&L into the loss accounting.
    ///
    /// Trips the consecutive-loss breaker and the daily-loss halt when their
    /// limits are reached.
    pub async fn record_closed_trade(&self, symbol: &str, pnl: Decimal, now: DateTime<Utc>) {
        let limits = self.limits.read().await.clone();
        let mut events = Vec::new();
        {
            let mut state = self.state.write().await;
            roll_day(&mut state, now.date_naive());
            state.daily_pnl += pnl;
            if pnl < Decimal::ZERO {
                state.consecutive_losses += 1;
            } else if pnl > Decimal::ZERO {
                state.consecutive_losses = 0;
            }
            info!(
                %symbol,
                %pnl,
                daily_pnl = %state.daily_pnl,
                streak = state.consecutive_losses,
                "trade settled into risk state"
            );

            if state.consecutive_losses >= limits.max_consecutive_losses
                && state.breaker_tripped_at.is_none()
            {
                state.breaker_tripped_at = Some(now);
                apply_pause(&mut state, PauseReason::ConsecutiveLosses);
                error!(
                    streak = state.consecutive_losses,
                    limit = limits.max_consecutive_losses,
                    "consecutive-loss breaker tripped"
                );
                events.push(RiskEvent::new(
                    Uuid::new_v4(),
                    RiskEventType::BreakerTripped,
                    Some(symbol),
                    RiskDecision::Action,
                    format!(
                        "Consecutive-loss breaker tripped after {} losing trades; cooldown {}s",
                        state.consecutive_losses, limits.breaker_cooldown_secs
                    ),
                    state.snapshot(),
                ));
            }

            let floor = -(limits.max_daily_loss * state.portfolio_value);
            if state.portfolio_value > Decimal::ZERO
                && state.daily_pnl < floor
                && state.pause_reason != Some(PauseReason::DailyLoss)
            {
                apply_pause(&mut state, PauseReason::DailyLoss);
                error!(daily_pnl = %state.daily_pnl, %floor, "daily loss limit hit, halting entries");
                events.push(RiskEvent::new(
                    Uuid::new_v4(),
                    RiskEventType::DailyLossHalt,
                    Some(symbol),
                    RiskDecision::Action,
                    format!(
                        "Daily loss limit hit: realized {} below {}",
                        state.daily_pnl, floor
                    ),
                    state.snapshot(),
                ));
            }
        }

        for event in events {
            self.audit.record(event).await;
        }
    }

    /// Clear time-based pauses whose condition has lapsed.
    ///
    /// Returns true when trading was re-enabled.
    pub async fn maybe_auto_recover(&self, now: DateTime<Utc>) -> bool {
        let limits = self.limits.read().await.clone();
        let mut cleared = None;
        let snapshot = {
            let mut state = self.state.write().await;
            roll_day(&mut state, now.date_naive());

            if let Some(tripped_at) = state.breaker_tripped_at {
                if now - tripped_at >= limits.breaker_cooldown() {
                    state.breaker_tripped_at = None;
                    state.consecutive_losses = 0;
                    if state.pause_reason == Some(PauseReason::ConsecutiveLosses) {
                        clear_pause(&mut state);
                        cleared = Some(PauseReason::ConsecutiveLosses);
                    }
                    info!("consecutive-loss breaker cooled down");
                }
            }

            if state.pause_reason == Some(PauseReason::DailyLoss) {
                let floor = -(limits.max_daily_loss * state.portfolio_value);
                if state.daily_pnl >= floor {
                    clear_pause(&mut state);
                    cleared = Some(PauseReason::DailyLoss);
                }
            }

            state.snapshot()
        };

        let Some(reason) = cleared else {
            return false;
        };
        info!(%reason, "pause cleared, entries re-enabled");
        self.audit
            .record(RiskEvent::new(
                Uuid::new_v4(),
                RiskEventType::PauseCleared,
                None,
                RiskDecision::Action,
                format!("{} pause cleared automatically", reason),
                snapshot,
            ))
            .await;
        true
    }

    /// Rebuild loss accounting from persisted closed trades.
    ///
    /// `today` holds trades closed since midnight UTC (oldest first) and
    /// `recent` the latest closed trades (newest first).
    pub async fn rebuild_from_trades(&self, today: &[Trade], recent: &[Trade], now: DateTime<Utc>) {
        let max_losses = self.limits.read().await.max_consecutive_losses;
        let daily_pnl: Decimal = today.iter().map(|t| t.realized_pnl).sum();

        let mut streak = 0u32;
        let mut last_loss_at = None;
        for trade in recent.iter().filter(|t| !t.realized_pnl.is_zero()) {
            if trade.realized_pnl > Decimal::ZERO {
                break;
            }
            if last_loss_at.is_none() {
                last_loss_at = trade.closed_at;
            }
            streak += 1;
        }

        let mut state = self.state.write().await;
        state.trading_day = now.date_naive();
        state.daily_pnl = daily_pnl;
        state.consecutive_losses = streak;
        if streak >= max_losses {
            state.breaker_tripped_at = Some(last_loss_at.unwrap_or(now));
            apply_pause(&mut state, PauseReason::ConsecutiveLosses);
            warn!(streak, "recovered with consecutive-loss breaker tripped");
        }
        info!(%daily_pnl, streak, closed_today = today.len(), "risk state rebuilt from trades");
    }

    /// Pause new entries. Operator and emergency pauses take precedence over
    /// time-based ones.
    pub async fn pause(&self, reason: PauseReason) {
        let mut state = self.state.write().await;
        apply_pause(&mut state, reason);
    }

    /// Clear any pause and reset the breaker. Returns the reason that was active.
    pub async fn resume(&self) -> Option<PauseReason> {
        let mut state = self.state.write().await;
        let previous = state.pause_reason;
        clear_pause(&mut state);
        state.breaker_tripped_at = None;
        state.consecutive_losses = 0;
        previous
    }

    pub async fn set_event_pause(&self, paused: bool) {
        self.state.write().await.event_pause = paused;
    }

    pub async fn is_paused(&self) -> bool {
        let state = self.state.read().await;
        state.trading_paused || state.event_pause
    }

    /// Overwrite cached state; test setup and recovery only.
    pub async fn replace(&self, state: RiskState) {
        *self.state.write().await = state;
    }
}

fn roll_day(state: &mut RiskState, today: NaiveDate) {
    if state.trading_day != today {
        info!(previous = %state.trading_day, %today, daily_pnl = %state.daily_pnl, "new trading day");
        state.trading_day = today;
        state.daily_pnl = Decimal::ZERO;
    }
}

fn apply_pause(state: &mut RiskState, reason: PauseReason) {
    let overrides = match state.pause_reason {
        None => true,
        Some(current) => current.is_time_based() || !reason.is_time_based(),
    };
    state.trading_paused = true;
    if overrides {
        state.pause_reason = Some(reason);
    }
}

fn clear_pause(state: &mut RiskState) {
    state.trading_paused = false;
    state.pause_reason = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PaperConfig;
    use crate::domain::{ExitType, Side};
    use crate::exchange::PaperExchange;
    use crate::persistence::InMemoryStore;
    use crate::persistence::TradeStore;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn manager(limits: RiskConfig) -> (RiskStateManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let exchange: Arc<dyn ExchangeConnector> =
            Arc::new(PaperExchange::new(PaperConfig::default()));
        let manager = RiskStateManager::new(
            Arc::new(RwLock::new(limits)),
            exchange,
            PositionRegistry::new(),
            AuditLog::new(store.clone()),
            RetryPolicy::none(),
        );
        (manager, store)
    }

    fn closed(pnl_per_unit: Decimal, closed_at: DateTime<Utc>) -> Trade {
        let mut t = Trade::new("BTC-PERP", Side::Long, dec!(1));
        t.mark_open(dec!(1), dec!(100)).unwrap();
        t.mark_closed(dec!(100) + pnl_per_unit, ExitType::Manual).unwrap();
        t.closed_at = Some(closed_at);
        t
    }

    #[tokio::test]
    async fn test_breaker_trips_on_streak() {
        let (m, store) = manager(RiskConfig::default());
        m.refresh().await.unwrap();
        let now = Utc::now();
        for _ in 0..3 {
            m.record_closed_trade("BTC-PERP", dec!(-10), now).await;
        }
        assert!(!m.is_paused().await);

        // break-even leaves the streak alone
        m.record_closed_trade("BTC-PERP", Decimal::ZERO, now).await;
        assert_eq!(m.cached().await.consecutive_losses, 3);

        m.record_closed_trade("BTC-PERP", dec!(-10), now).await;
        let state = m.cached().await;
        assert_eq!(state.consecutive_losses, 4);
        assert_eq!(state.pause_reason, Some(PauseReason::ConsecutiveLosses));
        assert!(state.breaker_tripped_at.is_some());
        assert_eq!(store.event_count().await, 1);
    }

    #[tokio::test]
    async fn test_win_resets_streak() {
        let (m, _) = manager(RiskConfig::default());
        let now = Utc::now();
        m.record_closed_trade("BTC-PERP", dec!(-10), now).await;
        m.record_closed_trade("BTC-PERP", dec!(-10), now).await;
        m.record_closed_trade("BTC-PERP", dec!(5), now).await;
        let state = m.cached().await;
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.daily_pnl, dec!(-15));
    }

    #[tokio::test]
    async fn test_breaker_cools_down() {
        let (m, _) = manager(RiskConfig {
            max_consecutive_losses: 2,
            breaker_cooldown_secs: 60,
            ..RiskConfig::default()
        });
        let tripped = Utc::now();
        m.record_closed_trade("ETH-PERP", dec!(-1), tripped).await;
        m.record_closed_trade("ETH-PERP", dec!(-1), tripped).await;
        assert!(m.is_paused().await);

        assert!(!m.maybe_auto_recover(tripped + Duration::seconds(30)).await);
        assert!(m.maybe_auto_recover(tripped + Duration::seconds(61)).await);
        let state = m.cached().await;
        assert!(!state.trading_paused);
        assert_eq!(state.consecutive_losses, 0);
    }

    #[tokio::test]
    async fn test_manual_pause_outlives_breaker() {
        let (m, _) = manager(RiskConfig {
            max_consecutive_losses: 1,
            breaker_cooldown_secs: 0,
            ..RiskConfig::default()
        });
        m.pause(PauseReason::Manual).await;
        m.record_closed_trade("BTC-PERP", dec!(-1), Utc::now()).await;
        assert_eq!(m.cached().await.pause_reason, Some(PauseReason::Manual));

        assert!(!m.maybe_auto_recover(Utc::now()).await);
        assert!(m.is_paused().await);
        assert_eq!(m.resume().await, Some(PauseReason::Manual));
        assert!(!m.is_paused().await);
    }

    #[tokio::test]
    async fn test_daily_loss_halt() {
        let (m, store) = manager(RiskConfig::default());
        m.refresh().await.unwrap();
        // 5% of the 10k paper balance
        m.record_closed_trade("BTC-PERP", dec!(501), Utc::now()).await;
        m.record_closed_trade("BTC-PERP", dec!(-1100), Utc::now()).await;
        let state = m.cached().await;
        assert_eq!(state.pause_reason, Some(PauseReason::DailyLoss));
        let events = store.risk_events(10).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, RiskEventType::DailyLossHalt);
    }

    #[tokio::test]
    async fn test_rebuild_from_trades() {
        let (m, _) = manager(RiskConfig::default());
        let now = Utc::now();
        let today = vec![closed(dec!(-3), now), closed(dec!(2), now)];
        let recent = vec![
            closed(dec!(-1), now),
            closed(Decimal::ZERO, now),
            closed(dec!(-2), now),
            closed(dec!(4), now),
            closed(dec!(-5), now),
        ];
        m.rebuild_from_trades(&today, &recent, now).await;
        let state = m.cached().await;
        assert_eq!(state.daily_pnl, dec!(-1));
        assert_eq!(state.consecutive_losses, 2);
        assert!(!state.trading_paused);
    }
}
