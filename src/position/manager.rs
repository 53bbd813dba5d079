//! Exit evaluation for open positions
//!
//! `check_exit_conditions` runs the exit rules in a fixed priority order and
//! returns on the first one that fires. When nothing fires it decides whether
//! the trailing stop ratchets. The trailing stop and the set of profit levels
//! already taken live on the `Position`, so the caller must write the mutated
//! position back (registry and checkpoint) after every call.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::ExitConfig;
use crate::domain::{ExitType, MarketConditions, Position, Side};

/// Fractional exit produced by a profit-taking level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartialExit {
    /// Index into the configured profit levels
    pub level: usize,
    pub fraction: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExitDecision {
    pub should_exit: bool,
    pub exit_type: Option<ExitType>,
    /// Reference price for the exit; None means take the market
    pub exit_price: Option<Decimal>,
    pub partial: Option<PartialExit>,
    pub update_stop_loss: bool,
    pub new_stop_loss: Option<Decimal>,
    pub reason: String,
}

impl ExitDecision {
    pub fn hold() -> Self {
        Self {
            should_exit: false,
            exit_type: None,
            exit_price: None,
            partial: None,
            update_stop_loss: false,
            new_stop_loss: None,
            reason: String::new(),
        }
    }

    fn exit(exit_type: ExitType, exit_price: Option<Decimal>, reason: String) -> Self {
        Self {
            should_exit: true,
            exit_type: Some(exit_type),
            exit_price,
            reason,
            ..Self::hold()
        }
    }

    fn partial(level: usize, fraction: Decimal, price: Decimal, reason: String) -> Self {
        Self {
            partial: Some(PartialExit { level, fraction }),
            ..Self::exit(ExitType::PartialProfit, Some(price), reason)
        }
    }

    fn move_stop(stop: Decimal, reason: String) -> Self {
        Self {
            update_stop_loss: true,
            new_stop_loss: Some(stop),
            reason,
            ..Self::hold()
        }
    }

    pub fn is_partial(&self) -> bool {
        self.partial.is_some()
    }
}

pub struct PositionLifecycleManager {
    config: ExitConfig,
}

impl PositionLifecycleManager {
    pub fn new(config: ExitConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// Evaluate one tick for `position` at its `current_price`.
    pub fn check_exit_conditions(
        &self,
        position: &mut Position,
        conditions: Option<&MarketConditions>,
        now: DateTime<Utc>,
    ) -> ExitDecision {
        let price = position.current_price;
        let side = position.side;
        let pnl_pct = position.unrealized_pnl_pct();

        // 1. configured stop
        if let Some(stop) = position.stop_loss {
            if crossed_against(side, price, stop) {
                return ExitDecision::exit(
                    ExitType::StopLoss,
                    Some(price),
                    format!("stop-loss {} hit at {}", stop, price),
                );
            }
        }

        // 2. hard loss floor
        if pnl_pct <= -self.config.max_loss_pct {
            return ExitDecision::exit(
                ExitType::MaxLoss,
                Some(price),
                format!(
                    "loss {}% breaches max loss {}%",
                    (pnl_pct * Decimal::ONE_HUNDRED).round_dp(2),
                    self.config.max_loss_pct * Decimal::ONE_HUNDRED
                ),
            );
        }

        // 3. target
        if let Some(target) = position.take_profit {
            if crossed_in_favor(side, price, target) {
                return ExitDecision::exit(
                    ExitType::TakeProfit,
                    Some(price),
                    format!("take-profit {} hit at {}", target, price),
                );
            }
        }

        // 4. trailing stop
        if position.trailing_stop.is_hit(side, price) {
            return ExitDecision::exit(
                ExitType::TrailingStop,
                Some(price),
                format!(
                    "trailing stop {} hit at {}",
                    position.trailing_stop.stop_price.unwrap_or_default(),
                    price
                ),
            );
        }

        // 5. end of day
        if self.config.end_of_day_exit {
            if let Some(cutoff) = self.config.end_of_day_cutoff_time() {
                if now.time() >= cutoff {
                    return ExitDecision::exit(
                        ExitType::EndOfDay,
                        None,
                        format!("end-of-day cutoff {} UTC reached", cutoff),
                    );
                }
            }
        }

        // 6. max age
        if self.config.max_position_age_secs > 0 {
            let age = position.age(now);
            if age.num_seconds() >= self.config.max_position_age_secs as i64 {
                return ExitDecision::exit(
                    ExitType::MaxAge,
                    None,
                    format!("position age {}s exceeds limit", age.num_seconds()),
                );
            }
        }

        // 7. profit levels, each at most once per position
        for (index, level) in self.config.profit_levels.iter().enumerate() {
            if pnl_pct >= level.profit_pct && !position.profit_levels_hit.contains(&index) {
                position.profit_levels_hit.insert(index);
                return ExitDecision::partial(
                    index,
                    level.fraction,
                    price,
                    format!(
                        "profit level {} ({}%) reached, taking {}%",
                        index,
                        level.profit_pct * Decimal::ONE_HUNDRED,
                        level.fraction * Decimal::ONE_HUNDRED
                    ),
                );
            }
        }

        if let Some(c) = conditions {
            // 8. volatility
            if c.volatility > self.config.exit_volatility {
                return ExitDecision::exit(
                    ExitType::Volatility,
                    None,
                    format!(
                        "volatility {} above exit threshold {}",
                        c.volatility, self.config.exit_volatility
                    ),
                );
            }
            // 9. liquidity
            if c.spread_bps > self.config.exit_max_spread_bps
                || c.depth_notional < self.config.exit_min_depth_notional
            {
                return ExitDecision::exit(
                    ExitType::Illiquidity,
                    None,
                    format!(
                        "illiquid book: spread {}bps, depth {}",
                        c.spread_bps.round_dp(1),
                        c.depth_notional.round_dp(0)
                    ),
                );
            }
        }

        self.evaluate_trailing(position, pnl_pct)
    }

    fn evaluate_trailing(&self, position: &mut Position, pnl_pct: Decimal) -> ExitDecision {
        let armed = position.trailing_stop.active;
        if !armed && pnl_pct < self.config.trailing_activation_pct {
            return ExitDecision::hold();
        }

        let price = position.current_price;
        let side = position.side;
        let distance = self.config.trailing_distance;
        let candidate = match side {
            Side::Long => price * (Decimal::ONE - distance),
            Side::Short => price * (Decimal::ONE + distance),
        };

        if !position.trailing_stop.ratchet(side, price, candidate) {
            return ExitDecision::hold();
        }
        let Some(stop) = position.trailing_stop.stop_price else {
            return ExitDecision::hold();
        };
        debug!(
            symbol = %position.symbol,
            trade_id = %position.trade_id,
            %stop,
            armed_now = !armed,
            "trailing stop ratcheted"
        );

        let improves_stop = match position.stop_loss {
            None => true,
            Some(current) => side.is_more_favorable_stop(stop, current),
        };
        if improves_stop {
            ExitDecision::move_stop(stop, format!("trailing stop ratcheted to {}", stop))
        } else {
            ExitDecision::hold()
        }
    }
}

fn crossed_against(side: Side, price: Decimal, level: Decimal) -> bool {
    match side {
        Side::Long => price <= level,
        Side::Short => price >= level,
    }
}

fn crossed_in_favor(side: Side, price: Decimal, level: Decimal) -> bool {
    match side {
        Side::Long => price >= level,
        Side::Short => price <= level,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProfitLevel;
    use crate::domain::Trade;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn config() -> ExitConfig {
        ExitConfig {
            max_loss_pct: dec!(0.05),
            trailing_activation_pct: dec!(0.02),
            trailing_distance: dec!(0.01),
            end_of_day_exit: false,
            max_position_age_secs: 0,
            profit_levels: vec![
                ProfitLevel { profit_pct: dec!(0.03), fraction: dec!(0.3) },
                ProfitLevel { profit_pct: dec!(0.06), fraction: dec!(0.3) },
            ],
            ..ExitConfig::default()
        }
    }

    fn long(entry: Decimal, stop: Option<Decimal>, target: Option<Decimal>) -> Position {
        let mut t = Trade::new("BTC-PERP", Side::Long, dec!(1));
        t.stop_loss = stop;
        t.take_profit = target;
        t.mark_open(dec!(1), entry).unwrap();
        Position::from_trade(&t).unwrap()
    }

    fn short(entry: Decimal) -> Position {
        let mut t = Trade::new("BTC-PERP", Side::Short, dec!(1));
        t.mark_open(dec!(1), entry).unwrap();
        Position::from_trade(&t).unwrap()
    }

    fn tick(
        m: &PositionLifecycleManager,
        p: &mut Position,
        price: Decimal,
    ) -> ExitDecision {
        p.update_price(price);
        m.check_exit_conditions(p, None, Utc::now())
    }

    #[test]
    fn test_stop_loss_beats_max_loss() {
        let m = PositionLifecycleManager::new(config());
        let mut p = long(dec!(100), Some(dec!(97)), None);
        let d = tick(&m, &mut p, dec!(90));
        assert!(d.should_exit);
        assert_eq!(d.exit_type, Some(ExitType::StopLoss));
    }

    #[test]
    fn test_max_loss_without_stop() {
        let m = PositionLifecycleManager::new(config());
        let mut p = long(dec!(100), None, None);
        let d = tick(&m, &mut p, dec!(94));
        assert_eq!(d.exit_type, Some(ExitType::MaxLoss));
    }

    #[test]
    fn test_take_profit_beats_profit_levels() {
        let m = PositionLifecycleManager::new(config());
        let mut p = long(dec!(100), None, Some(dec!(104)));
        let d = tick(&m, &mut p, dec!(104));
        assert_eq!(d.exit_type, Some(ExitType::TakeProfit));
        assert!(p.profit_levels_hit.is_empty());
    }

    #[test]
    fn test_long_trailing_stop_never_loosens() {
        let m = PositionLifecycleManager::new(ExitConfig {
            profit_levels: vec![],
            ..config()
        });
        let mut p = long(dec!(100), Some(dec!(95)), None);

        assert!(!tick(&m, &mut p, dec!(101)).update_stop_loss);

        let d = tick(&m, &mut p, dec!(105));
        assert!(d.update_stop_loss);
        assert_eq!(d.new_stop_loss, Some(dec!(103.95)));

        let mut last = p.trailing_stop.stop_price;
        for price in [dec!(107), dec!(106), dec!(105.5), dec!(108), dec!(107.5)] {
            let d = tick(&m, &mut p, price);
            assert!(!d.should_exit);
            assert!(p.trailing_stop.stop_price >= last);
            last = p.trailing_stop.stop_price;
        }
        assert_eq!(last, Some(dec!(106.92)));

        let d = tick(&m, &mut p, dec!(106.9));
        assert_eq!(d.exit_type, Some(ExitType::TrailingStop));
    }

    #[test]
    fn test_short_trailing_stop_moves_down_only() {
        let m = PositionLifecycleManager::new(ExitConfig {
            profit_levels: vec![],
            ..config()
        });
        let mut p = short(dec!(100));
        let d = tick(&m, &mut p, dec!(97));
        assert_eq!(d.new_stop_loss, Some(dec!(97.97)));
        let d = tick(&m, &mut p, dec!(97.5));
        assert!(!d.update_stop_loss);
        assert_eq!(p.trailing_stop.stop_price, Some(dec!(97.97)));
    }

    #[test]
    fn test_profit_level_fires_once() {
        let m = PositionLifecycleManager::new(config());
        let mut p = long(dec!(100), None, None);

        let first = tick(&m, &mut p, dec!(103));
        assert_eq!(first.partial, Some(PartialExit { level: 0, fraction: dec!(0.3) }));

        let replay = tick(&m, &mut p, dec!(103));
        assert!(!replay.is_partial());
        assert!(!replay.should_exit);

        let second = tick(&m, &mut p, dec!(106));
        assert_eq!(second.partial.map(|x| x.level), Some(1));
        assert!(!tick(&m, &mut p, dec!(107)).is_partial());
    }

    #[test]
    fn test_max_age_and_end_of_day() {
        let m = PositionLifecycleManager::new(ExitConfig {
            max_position_age_secs: 60,
            ..config()
        });
        let mut p = long(dec!(100), None, None);
        p.opened_at = Utc::now() - Duration::seconds(120);
        assert_eq!(tick(&m, &mut p, dec!(100)).exit_type, Some(ExitType::MaxAge));

        let m = PositionLifecycleManager::new(ExitConfig {
            end_of_day_exit: true,
            end_of_day_cutoff: "00:00".to_string(),
            ..config()
        });
        let mut p = long(dec!(100), None, None);
        assert_eq!(tick(&m, &mut p, dec!(100)).exit_type, Some(ExitType::EndOfDay));
    }

    #[test]
    fn test_market_condition_exits() {
        let m = PositionLifecycleManager::new(config());
        let mut p = long(dec!(100), None, None);
        let mut c = MarketConditions {
            symbol: "BTC-PERP".into(),
            volatility: dec!(0.2),
            spread_bps: dec!(2),
            depth_notional: dec!(1000000),
            observed_at: Utc::now(),
        };
        let d = m.check_exit_conditions(&mut p, Some(&c), Utc::now());
        assert_eq!(d.exit_type, Some(ExitType::Volatility));

        c.volatility = dec!(0.001);
        c.depth_notional = dec!(10);
        let d = m.check_exit_conditions(&mut p, Some(&c), Utc::now());
        assert_eq!(d.exit_type, Some(ExitType::Illiquidity));
    }
}
