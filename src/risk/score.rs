use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::config::RiskConfig;
use crate::domain::RiskState;

const DAILY_LOSS_WEIGHT: Decimal = dec!(0.4);
const DRAWDOWN_WEIGHT: Decimal = dec!(0.3);
const EXPOSURE_WEIGHT: Decimal = dec!(0.2);
const STREAK_WEIGHT: Decimal = dec!(0.1);

/// Posture derived from the portfolio risk score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Normal,
    High,
    Critical,
}

impl RiskLevel {
    pub fn classify(score: Decimal, high: Decimal, critical: Decimal) -> Self {
        if score >= critical {
            RiskLevel::Critical
        } else if score >= high {
            RiskLevel::High
        } else {
            RiskLevel::Normal
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Normal => write!(f, "normal"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

/// Weighted utilisation of the loss, drawdown, exposure and streak limits, in [0, 1].
///
/// Daily loss counts realized and unrealized P&L together.
pub fn risk_score(state: &RiskState, limits: &RiskConfig) -> Decimal {
    let pv = state.portfolio_value;

    let daily_loss = if pv > Decimal::ZERO {
        let loss = -(state.daily_pnl + state.unrealized_pnl);
        utilisation(loss, limits.max_daily_loss * pv)
    } else {
        Decimal::ZERO
    };
    let drawdown = utilisation(state.drawdown(), limits.max_drawdown);
    let exposure = if pv > Decimal::ZERO {
        utilisation(state.total_exposure, limits.max_total_exposure * pv)
    } else {
        Decimal::ZERO
    };
    let streak = utilisation(
        Decimal::from(state.consecutive_losses),
        Decimal::from(limits.max_consecutive_losses),
    );

    (daily_loss * DAILY_LOSS_WEIGHT
        + drawdown * DRAWDOWN_WEIGHT
        + exposure * EXPOSURE_WEIGHT
        + streak * STREAK_WEIGHT)
        .round_dp(4)
}

fn utilisation(value: Decimal, limit: Decimal) -> Decimal {
    if limit <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (value / limit).clamp(Decimal::ZERO, Decimal::ONE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state() -> RiskState {
        let mut s = RiskState::new(Utc::now().date_naive());
        s.portfolio_value = dec!(10000);
        s.peak_portfolio_value = dec!(10000);
        s
    }

    #[test]
    fn test_flat_book_scores_zero() {
        assert_eq!(risk_score(&state(), &RiskConfig::default()), Decimal::ZERO);
    }

    #[test]
    fn test_components_are_weighted_and_clamped() {
        let limits = RiskConfig::default();
        let mut s = state();
        // half the 500 daily allowance, all of the streak, 3x exposure
        s.daily_pnl = dec!(-250);
        s.consecutive_losses = 8;
        s.total_exposure = dec!(18000);
        assert_eq!(risk_score(&s, &limits), dec!(0.5));
    }

    #[test]
    fn test_classify() {
        let (high, critical) = (dec!(0.6), dec!(0.85));
        assert_eq!(RiskLevel::classify(dec!(0.1), high, critical), RiskLevel::Normal);
        assert_eq!(RiskLevel::classify(dec!(0.6), high, critical), RiskLevel::High);
        assert_eq!(RiskLevel::classify(dec!(0.9), high, critical), RiskLevel::Critical);
    }
}
