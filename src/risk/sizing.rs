use rust_decimal::Decimal;

/// Inputs for sizing a signal that carries no size of its own
#[derive(Debug, Clone, Copy)]
pub struct SizingInput {
    pub portfolio_value: Decimal,
    /// Fraction of equity risked between entry and stop
    pub max_portfolio_risk: Decimal,
    /// Per-symbol notional cap as a fraction of equity
    pub max_position_size: Decimal,
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    /// Exchange minimum order size, also used as the size step
    pub size_step: Decimal,
}

/// Risk-based size capped by the per-symbol notional limit.
///
/// Without a stop (or with a stop at entry) only the cap applies. The result is
/// rounded down to a multiple of `size_step`; zero means "too small to trade".
pub fn position_size(input: &SizingInput) -> Decimal {
    if input.portfolio_value <= Decimal::ZERO || input.entry_price <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let cap = input.portfolio_value * input.max_position_size / input.entry_price;
    let risk_size = input
        .stop_loss
        .map(|stop| (input.entry_price - stop).abs())
        .filter(|distance| !distance.is_zero())
        .map(|distance| input.portfolio_value * input.max_portfolio_risk / distance);

    let raw = match risk_size {
        Some(risk_size) => risk_size.min(cap),
        None => cap,
    };
    round_down(raw, input.size_step)
}

pub fn round_down(size: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return size.max(Decimal::ZERO);
    }
    ((size / step).floor() * step).max(Decimal::ZERO).normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn input(stop: Option<Decimal>) -> SizingInput {
        SizingInput {
            portfolio_value: dec!(10000),
            max_portfolio_risk: dec!(0.02),
            max_position_size: dec!(0.10),
            entry_price: dec!(50000),
            stop_loss: stop,
            size_step: dec!(0.001),
        }
    }

    #[test]
    fn test_cap_wins_over_risk_size() {
        // risk size 200 / 500 = 0.4, cap 1000 / 50000 = 0.02
        assert_eq!(position_size(&input(Some(dec!(49500)))), dec!(0.02));
    }

    #[test]
    fn test_wide_stop_limits_size() {
        // risk size 200 / 25000 = 0.008
        assert_eq!(position_size(&input(Some(dec!(25000)))), dec!(0.008));
    }

    #[test]
    fn test_no_stop_uses_cap() {
        assert_eq!(position_size(&input(None)), dec!(0.02));
        assert_eq!(position_size(&input(Some(dec!(50000)))), dec!(0.02));
    }

    #[test]
    fn test_rounds_down_to_step() {
        assert_eq!(round_down(dec!(0.0279), dec!(0.01)), dec!(0.02));
        assert_eq!(round_down(dec!(0.0009), dec!(0.001)), Decimal::ZERO);
    }
}
