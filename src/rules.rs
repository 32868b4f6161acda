// Instrument rules cache and grid rounding.
// Every price must land on the tick grid and every quantity on the step grid
// before it reaches the venue; rounding direction is always the conservative one.

use rust_decimal::Decimal;

/// Venue-defined grid and minimums for one instrument. Loaded from
/// exchangeInfo, refreshed by recalibration; leverage is rewritten at runtime
/// from ACCOUNT_CONFIG_UPDATE.
#[derive(Clone, Debug)]
pub struct InstrumentRules {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
    pub leverage: u32,
}

/// Floor to the tick grid.
pub fn round_price_down(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).floor() * tick_size
}

/// Ceil to the tick grid.
pub fn round_price_up(value: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return value;
    }
    (value / tick_size).ceil() * tick_size
}

/// Floor to the step grid.
pub fn round_qty_down(value: Decimal, step_size: Decimal) -> Decimal {
    if step_size <= Decimal::ZERO {
        return value;
    }
    (value / step_size).floor() * step_size
}

/// Ceil to the step grid. Used when enlarging a quantity to satisfy minNotional.
pub fn round_qty_up(value: Decimal, step_size: Decimal) -> Decimal {
    if step_size <= Decimal::ZERO {
        return value;
    }
    (value / step_size).ceil() * step_size
}

/// Smallest step-multiple quantity whose notional at `price` reaches
/// `min_notional`, never below `min_qty`. Returns `qty` unchanged if it
/// already satisfies the minimum. The caller is responsible for capping at
/// the position (orders here are reduce-only).
pub fn ensure_min_notional(qty: Decimal, price: Decimal, rules: &InstrumentRules) -> Decimal {
    if price <= Decimal::ZERO {
        return qty;
    }
    if qty * price >= rules.min_notional {
        return qty;
    }
    let mut adjusted = round_qty_up(rules.min_notional / price, rules.step_size);
    if adjusted < rules.min_qty {
        adjusted = rules.min_qty;
    }
    adjusted
}

/// Step-floored remainder of the position, zero when below min_qty.
pub fn tradable_qty(position_amt: Decimal, rules: &InstrumentRules) -> Decimal {
    let rounded = round_qty_down(position_amt.abs(), rules.step_size);
    if rounded < rules.min_qty {
        Decimal::ZERO
    } else {
        rounded
    }
}

/// Untradable remainder: step-floored position is zero or below min_qty.
pub fn is_position_done(position_amt: Decimal, rules: &InstrumentRules) -> bool {
    let rounded = round_qty_down(position_amt.abs(), rules.step_size);
    rounded == Decimal::ZERO || rounded < rules.min_qty
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn rules() -> InstrumentRules {
        InstrumentRules {
            symbol: "BTCUSDT".to_string(),
            tick_size: dec!(0.01),
            step_size: dec!(0.001),
            min_qty: dec!(0.001),
            min_notional: dec!(5),
            leverage: 20,
        }
    }

    #[test]
    fn rounding_is_idempotent_on_grid() {
        let r = rules();
        let once = round_qty_down(dec!(0.0123456), r.step_size);
        assert_eq!(once, dec!(0.012));
        assert_eq!(round_qty_down(once, r.step_size), once);

        let up = round_price_up(dec!(151.5152), r.tick_size);
        assert_eq!(up, dec!(151.52));
        assert_eq!(round_price_up(up, r.tick_size), up);
    }

    #[test]
    fn price_rounds_toward_safe_side() {
        let r = rules();
        assert_eq!(round_price_down(dec!(199.999), r.tick_size), dec!(199.99));
        assert_eq!(round_price_up(dec!(153.5354), r.tick_size), dec!(153.54));
    }

    #[test]
    fn zero_grid_returns_input() {
        assert_eq!(round_qty_down(dec!(1.2345), Decimal::ZERO), dec!(1.2345));
        assert_eq!(round_price_up(dec!(1.2345), Decimal::ZERO), dec!(1.2345));
    }

    #[test]
    fn min_notional_enlarges_to_step_multiple() {
        let r = rules();
        // 0.001 * 200 = 0.2 < 5 -> needs 0.025
        assert_eq!(ensure_min_notional(dec!(0.001), dec!(200), &r), dec!(0.025));
        // already satisfied -> unchanged
        assert_eq!(ensure_min_notional(dec!(0.1), dec!(200), &r), dec!(0.1));
    }

    #[test]
    fn position_done_on_dust() {
        let r = rules();
        assert!(is_position_done(dec!(0.0004), &r));
        assert!(is_position_done(Decimal::ZERO, &r));
        assert!(!is_position_done(dec!(0.01), &r));
        assert!(is_position_done(dec!(-0.0004), &r));
    }

    #[test]
    fn tradable_qty_floors_and_gates() {
        let r = rules();
        assert_eq!(tradable_qty(dec!(0.0126), &r), dec!(0.012));
        assert_eq!(tradable_qty(dec!(0.0004), &r), Decimal::ZERO);
        assert_eq!(tradable_qty(dec!(-0.0126), &r), dec!(0.012));
    }
}
