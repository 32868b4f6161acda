// Risk supervisor, tiers 1 and 2.
// Tier 1: soft de-risk — a sticky per-side flag that forces the execution
// engine into AGGRESSIVE_LIMIT while dist_to_liq sits at or under the
// threshold, released only once it clears the threshold by the hysteresis
// margin. Tier 2: panic tier selection for sliced closes.
// Tier 3 (the exchange-resident protective stop) lives in protective_stop.rs.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::config::PanicCloseTier;
use crate::logging::log_risk_trigger;
use crate::types::{Position, PositionSide};

#[derive(Clone, Debug)]
pub struct RiskAssessment {
    pub dist_to_liq: Option<Decimal>,
    /// Tier-1 flag after this update, hysteresis applied.
    pub force_aggressive: bool,
    /// True exactly when the flag flipped from off to on.
    pub newly_triggered: bool,
}

pub struct RiskManager {
    threshold: Decimal,
    /// Relative release margin: flag clears at d > threshold * (1 + hysteresis).
    hysteresis: Decimal,
    flags: HashMap<(String, PositionSide), bool>,
}

impl RiskManager {
    pub fn new(threshold: Decimal, hysteresis: Decimal) -> Self {
        Self {
            threshold,
            hysteresis,
            flags: HashMap::new(),
        }
    }

    /// Re-evaluate the soft de-risk flag for a position on a mark update.
    pub fn assess(&mut self, position: &Position) -> RiskAssessment {
        let key = (position.symbol.clone(), position.position_side);
        let was_set = self.flags.get(&key).copied().unwrap_or(false);

        let dist = position.dist_to_liq();
        let now_set = match dist {
            Some(d) => {
                if was_set {
                    // release needs the hysteresis margin on top of the threshold
                    d <= self.threshold * (Decimal::ONE + self.hysteresis)
                } else {
                    d <= self.threshold
                }
            }
            // missing mark or liquidation price: keep the previous flag
            None => was_set,
        };

        if now_set {
            self.flags.insert(key, true);
        } else {
            self.flags.remove(&key);
        }

        let newly_triggered = now_set && !was_set;
        if newly_triggered {
            log_risk_trigger(
                &position.symbol,
                position.position_side.as_str(),
                "liq_distance_breach",
                dist,
            );
        }

        RiskAssessment {
            dist_to_liq: dist,
            force_aggressive: now_set,
            newly_triggered,
        }
    }

    pub fn is_flagged(&self, symbol: &str, position_side: PositionSide) -> bool {
        self.flags
            .get(&(symbol.to_string(), position_side))
            .copied()
            .unwrap_or(false)
    }

    /// Drop state for a side whose position went to zero.
    pub fn clear_side(&mut self, symbol: &str, position_side: PositionSide) {
        self.flags.remove(&(symbol.to_string(), position_side));
    }
}

/// Tier 2: the most dangerous satisfied panic tier — the smallest
/// `dist_to_liq` bound that still contains the observed distance.
pub fn select_panic_tier(tiers: &[PanicCloseTier], dist: Decimal) -> Option<&PanicCloseTier> {
    tiers
        .iter()
        .filter(|t| dist <= t.dist_to_liq)
        .min_by_key(|t| t.dist_to_liq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn position(mark: Decimal, liq: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            position_amt: dec!(1),
            entry_price: dec!(200),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            mark_price: Some(mark),
            liquidation_price: Some(liq),
        }
    }

    #[test]
    fn flag_sets_at_threshold_and_releases_with_hysteresis() {
        let mut risk = RiskManager::new(dec!(0.015), dec!(0.2));

        // d = (200 - 197.2) / 200 = 0.014 <= 0.015 -> triggered
        let a = risk.assess(&position(dec!(200), dec!(197.2)));
        assert!(a.force_aggressive);
        assert!(a.newly_triggered);

        // d = 0.016 > threshold but <= 0.018 (threshold * 1.2): still held
        let a = risk.assess(&position(dec!(200), dec!(196.8)));
        assert!(a.force_aggressive);
        assert!(!a.newly_triggered);

        // d = 0.02 > 0.018: released
        let a = risk.assess(&position(dec!(200), dec!(196)));
        assert!(!a.force_aggressive);
        assert!(!risk.is_flagged("BTCUSDT", PositionSide::Long));
    }

    #[test]
    fn without_hysteresis_release_is_at_threshold() {
        let mut risk = RiskManager::new(dec!(0.015), Decimal::ZERO);
        assert!(risk.assess(&position(dec!(200), dec!(197.2))).force_aggressive);
        // d = 0.016 > 0.015 releases immediately
        assert!(!risk.assess(&position(dec!(200), dec!(196.8))).force_aggressive);
    }

    #[test]
    fn missing_inputs_keep_previous_flag() {
        let mut risk = RiskManager::new(dec!(0.015), dec!(0.2));
        assert!(risk.assess(&position(dec!(200), dec!(197.2))).force_aggressive);

        let mut blind = position(dec!(200), dec!(197.2));
        blind.mark_price = None;
        let a = risk.assess(&blind);
        assert!(a.force_aggressive);
        assert!(a.dist_to_liq.is_none());
    }

    #[test]
    fn most_dangerous_satisfied_panic_tier_wins() {
        let tiers = vec![
            PanicCloseTier {
                dist_to_liq: dec!(0.012),
                slice_ratio: dec!(0.1),
                maker_timeouts_to_escalate: 2,
            },
            PanicCloseTier {
                dist_to_liq: dec!(0.008),
                slice_ratio: dec!(0.25),
                maker_timeouts_to_escalate: 2,
            },
        ];
        // 0.009 only satisfies the 0.012 bound
        assert_eq!(
            select_panic_tier(&tiers, dec!(0.009)).unwrap().slice_ratio,
            dec!(0.1)
        );
        // 0.007 satisfies both; the tighter 0.008 tier is the more dangerous
        assert_eq!(
            select_panic_tier(&tiers, dec!(0.007)).unwrap().slice_ratio,
            dec!(0.25)
        );
        assert!(select_panic_tier(&tiers, dec!(0.02)).is_none());
    }
}
