// Signal engine: per-symbol market snapshots, exit-condition evaluation and
// size multipliers. Owns all market state; other modules only see the
// `ExitSignal`s and `MarketView`s it hands out.

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::config::{AccelTier, RoiTier, SymbolSettings};
use crate::types::{ExitSignal, MarketEvent, MarketEventKind, Position, PositionSide, SignalReason};

/// Prices the execution engine needs to build an order. Copy of the live
/// snapshot so no lock is held across a suspension point.
#[derive(Clone, Copy, Debug)]
pub struct MarketView {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub last_trade_price: Decimal,
}

#[derive(Clone, Debug)]
struct SymbolParams {
    min_signal_interval_ms: i64,
    accel_window_ms: i64,
    accel_tiers: Vec<AccelTier>,
    roi_tiers: Vec<RoiTier>,
}

/// Aggregated market state for one symbol.
#[derive(Clone, Debug, Default)]
struct Snapshot {
    best_bid: Decimal,
    best_ask: Decimal,
    last_trade_price: Decimal,
    previous_trade_price: Option<Decimal>,
    mark_price: Option<Decimal>,
    last_book_ms: i64,
    last_trade_ms: i64,
    last_mark_ms: i64,
    has_book: bool,
    /// (ts_ms, last_trade_price), pruned to the accel window.
    price_history: VecDeque<(i64, Decimal)>,
}

pub struct SignalEngine {
    params: HashMap<String, SymbolParams>,
    snapshots: HashMap<String, Snapshot>,
    last_signal_ms: HashMap<(String, PositionSide), i64>,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self {
            params: HashMap::new(),
            snapshots: HashMap::new(),
            last_signal_ms: HashMap::new(),
        }
    }

    pub fn configure_symbol(&mut self, settings: &SymbolSettings) {
        self.params.insert(
            settings.symbol.clone(),
            SymbolParams {
                min_signal_interval_ms: settings.min_signal_interval_ms,
                accel_window_ms: settings.accel_window_ms,
                accel_tiers: settings.accel_tiers.clone(),
                roi_tiers: settings.roi_tiers.clone(),
            },
        );
    }

    /// Fold a market event into the snapshot. Quotes with bid >= ask are
    /// discarded as malformed.
    pub fn update_market(&mut self, event: &MarketEvent) {
        let window_ms = self
            .params
            .get(&event.symbol)
            .map(|p| p.accel_window_ms)
            .unwrap_or(2_000);
        let snap = self.snapshots.entry(event.symbol.clone()).or_default();

        match &event.kind {
            MarketEventKind::BookTicker { best_bid, best_ask } => {
                if best_bid >= best_ask {
                    warn!(
                        symbol = %event.symbol,
                        bid = %best_bid,
                        ask = %best_ask,
                        "SIGNAL: crossed quote discarded"
                    );
                    return;
                }
                snap.best_bid = *best_bid;
                snap.best_ask = *best_ask;
                snap.has_book = true;
                snap.last_book_ms = event.ts_ms;
            }
            MarketEventKind::AggTrade { price } => {
                if snap.last_trade_price > Decimal::ZERO {
                    snap.previous_trade_price = Some(snap.last_trade_price);
                }
                snap.last_trade_price = *price;
                snap.last_trade_ms = event.ts_ms;
                snap.price_history.push_back((event.ts_ms, *price));
                let cutoff = event.ts_ms - window_ms;
                while snap
                    .price_history
                    .front()
                    .map_or(false, |(ts, _)| *ts < cutoff)
                {
                    snap.price_history.pop_front();
                }
            }
            MarketEventKind::MarkPrice { price } => {
                snap.mark_price = Some(*price);
                snap.last_mark_ms = event.ts_ms;
            }
        }
    }

    /// Ready once a book update and two trades have been observed.
    pub fn is_ready(&self, symbol: &str) -> bool {
        self.snapshots.get(symbol).map_or(false, |s| {
            s.has_book && s.previous_trade_price.is_some() && s.last_trade_price > Decimal::ZERO
        })
    }

    /// Stale when the youngest of (book, trade) is older than `stale_ms`.
    /// Mark-price updates never refresh staleness; they feed only risk.
    pub fn is_stale(&self, symbol: &str, now_ms: i64, stale_ms: i64) -> bool {
        match self.snapshots.get(symbol) {
            Some(s) => {
                let youngest = s.last_book_ms.max(s.last_trade_ms);
                youngest == 0 || now_ms - youngest > stale_ms
            }
            None => true,
        }
    }

    pub fn market_view(&self, symbol: &str) -> Option<MarketView> {
        let s = self.snapshots.get(symbol)?;
        if !s.has_book || s.last_trade_price <= Decimal::ZERO {
            return None;
        }
        Some(MarketView {
            best_bid: s.best_bid,
            best_ask: s.best_ask,
            last_trade_price: s.last_trade_price,
        })
    }

    pub fn mark_price(&self, symbol: &str) -> Option<Decimal> {
        self.snapshots.get(symbol).and_then(|s| s.mark_price)
    }

    /// Clear the throttle for a side. Called when its position reaches zero or
    /// the execution side state is recycled.
    pub fn reset_side(&mut self, symbol: &str, position_side: PositionSide) {
        self.last_signal_ms
            .remove(&(symbol.to_string(), position_side));
    }

    /// Evaluate the exit conditions for one side. Emits at most one signal per
    /// `min_signal_interval_ms` per (symbol, side).
    pub fn evaluate(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        position: &Position,
        now_ms: i64,
    ) -> Option<ExitSignal> {
        let params = self.params.get(symbol)?;
        let snap = self.snapshots.get(symbol)?;
        if !snap.has_book || snap.last_trade_price <= Decimal::ZERO {
            return None;
        }
        let prev = snap.previous_trade_price?;
        let last = snap.last_trade_price;
        let bid = snap.best_bid;
        let ask = snap.best_ask;

        let reason = match position_side {
            PositionSide::Long => {
                if last > prev && bid >= last {
                    Some(SignalReason::LongPrimary)
                } else if bid >= last && bid > prev {
                    Some(SignalReason::LongBidImprove)
                } else {
                    None
                }
            }
            PositionSide::Short => {
                if last < prev && ask <= last {
                    Some(SignalReason::ShortPrimary)
                } else if ask <= last && ask < prev {
                    Some(SignalReason::ShortAskImprove)
                } else {
                    None
                }
            }
        }?;

        // Throttle after the condition check so a suppressed opportunity does
        // not push the next window out.
        let key = (symbol.to_string(), position_side);
        if let Some(&prev_ms) = self.last_signal_ms.get(&key) {
            if now_ms - prev_ms < params.min_signal_interval_ms {
                return None;
            }
        }

        let ret_window = ret_over_window(snap);
        let accel_mult = accel_mult(&params.accel_tiers, position_side, ret_window);
        let roi = position_roi(position);
        let roi_mult = roi_mult(&params.roi_tiers, roi);

        self.last_signal_ms.insert(key, now_ms);

        debug!(
            symbol = %symbol,
            side = %position_side.as_str(),
            reason = %reason.as_str(),
            roi_mult,
            accel_mult,
            "SIGNAL: exit signal"
        );

        Some(ExitSignal {
            symbol: symbol.to_string(),
            position_side,
            reason,
            ts_ms: now_ms,
            best_bid: bid,
            best_ask: ask,
            last_trade_price: last,
            roi_mult,
            accel_mult,
            roi,
            ret_window,
        })
    }
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// ret_window = price_now / price_at_window_start - 1. None until the history
/// holds at least two points.
fn ret_over_window(snap: &Snapshot) -> Option<Decimal> {
    if snap.price_history.len() < 2 {
        return None;
    }
    let (_, start) = snap.price_history.front()?;
    if *start <= Decimal::ZERO {
        return None;
    }
    Some(snap.last_trade_price / *start - Decimal::ONE)
}

/// roi = unrealized_pnl / (|position_amt| * entry_price / leverage).
fn position_roi(position: &Position) -> Option<Decimal> {
    let abs_amt = position.abs_amt();
    if abs_amt <= Decimal::ZERO || position.entry_price <= Decimal::ZERO || position.leverage == 0 {
        return None;
    }
    let margin = abs_amt * position.entry_price / Decimal::from(position.leverage);
    if margin <= Decimal::ZERO {
        return None;
    }
    Some(position.unrealized_pnl / margin)
}

/// Highest mult among satisfied tiers; direction-aware on the window return.
fn accel_mult(tiers: &[AccelTier], side: PositionSide, ret_window: Option<Decimal>) -> u32 {
    let ret = match ret_window {
        Some(r) => r,
        None => return 1,
    };
    tiers
        .iter()
        .filter(|t| match side {
            PositionSide::Long => ret >= t.ret,
            PositionSide::Short => ret <= -t.ret,
        })
        .map(|t| t.mult)
        .max()
        .unwrap_or(1)
        .max(1)
}

/// Highest mult among satisfied ROI tiers.
fn roi_mult(tiers: &[RoiTier], roi: Option<Decimal>) -> u32 {
    let roi = match roi {
        Some(r) => r,
        None => return 1,
    };
    tiers
        .iter()
        .filter(|t| roi >= t.roi)
        .map(|t| t.mult)
        .max()
        .unwrap_or(1)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn settings(symbol: &str) -> SymbolSettings {
        let yaml = format!("symbols:\n  {symbol}: {{}}\n");
        let cfg: crate::config::AppConfig = serde_yaml::from_str(&yaml).unwrap();
        cfg.symbol_settings(symbol)
    }

    fn book(symbol: &str, ts: i64, bid: Decimal, ask: Decimal) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            ts_ms: ts,
            kind: MarketEventKind::BookTicker {
                best_bid: bid,
                best_ask: ask,
            },
        }
    }

    fn trade(symbol: &str, ts: i64, price: Decimal) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            ts_ms: ts,
            kind: MarketEventKind::AggTrade { price },
        }
    }

    fn long_position(amt: Decimal) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            position_amt: amt,
            entry_price: dec!(200),
            unrealized_pnl: Decimal::ZERO,
            leverage: 10,
            mark_price: None,
            liquidation_price: None,
        }
    }

    #[test]
    fn not_ready_until_two_trades_and_book() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        assert!(!engine.is_ready("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(199.98), dec!(200.00)));
        assert!(!engine.is_ready("BTCUSDT"));
        engine.update_market(&trade("BTCUSDT", 1_001, dec!(199.99)));
        assert!(!engine.is_ready("BTCUSDT"));
        engine.update_market(&trade("BTCUSDT", 1_002, dec!(200.00)));
        assert!(engine.is_ready("BTCUSDT"));
    }

    #[test]
    fn crossed_quote_is_discarded() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(199.98), dec!(200.00)));
        engine.update_market(&book("BTCUSDT", 1_001, dec!(200.10), dec!(200.00)));
        let view = engine.market_view("BTCUSDT");
        // crossed update rejected; snapshot keeps the sane book but no trades yet
        assert!(view.is_none() || view.unwrap().best_bid == dec!(199.98));
    }

    #[test]
    fn long_primary_fires_on_uptick_with_supporting_bid() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(199.98), dec!(200.01)));
        engine.update_market(&trade("BTCUSDT", 1_001, dec!(199.99)));
        engine.update_market(&trade("BTCUSDT", 1_002, dec!(199.97)));

        let pos = long_position(dec!(0.01));
        // last 199.97 < prev 199.99 -> no long signal
        assert!(engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 1_003)
            .is_none());

        engine.update_market(&trade("BTCUSDT", 1_004, dec!(199.98)));
        // last 199.98 > prev 199.97 and bid 199.98 >= last -> long_primary
        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 1_005)
            .expect("signal");
        assert_eq!(signal.reason, SignalReason::LongPrimary);
        assert_eq!(signal.roi_mult, 1);
        assert_eq!(signal.accel_mult, 1);
    }

    #[test]
    fn throttle_spaces_signals() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(200.00), dec!(200.02)));
        engine.update_market(&trade("BTCUSDT", 1_001, dec!(199.99)));
        engine.update_market(&trade("BTCUSDT", 1_002, dec!(200.00)));

        let pos = long_position(dec!(0.01));
        assert!(engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 2_000)
            .is_some());
        // second evaluation inside the 200ms window is suppressed
        assert!(engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 2_100)
            .is_none());
        assert!(engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 2_201)
            .is_some());
    }

    #[test]
    fn throttle_resets_with_side() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(200.00), dec!(200.02)));
        engine.update_market(&trade("BTCUSDT", 1_001, dec!(199.99)));
        engine.update_market(&trade("BTCUSDT", 1_002, dec!(200.00)));

        let pos = long_position(dec!(0.01));
        assert!(engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 2_000)
            .is_some());
        engine.reset_side("BTCUSDT", PositionSide::Long);
        assert!(engine
            .evaluate("BTCUSDT", PositionSide::Long, &pos, 2_050)
            .is_some());
    }

    #[test]
    fn short_mirror_conditions() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(199.90), dec!(199.99)));
        engine.update_market(&trade("BTCUSDT", 1_001, dec!(200.01)));
        engine.update_market(&trade("BTCUSDT", 1_002, dec!(200.00)));

        let pos = Position {
            position_side: PositionSide::Short,
            position_amt: dec!(-0.01),
            ..long_position(dec!(0.01))
        };
        // last 200.00 < prev 200.01, ask 199.99 <= last -> short_primary
        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Short, &pos, 1_003)
            .expect("signal");
        assert_eq!(signal.reason, SignalReason::ShortPrimary);
    }

    #[test]
    fn highest_mult_wins_when_multiple_tiers_qualify() {
        let tiers = vec![
            AccelTier { ret: dec!(0.001), mult: 2 },
            AccelTier { ret: dec!(0.002), mult: 5 },
            AccelTier { ret: dec!(0.0005), mult: 3 },
        ];
        // ret 0.003 satisfies all three tiers; highest mult, not closest threshold
        assert_eq!(
            accel_mult(&tiers, PositionSide::Long, Some(dec!(0.003))),
            5
        );
        // SHORT direction needs ret <= -tier.ret
        assert_eq!(
            accel_mult(&tiers, PositionSide::Short, Some(dec!(-0.0015))),
            3
        );
        assert_eq!(accel_mult(&tiers, PositionSide::Short, Some(dec!(0.0015))), 1);
    }

    #[test]
    fn roi_mult_from_position_economics() {
        let tiers = vec![
            RoiTier { roi: dec!(0.05), mult: 2 },
            RoiTier { roi: dec!(0.15), mult: 4 },
        ];
        let mut pos = long_position(dec!(1));
        // margin = 1 * 200 / 10 = 20; pnl 4 -> roi 0.2 -> both tiers -> mult 4
        pos.unrealized_pnl = dec!(4);
        assert_eq!(roi_mult(&tiers, position_roi(&pos)), 4);
        pos.unrealized_pnl = dec!(1.2);
        assert_eq!(roi_mult(&tiers, position_roi(&pos)), 2);
        pos.unrealized_pnl = Decimal::ZERO;
        assert_eq!(roi_mult(&tiers, position_roi(&pos)), 1);
    }

    #[test]
    fn staleness_ignores_mark_price() {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(&settings("BTCUSDT"));
        engine.update_market(&book("BTCUSDT", 1_000, dec!(200.00), dec!(200.02)));
        engine.update_market(&trade("BTCUSDT", 1_100, dec!(200.00)));
        engine.update_market(&MarketEvent {
            symbol: "BTCUSDT".to_string(),
            ts_ms: 10_000,
            kind: MarketEventKind::MarkPrice { price: dec!(200.00) },
        });
        // the mark update at 10_000 does not refresh staleness
        assert!(engine.is_stale("BTCUSDT", 10_000, 1_500));
        assert!(!engine.is_stale("BTCUSDT", 2_000, 1_500));
    }
}
