// Execution state machine scenarios: the full maker/aggressive rotation
// cycle, min-notional completion, lost cancel acks and panic slices.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use unwind_bot::config::AppConfig;
use unwind_bot::execution::ExecutionEngine;
use unwind_bot::rules::InstrumentRules;
use unwind_bot::signal::MarketView;
use unwind_bot::types::{
    ExecutionMode, ExecutionState, ExitSignal, OrderResult, OrderSide, OrderStatus, OrderUpdate,
    PositionSide, SignalReason, Tif,
};

fn settings(symbol: &str) -> unwind_bot::config::SymbolSettings {
    let yaml = format!(
        r#"
global:
  execution:
    order_ttl_ms: 800
    repost_cooldown_ms: 100
    maker_timeouts_to_escalate: 2
    aggr_fills_to_deescalate: 1
    aggr_timeouts_to_deescalate: 2
symbols:
  {symbol}: {{}}
"#
    );
    let cfg: AppConfig = serde_yaml::from_str(&yaml).unwrap();
    cfg.symbol_settings(symbol)
}

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

fn view() -> MarketView {
    MarketView {
        best_bid: dec!(199.98),
        best_ask: dec!(200.00),
        last_trade_price: dec!(200.00),
    }
}

fn signal(ts_ms: i64) -> ExitSignal {
    ExitSignal {
        symbol: "BTCUSDT".to_string(),
        position_side: PositionSide::Long,
        reason: SignalReason::LongPrimary,
        ts_ms,
        best_bid: dec!(199.98),
        best_ask: dec!(200.00),
        last_trade_price: dec!(200.00),
        roi_mult: 1,
        accel_mult: 1,
        roi: None,
        ret_window: None,
    }
}

fn placed_ok(order_id: &str) -> OrderResult {
    OrderResult {
        success: true,
        order_id: Some(order_id.to_string()),
        status: Some(OrderStatus::New),
        ..OrderResult::default()
    }
}

fn ws_update(order_id: &str, status: OrderStatus, filled: Decimal, ts_ms: i64) -> OrderUpdate {
    OrderUpdate {
        symbol: "BTCUSDT".to_string(),
        order_id: order_id.to_string(),
        client_order_id: format!("uw-test-{order_id}"),
        side: OrderSide::Sell,
        position_side: PositionSide::Long,
        status,
        filled_qty: filled,
        avg_price: if filled > Decimal::ZERO {
            dec!(199.99)
        } else {
            Decimal::ZERO
        },
        ts_ms,
        order_type: Some("LIMIT".to_string()),
        close_position: Some(false),
        reduce_only: Some(true),
        is_maker: Some(true),
        realized_pnl: None,
        fee: None,
    }
}

/// Drives one full maker order: signal -> submit ok -> TTL timeout ->
/// cancel -> ws CANCELED -> cooldown -> idle. Returns the time after the
/// cooldown expired.
fn run_maker_timeout_cycle(engine: &mut ExecutionEngine, order_id: &str, start_ms: i64) -> i64 {
    let r = rules();
    let intent = engine
        .on_signal(&signal(start_ms), dec!(10.0), &r, view(), start_ms)
        .expect("intent");
    assert!(intent.reduce_only);
    engine.on_order_placed(&intent, &placed_ok(order_id), start_ms);
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().state,
        ExecutionState::Waiting
    );

    // TTL 800ms elapses
    let t_timeout = start_ms + 801;
    let cancel = engine
        .check_timeout(PositionSide::Long, t_timeout)
        .expect("cancel request");
    assert_eq!(cancel.order_id, order_id);
    engine.on_cancel_dispatched(PositionSide::Long, t_timeout);
    engine.on_order_update(
        &ws_update(order_id, OrderStatus::Canceled, Decimal::ZERO, t_timeout + 10),
        t_timeout + 10,
    );
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().state,
        ExecutionState::Cooldown
    );

    let t_idle = t_timeout + 10 + 101;
    assert!(engine.check_cooldown(PositionSide::Long, t_idle));
    t_idle
}

#[test]
fn escalation_after_two_maker_timeouts_then_deescalation_on_fill() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);

    let t1 = run_maker_timeout_cycle(&mut engine, "1001", 1_000);
    assert_eq!(engine.mode(PositionSide::Long), ExecutionMode::MakerOnly);

    let t2 = run_maker_timeout_cycle(&mut engine, "1002", t1);
    // two consecutive maker timeouts reach the escalation threshold
    assert_eq!(engine.mode(PositionSide::Long), ExecutionMode::AggressiveLimit);

    // next submit prices aggressively at the bid with GTC
    let r = rules();
    let intent = engine
        .on_signal(&signal(t2), dec!(10.0), &r, view(), t2)
        .expect("intent");
    assert_eq!(intent.time_in_force, Tif::Gtc);
    assert_eq!(intent.price, Some(dec!(199.98)));
    engine.on_order_placed(&intent, &placed_ok("1003"), t2);

    // fill -> aggr_fill_count reaches the deescalation threshold
    engine.on_order_update(
        &ws_update("1003", OrderStatus::Filled, intent.qty, t2 + 50),
        t2 + 50,
    );
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().state,
        ExecutionState::Idle
    );
    assert_eq!(engine.mode(PositionSide::Long), ExecutionMode::MakerOnly);
}

#[test]
fn min_notional_unreachable_means_done_without_submit() {
    // Position 0.010 LONG at 200: even the whole position is 2.0 notional < 5
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();

    assert!(engine.is_done(dec!(0.010), &r, dec!(200)));
    let intent = engine.on_signal(&signal(1_000), dec!(0.010), &r, view(), 1_000);
    assert!(intent.is_none());
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().state,
        ExecutionState::Idle
    );
}

#[test]
fn maker_order_enlarges_to_min_notional_within_position() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();
    let intent = engine
        .on_signal(&signal(1_000), dec!(10.0), &r, view(), 1_000)
        .expect("intent");
    // 0.001 * 200 = 0.2 < 5 -> enlarged to 0.025
    assert_eq!(intent.qty, dec!(0.025));
    assert!(intent.qty <= dec!(10.0));
    assert_eq!(intent.time_in_force, Tif::Gtx);
    // inside_spread_1tick: ask - 1 tick
    assert_eq!(intent.price, Some(dec!(199.99)));
}

#[test]
fn lost_cancel_ack_recovers_through_cooldown() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();

    let intent = engine
        .on_signal(&signal(1_000), dec!(10.0), &r, view(), 1_000)
        .expect("intent");
    engine.on_order_placed(&intent, &placed_ok("2001"), 1_000);

    let cancel = engine
        .check_timeout(PositionSide::Long, 1_900)
        .expect("cancel request");
    assert_eq!(cancel.order_id, "2001");
    // REST cancel returned but the websocket ack never arrives
    engine.on_cancel_dispatched(PositionSide::Long, 1_900);
    let state = engine.state(PositionSide::Long).unwrap();
    assert_eq!(state.state, ExecutionState::Cooldown);
    assert_eq!(state.current_order_id.as_deref(), Some("2001"));

    // cooldown expiry returns to IDLE; the side never deadlocks
    assert!(engine.check_cooldown(PositionSide::Long, 2_050));
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().state,
        ExecutionState::Idle
    );

    // the late CANCELED ack is still tolerated
    engine.on_order_update(
        &ws_update("2001", OrderStatus::Canceled, Decimal::ZERO, 2_500),
        2_500,
    );
    assert!(engine.check_cooldown(PositionSide::Long, 2_700));
}

#[test]
fn partial_fill_keeps_waiting_and_resets_timeout_counter() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();

    // accumulate one maker timeout first
    let t1 = run_maker_timeout_cycle(&mut engine, "3001", 1_000);
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().maker_timeout_count,
        1
    );

    let intent = engine
        .on_signal(&signal(t1), dec!(10.0), &r, view(), t1)
        .expect("intent");
    engine.on_order_placed(&intent, &placed_ok("3002"), t1);
    engine.on_order_update(
        &ws_update("3002", OrderStatus::PartiallyFilled, dec!(0.010), t1 + 100),
        t1 + 100,
    );

    let state = engine.state(PositionSide::Long).unwrap();
    assert_eq!(state.state, ExecutionState::Waiting);
    assert_eq!(state.maker_timeout_count, 0);

    // the partially filled order timing out does not count as a timeout
    let cancel = engine.check_timeout(PositionSide::Long, t1 + 801);
    assert!(cancel.is_some());
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().maker_timeout_count,
        0
    );
}

#[test]
fn panic_close_uses_reduced_ttl_and_tier_escalation() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();

    // S5 overrides: TTL 400 (= 0.5 * 800), escalate after 2 maker timeouts
    engine.set_risk_overrides(PositionSide::Long, 400, 2);

    let intent = engine
        .on_panic_close(
            PositionSide::Long,
            dec!(10.0),
            &r,
            view(),
            1_000,
            dec!(0.25),
            "panic_close@0.008",
        )
        .expect("panic intent");
    assert!(intent.is_risk);
    assert!(intent.reduce_only);
    assert_eq!(intent.qty, dec!(2.5));
    // panic starts in maker mode
    assert_eq!(intent.time_in_force, Tif::Gtx);

    engine.on_order_placed(&intent, &placed_ok("4001"), 1_000);

    // the shortened TTL fires at 400ms, not the configured 800ms
    assert!(engine.check_timeout(PositionSide::Long, 1_300).is_none());
    let cancel = engine
        .check_timeout(PositionSide::Long, 1_401)
        .expect("cancel request");
    assert!(cancel.is_risk);
}

#[test]
fn post_only_reject_upgrades_to_aggressive_within_same_opportunity() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();

    let intent = engine
        .on_signal(&signal(1_000), dec!(10.0), &r, view(), 1_000)
        .expect("intent");
    assert_eq!(intent.time_in_force, Tif::Gtx);

    // venue rejects the post-only order; retry immediately as aggressive
    let retry = engine
        .on_post_only_reject(&intent, view(), &r, 1_001)
        .expect("retry intent");
    assert_eq!(retry.time_in_force, Tif::Gtc);
    assert_eq!(retry.price, Some(dec!(199.98)));
    assert_eq!(retry.qty, intent.qty);
    assert!(retry.reduce_only);
    assert_eq!(engine.mode(PositionSide::Long), ExecutionMode::AggressiveLimit);
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().maker_timeout_count,
        0,
        "counters reset on the mode change"
    );

    engine.on_order_placed(&retry, &placed_ok("5001"), 1_002);
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().state,
        ExecutionState::Waiting
    );
}

#[test]
fn submit_failure_cools_down_instead_of_retrying_hot() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let r = rules();

    let intent = engine
        .on_signal(&signal(1_000), dec!(10.0), &r, view(), 1_000)
        .expect("intent");
    let failure = OrderResult::rejected(Some("-1111".to_string()), "precision");
    engine.on_order_placed(&intent, &failure, 1_000);

    let state = engine.state(PositionSide::Long).unwrap();
    assert_eq!(state.state, ExecutionState::Cooldown);
    assert!(state.current_order_id.is_none());

    // no new intent until the cooldown expires
    assert!(engine
        .on_signal(&signal(1_050), dec!(10.0), &r, view(), 1_050)
        .is_none());
    assert!(engine.check_cooldown(PositionSide::Long, 1_101));
    assert!(engine
        .on_signal(&signal(1_102), dec!(10.0), &r, view(), 1_102)
        .is_some());
}

#[test]
fn side_reset_recycles_counters_but_side_stays_usable() {
    let mut engine = ExecutionEngine::new(&settings("BTCUSDT"), None);
    let t1 = run_maker_timeout_cycle(&mut engine, "6001", 1_000);
    assert_eq!(
        engine.state(PositionSide::Long).unwrap().maker_timeout_count,
        1
    );

    engine.reset_side(PositionSide::Long);
    let state = engine.state(PositionSide::Long).unwrap();
    assert_eq!(state.maker_timeout_count, 0);
    assert_eq!(state.state, ExecutionState::Idle);
    assert_eq!(state.mode, ExecutionMode::MakerOnly);

    // reopened position can trade again right away
    let r = rules();
    assert!(engine
        .on_signal(&signal(t1), dec!(5.0), &r, view(), t1)
        .is_some());
}
