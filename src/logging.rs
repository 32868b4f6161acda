// Logging setup and structured order-event helpers.
// One subscriber for the whole process; modules log through the helpers so
// order lifecycle events keep a uniform field set.

use rust_decimal::Decimal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level. Safe to call once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub fn log_order_place(
    symbol: &str,
    side: &str,
    mode: &str,
    qty: Decimal,
    price: Option<Decimal>,
    order_id: &str,
) {
    info!(
        symbol = %symbol,
        side = %side,
        mode = %mode,
        qty = %qty,
        price = ?price,
        order_id = %order_id,
        "EXECUTION: order placed"
    );
}

pub fn log_order_fill(
    symbol: &str,
    side: &str,
    order_id: &str,
    filled_qty: Decimal,
    avg_price: Decimal,
    role: Option<&str>,
    pnl: Option<Decimal>,
    fee: Option<Decimal>,
) {
    info!(
        symbol = %symbol,
        side = %side,
        order_id = %order_id,
        filled_qty = %filled_qty,
        avg_price = %avg_price,
        role = role.unwrap_or("unknown"),
        pnl = ?pnl,
        fee = ?fee,
        "EXECUTION: order filled"
    );
}

pub fn log_order_cancel(symbol: &str, order_id: &str, reason: &str) {
    info!(
        symbol = %symbol,
        order_id = %order_id,
        reason = %reason,
        "EXECUTION: order canceled"
    );
}

pub fn log_order_timeout(symbol: &str, side: &str, order_id: &str, timeout_count: u32) {
    warn!(
        symbol = %symbol,
        side = %side,
        order_id = %order_id,
        timeout_count,
        "EXECUTION: order TTL elapsed"
    );
}

pub fn log_mode_switch(symbol: &str, side: &str, from: &str, to: &str, reason: &str) {
    info!(
        symbol = %symbol,
        side = %side,
        from = %from,
        to = %to,
        reason = %reason,
        "EXECUTION: mode switch"
    );
}

pub fn log_risk_trigger(symbol: &str, side: &str, stage: &str, dist_to_liq: Option<Decimal>) {
    warn!(
        symbol = %symbol,
        side = %side,
        stage = %stage,
        dist_to_liq = ?dist_to_liq,
        "RISK: trigger"
    );
}
