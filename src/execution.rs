// Execution engine: per (symbol, side) state machine turning exit signals and
// panic slices into reduce-only limit orders.
//
// IDLE -> PLACING -> WAITING -> (FILLED | TTL timeout) -> CANCELING -> COOLDOWN -> IDLE
//
// The engine never performs I/O. It hands out `OrderIntent` / `CancelRequest`
// values and is called back with the REST result and with websocket order
// updates; the orchestrator is the single dispatcher in between. At most one
// live own order per side is enforced by the state machine itself: only IDLE
// accepts a new intent.

use std::collections::{HashMap, VecDeque};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::config::{MakerPriceMode, SymbolSettings};
use crate::logging::{
    log_mode_switch, log_order_cancel, log_order_fill, log_order_place, log_order_timeout,
};
use crate::rules::{
    ensure_min_notional, is_position_done, round_price_down, round_price_up, round_qty_down,
    round_qty_up, tradable_qty, InstrumentRules,
};
use crate::signal::MarketView;
use crate::types::{
    ExecutionMode, ExecutionState, ExitSignal, OrderIntent, OrderResult, OrderStatus, OrderUpdate,
    PositionSide, Tif,
};

/// Cancel instruction emitted by the TTL check. The dispatcher performs the
/// REST cancel and reports back through `on_cancel_dispatched`.
#[derive(Clone, Debug)]
pub struct CancelRequest {
    pub symbol: String,
    pub position_side: PositionSide,
    pub order_id: String,
    pub is_risk: bool,
}

/// Completed-fill notification for the notifier. Sent fire-and-forget; the
/// engine never blocks on the channel.
#[derive(Clone, Debug)]
pub struct FillEvent {
    pub symbol: String,
    pub position_side: PositionSide,
    pub mode: ExecutionMode,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub reason: String,
    pub role: Option<String>,
    pub realized_pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
}

/// Fill acknowledged by REST that is still waiting for its websocket
/// execution report (which carries maker role, realized PnL and fee).
#[derive(Clone, Debug)]
pub struct PendingFill {
    pub order_id: String,
    pub completed_ms: i64,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub mode: ExecutionMode,
    pub reason: String,
}

/// Execution state for one (symbol, side). Created on first use, recycled
/// (counters reset) when the position returns to zero.
#[derive(Debug)]
pub struct SideExecutionState {
    pub symbol: String,
    pub position_side: PositionSide,
    pub state: ExecutionState,
    pub mode: ExecutionMode,

    pub current_order_id: Option<String>,
    /// Placement time while PLACING/WAITING; cooldown start while COOLDOWN.
    pub current_order_placed_ms: i64,
    /// TTL snapshot taken at placement (panic orders carry a reduced TTL).
    pub current_order_ttl_ms: Option<i64>,
    pub current_order_mode: Option<ExecutionMode>,
    pub current_order_reason: Option<String>,
    pub current_order_is_risk: bool,
    pub current_order_filled_qty: Decimal,

    pub pending_fill: Option<PendingFill>,

    // Panic-close overrides, valid only while risk_active.
    pub risk_active: bool,
    pub ttl_ms_override: Option<i64>,
    pub maker_timeouts_to_escalate_override: Option<u32>,

    pub maker_timeout_count: u32,
    pub aggr_timeout_count: u32,
    pub aggr_fill_count: u32,

    recent_maker_submits: VecDeque<i64>,
    recent_maker_fills: VecDeque<i64>,
}

impl SideExecutionState {
    fn new(symbol: &str, position_side: PositionSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            position_side,
            state: ExecutionState::Idle,
            mode: ExecutionMode::MakerOnly,
            current_order_id: None,
            current_order_placed_ms: 0,
            current_order_ttl_ms: None,
            current_order_mode: None,
            current_order_reason: None,
            current_order_is_risk: false,
            current_order_filled_qty: Decimal::ZERO,
            pending_fill: None,
            risk_active: false,
            ttl_ms_override: None,
            maker_timeouts_to_escalate_override: None,
            maker_timeout_count: 0,
            aggr_timeout_count: 0,
            aggr_fill_count: 0,
            recent_maker_submits: VecDeque::new(),
            recent_maker_fills: VecDeque::new(),
        }
    }

    fn clear_current_order(&mut self) {
        self.current_order_id = None;
        self.current_order_placed_ms = 0;
        self.current_order_ttl_ms = None;
        self.current_order_mode = None;
        self.current_order_reason = None;
        self.current_order_is_risk = false;
        self.current_order_filled_qty = Decimal::ZERO;
    }

    /// Laplace-smoothed maker fill ratio over the rolling window:
    /// (fills + 1) / (submissions + 2). Defined even with no data (0.5).
    pub fn maker_fill_ratio(&mut self, now_ms: i64, window_ms: i64) -> Decimal {
        let cutoff = now_ms - window_ms;
        while self
            .recent_maker_submits
            .front()
            .map_or(false, |&t| t < cutoff)
        {
            self.recent_maker_submits.pop_front();
        }
        while self
            .recent_maker_fills
            .front()
            .map_or(false, |&t| t < cutoff)
        {
            self.recent_maker_fills.pop_front();
        }
        let fills = Decimal::from(self.recent_maker_fills.len() as u64);
        let submits = Decimal::from(self.recent_maker_submits.len() as u64);
        (fills + Decimal::ONE) / (submits + Decimal::from(2))
    }
}

#[derive(Clone, Debug)]
struct ExecutionParams {
    order_ttl_ms: i64,
    repost_cooldown_ms: i64,
    base_lot_mult: u32,
    maker_price_mode: MakerPriceMode,
    maker_n_ticks: u32,
    maker_safety_ticks: u32,
    maker_timeouts_to_escalate: u32,
    aggr_fills_to_deescalate: u32,
    aggr_timeouts_to_deescalate: u32,
    max_mult: u32,
    max_order_notional: Decimal,
    ws_fill_grace_ms: i64,
    fill_rate_feedback_enabled: bool,
    fill_rate_window_ms: i64,
}

pub struct ExecutionEngine {
    symbol: String,
    params: ExecutionParams,
    states: HashMap<PositionSide, SideExecutionState>,
    fills_tx: Option<UnboundedSender<FillEvent>>,
}

impl ExecutionEngine {
    pub fn new(settings: &SymbolSettings, fills_tx: Option<UnboundedSender<FillEvent>>) -> Self {
        Self {
            symbol: settings.symbol.clone(),
            params: ExecutionParams {
                order_ttl_ms: settings.order_ttl_ms,
                repost_cooldown_ms: settings.repost_cooldown_ms,
                base_lot_mult: settings.base_lot_mult.max(1),
                maker_price_mode: settings.maker_price_mode,
                maker_n_ticks: settings.maker_n_ticks,
                maker_safety_ticks: settings.maker_safety_ticks.max(1),
                maker_timeouts_to_escalate: settings.maker_timeouts_to_escalate,
                aggr_fills_to_deescalate: settings.aggr_fills_to_deescalate,
                aggr_timeouts_to_deescalate: settings.aggr_timeouts_to_deescalate,
                max_mult: settings.max_mult.max(1),
                max_order_notional: settings.max_order_notional,
                ws_fill_grace_ms: settings.ws_fill_grace_ms,
                fill_rate_feedback_enabled: settings.fill_rate_feedback_enabled,
                fill_rate_window_ms: settings.fill_rate_window_ms,
            },
            states: HashMap::new(),
            fills_tx,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state_mut(&mut self, position_side: PositionSide) -> &mut SideExecutionState {
        let symbol = self.symbol.clone();
        self.states
            .entry(position_side)
            .or_insert_with(|| SideExecutionState::new(&symbol, position_side))
    }

    pub fn state(&self, position_side: PositionSide) -> Option<&SideExecutionState> {
        self.states.get(&position_side)
    }

    /// Recycle the side: counters and throttle-relevant state reset, the
    /// struct itself survives for a possible position reopen.
    pub fn reset_side(&mut self, position_side: PositionSide) {
        let symbol = self.symbol.clone();
        self.states
            .insert(position_side, SideExecutionState::new(&symbol, position_side));
    }

    // ------------------------------------------------------------------
    // Intents
    // ------------------------------------------------------------------

    /// Handle an exit signal. Returns the intent to submit, or None when the
    /// side is busy, done, or the computed quantity is zero.
    pub fn on_signal(
        &mut self,
        signal: &ExitSignal,
        position_amt: Decimal,
        rules: &InstrumentRules,
        view: MarketView,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let params = self.params.clone();
        let state = self.state_mut(signal.position_side);
        if state.state != ExecutionState::Idle {
            return None;
        }
        if is_position_done(position_amt, rules) {
            return None;
        }

        let qty = compute_qty(
            &params,
            position_amt,
            rules,
            view.last_trade_price,
            signal.roi_mult,
            signal.accel_mult,
        );
        if qty <= Decimal::ZERO {
            debug!(
                symbol = %signal.symbol,
                side = %signal.position_side.as_str(),
                "EXECUTION: computed quantity is zero"
            );
            return None;
        }

        let (price, tif) = price_for_mode(&params, state.mode, signal.position_side, view, rules);

        state.state = ExecutionState::Placing;
        state.current_order_placed_ms = now_ms;
        state.current_order_ttl_ms = None;
        state.current_order_mode = Some(state.mode);
        state.current_order_reason = Some(signal.reason.as_str().to_string());
        state.current_order_is_risk = false;
        state.current_order_filled_qty = Decimal::ZERO;

        Some(OrderIntent::reduce_limit(
            &signal.symbol,
            signal.position_side,
            qty,
            price,
            tif,
            false,
        ))
    }

    /// Panic close: bypasses the signal engine, slices the position by ratio,
    /// shares the single-order-per-side state machine. TTL comes from the
    /// risk override installed by the supervisor.
    pub fn on_panic_close(
        &mut self,
        position_side: PositionSide,
        position_amt: Decimal,
        rules: &InstrumentRules,
        view: MarketView,
        now_ms: i64,
        slice_ratio: Decimal,
        reason: &str,
    ) -> Option<OrderIntent> {
        let params = self.params.clone();
        let symbol = self.symbol.clone();
        let state = self.state_mut(position_side);
        if state.state != ExecutionState::Idle {
            return None;
        }
        if is_position_done(position_amt, rules) {
            return None;
        }

        let qty = compute_panic_qty(position_amt, rules, slice_ratio);
        if qty <= Decimal::ZERO {
            return None;
        }

        let (price, tif) = price_for_mode(&params, state.mode, position_side, view, rules);
        let ttl = state.ttl_ms_override;

        state.state = ExecutionState::Placing;
        state.current_order_placed_ms = now_ms;
        state.current_order_ttl_ms = ttl;
        state.current_order_mode = Some(state.mode);
        state.current_order_reason = Some(reason.to_string());
        state.current_order_is_risk = true;
        state.current_order_filled_qty = Decimal::ZERO;

        Some(OrderIntent::reduce_limit(
            &symbol,
            position_side,
            qty,
            price,
            tif,
            true,
        ))
    }

    /// Post-only rejection while PLACING: count a maker timeout, escalate, and
    /// build one immediate aggressive retry for the same opportunity.
    pub fn on_post_only_reject(
        &mut self,
        intent: &OrderIntent,
        view: MarketView,
        rules: &InstrumentRules,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let state = self.state_mut(intent.position_side);
        if state.state != ExecutionState::Placing {
            return None;
        }

        state.maker_timeout_count += 1;
        set_mode(state, ExecutionMode::AggressiveLimit, "post_only_reject");

        let price = aggressive_price(intent.position_side, view, rules.tick_size);
        state.current_order_placed_ms = now_ms;
        state.current_order_mode = Some(ExecutionMode::AggressiveLimit);

        let mut retry = intent.clone();
        retry.price = Some(price);
        retry.time_in_force = Tif::Gtc;
        retry.client_order_id = None;
        Some(retry)
    }

    /// REST submit result. Success arms the TTL; failure cools the side down
    /// so a rejecting venue is not hammered every tick.
    pub fn on_order_placed(&mut self, intent: &OrderIntent, result: &OrderResult, now_ms: i64) {
        let params = self.params.clone();
        let state = self.state_mut(intent.position_side);

        if result.success && result.order_id.is_some() {
            let order_id = result.order_id.clone().unwrap_or_default();
            state.state = ExecutionState::Waiting;
            state.current_order_id = Some(order_id.clone());
            state.current_order_placed_ms = now_ms;
            if state.current_order_ttl_ms.is_none() {
                state.current_order_ttl_ms = Some(if state.current_order_is_risk {
                    state.ttl_ms_override.unwrap_or(params.order_ttl_ms)
                } else {
                    params.order_ttl_ms
                });
            }
            state.current_order_filled_qty = result.filled_qty;

            log_order_place(
                &intent.symbol,
                intent.position_side.as_str(),
                state.mode.as_str(),
                intent.qty,
                intent.price,
                &order_id,
            );

            let order_mode = state.current_order_mode.unwrap_or(state.mode);
            if !intent.is_risk && order_mode == ExecutionMode::MakerOnly {
                state.recent_maker_submits.push_back(now_ms);
            }

            // Filled inside the REST round trip: complete now, defer the fill
            // log until the websocket execution report (or the grace expiry)
            // supplies maker role / realized PnL / fee.
            if result.status == Some(OrderStatus::Filled) {
                state.pending_fill = Some(PendingFill {
                    order_id,
                    completed_ms: now_ms,
                    filled_qty: result.filled_qty,
                    avg_price: result.avg_price,
                    mode: order_mode,
                    reason: state
                        .current_order_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                });
                self.finish_filled(intent.position_side, now_ms);
            }
        } else {
            state.state = ExecutionState::Cooldown;
            state.current_order_id = None;
            state.current_order_placed_ms = now_ms;
            state.current_order_ttl_ms = None;
            state.current_order_mode = None;
            state.current_order_reason = None;
            state.current_order_is_risk = false;
            state.current_order_filled_qty = Decimal::ZERO;
            // -5022 post-only rejects are expected traffic, already logged at
            // the REST layer with their error code.
            if !result.is_post_only_reject() {
                warn!(
                    symbol = %intent.symbol,
                    side = %intent.position_side.as_str(),
                    error_code = ?result.error_code,
                    error = ?result.error_message,
                    "EXECUTION: submit failed"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Order updates
    // ------------------------------------------------------------------

    pub fn on_order_update(&mut self, update: &OrderUpdate, now_ms: i64) {
        let grace = self.params.ws_fill_grace_ms;
        let state = self.state_mut(update.position_side);

        // Drop a pending fill whose websocket report never arrived.
        if let Some(pending) = &state.pending_fill {
            if now_ms - pending.completed_ms > grace {
                let expired = state.pending_fill.take();
                if let Some(p) = expired {
                    self.emit_fill(update.position_side, &p, None, None, None);
                }
            }
        }

        let state = self.state_mut(update.position_side);
        let is_current = state.current_order_id.as_deref() == Some(update.order_id.as_str());

        if !is_current {
            // Late execution report for an order completed via REST.
            let accept = state.pending_fill.as_ref().map_or(false, |p| {
                p.order_id == update.order_id
                    && now_ms - p.completed_ms <= grace
                    && update.status == OrderStatus::Filled
                    && update.filled_qty > Decimal::ZERO
            });
            if accept {
                if let Some(pending) = state.pending_fill.take() {
                    let role = update
                        .is_maker
                        .map(|m| if m { "maker" } else { "taker" }.to_string());
                    self.emit_fill(
                        update.position_side,
                        &PendingFill {
                            filled_qty: update.filled_qty,
                            avg_price: update.avg_price,
                            ..pending
                        },
                        role,
                        update.realized_pnl,
                        update.fee,
                    );
                }
            }
            return;
        }

        match update.status {
            OrderStatus::Filled => {
                let role = update
                    .is_maker
                    .map(|m| if m { "maker" } else { "taker" }.to_string());
                let completed = PendingFill {
                    order_id: update.order_id.clone(),
                    completed_ms: now_ms,
                    filled_qty: update.filled_qty,
                    avg_price: update.avg_price,
                    mode: state.current_order_mode.unwrap_or(state.mode),
                    reason: state
                        .current_order_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                };
                self.finish_filled(update.position_side, now_ms);
                self.emit_fill(
                    update.position_side,
                    &completed,
                    role,
                    update.realized_pnl,
                    update.fee,
                );
            }
            OrderStatus::Canceled => {
                log_order_cancel(
                    &update.symbol,
                    &update.order_id,
                    &format!("timeout_{}", update.position_side.as_str()),
                );
                state.state = ExecutionState::Cooldown;
                state.current_order_id = None;
                state.current_order_placed_ms = now_ms;
                state.current_order_mode = None;
                state.current_order_reason = None;
                state.current_order_is_risk = false;
                state.current_order_filled_qty = Decimal::ZERO;
            }
            OrderStatus::Rejected => {
                warn!(
                    symbol = %update.symbol,
                    side = %update.position_side.as_str(),
                    order_id = %update.order_id,
                    "EXECUTION: order rejected"
                );
                state.state = ExecutionState::Idle;
                state.clear_current_order();
            }
            OrderStatus::Expired => {
                debug!(
                    symbol = %update.symbol,
                    side = %update.position_side.as_str(),
                    order_id = %update.order_id,
                    "EXECUTION: order expired"
                );
                state.state = ExecutionState::Cooldown;
                state.current_order_id = None;
                state.current_order_placed_ms = now_ms;
                state.current_order_mode = None;
                state.current_order_reason = None;
                state.current_order_is_risk = false;
                state.current_order_filled_qty = Decimal::ZERO;
            }
            OrderStatus::PartiallyFilled => {
                let role = update.is_maker.map(|m| if m { "maker" } else { "taker" });
                log_order_fill(
                    &update.symbol,
                    update.position_side.as_str(),
                    &update.order_id,
                    update.filled_qty,
                    update.avg_price,
                    role,
                    update.realized_pnl,
                    update.fee,
                );
                state.current_order_filled_qty = update.filled_qty;

                // A partial fill proves the price is workable: reset the
                // timeout counters and prefer maker for the next round.
                let order_mode = state.current_order_mode.unwrap_or(state.mode);
                if update.filled_qty > Decimal::ZERO {
                    match order_mode {
                        ExecutionMode::MakerOnly => state.maker_timeout_count = 0,
                        ExecutionMode::AggressiveLimit => {
                            state.aggr_timeout_count = 0;
                            if state.mode != ExecutionMode::MakerOnly {
                                set_mode(
                                    state,
                                    ExecutionMode::MakerOnly,
                                    "partial_fill_deescalate",
                                );
                            }
                        }
                    }
                }
            }
            OrderStatus::New => {}
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// TTL check. On expiry the side moves to CANCELING, counters and mode
    /// rotation are updated, and the cancel instruction is returned.
    pub fn check_timeout(
        &mut self,
        position_side: PositionSide,
        now_ms: i64,
    ) -> Option<CancelRequest> {
        let params = self.params.clone();
        let symbol = self.symbol.clone();

        // Flush an expired pending fill independent of the state machine.
        let expired = {
            let state = self.state_mut(position_side);
            match &state.pending_fill {
                Some(p) if now_ms - p.completed_ms > params.ws_fill_grace_ms => {
                    state.pending_fill.take()
                }
                _ => None,
            }
        };
        if let Some(p) = expired {
            self.emit_fill(position_side, &p, None, None, None);
        }

        let state = self.state_mut(position_side);
        if state.state != ExecutionState::Waiting {
            return None;
        }

        let order_mode = state.current_order_mode.unwrap_or(state.mode);
        let ttl = state
            .current_order_ttl_ms
            .or(state.ttl_ms_override)
            .unwrap_or(params.order_ttl_ms);
        if now_ms - state.current_order_placed_ms < ttl {
            return None;
        }

        let had_fill = state.current_order_filled_qty > Decimal::ZERO;
        state.state = ExecutionState::Canceling;

        let timeout_count = match order_mode {
            ExecutionMode::AggressiveLimit => {
                if had_fill {
                    state.aggr_timeout_count = 0;
                } else {
                    state.aggr_timeout_count += 1;
                }
                state.aggr_timeout_count
            }
            ExecutionMode::MakerOnly => {
                if had_fill {
                    state.maker_timeout_count = 0;
                } else {
                    state.maker_timeout_count += 1;
                }
                state.maker_timeout_count
            }
        };

        log_order_timeout(
            &symbol,
            position_side.as_str(),
            state.current_order_id.as_deref().unwrap_or(""),
            timeout_count,
        );

        // Mode rotation happens on timeout, without waiting for the cancel ack.
        match order_mode {
            ExecutionMode::MakerOnly => {
                let escalate = effective_maker_timeouts(&params, state, now_ms);
                if escalate > 0 && state.maker_timeout_count >= escalate {
                    set_mode(state, ExecutionMode::AggressiveLimit, "maker_timeout_escalate");
                }
            }
            ExecutionMode::AggressiveLimit => {
                if params.aggr_timeouts_to_deescalate > 0
                    && state.aggr_timeout_count >= params.aggr_timeouts_to_deescalate
                {
                    set_mode(state, ExecutionMode::MakerOnly, "aggr_timeout_deescalate");
                } else if had_fill && state.mode != ExecutionMode::MakerOnly {
                    set_mode(state, ExecutionMode::MakerOnly, "partial_fill_deescalate");
                }
            }
        }

        match state.current_order_id.clone() {
            Some(order_id) => Some(CancelRequest {
                symbol,
                position_side,
                order_id,
                is_risk: state.current_order_is_risk,
            }),
            None => {
                // WAITING without an id cannot happen through the normal path;
                // recover via cooldown rather than wedge.
                state.state = ExecutionState::Cooldown;
                state.current_order_placed_ms = now_ms;
                None
            }
        }
    }

    /// Called after the REST cancel returns (success or not). The side parks
    /// in COOLDOWN retaining the order id so a late websocket ack still
    /// reconciles; a lost ack recovers through cooldown expiry.
    pub fn on_cancel_dispatched(&mut self, position_side: PositionSide, now_ms: i64) {
        let state = self.state_mut(position_side);
        if state.state == ExecutionState::Canceling {
            state.state = ExecutionState::Cooldown;
            state.current_order_placed_ms = now_ms;
        }
    }

    /// COOLDOWN expiry -> IDLE. Returns true on the transition.
    pub fn check_cooldown(&mut self, position_side: PositionSide, now_ms: i64) -> bool {
        let cooldown = self.params.repost_cooldown_ms;
        let state = self.state_mut(position_side);
        if state.state != ExecutionState::Cooldown {
            return false;
        }
        if now_ms - state.current_order_placed_ms < cooldown {
            return false;
        }
        state.state = ExecutionState::Idle;
        state.current_order_placed_ms = 0;
        true
    }

    // ------------------------------------------------------------------
    // Mode and risk overrides
    // ------------------------------------------------------------------

    /// Forced mode switch (risk supervisor tier 1).
    pub fn set_mode(&mut self, position_side: PositionSide, mode: ExecutionMode, reason: &str) {
        let state = self.state_mut(position_side);
        set_mode(state, mode, reason);
    }

    pub fn mode(&self, position_side: PositionSide) -> ExecutionMode {
        self.states
            .get(&position_side)
            .map(|s| s.mode)
            .unwrap_or(ExecutionMode::MakerOnly)
    }

    /// Install panic-close overrides (reduced TTL, per-tier escalation).
    pub fn set_risk_overrides(
        &mut self,
        position_side: PositionSide,
        ttl_ms: i64,
        maker_timeouts_to_escalate: u32,
    ) {
        let state = self.state_mut(position_side);
        state.risk_active = true;
        state.ttl_ms_override = Some(ttl_ms.max(1));
        state.maker_timeouts_to_escalate_override = Some(maker_timeouts_to_escalate);
    }

    /// Drop the overrides once the side is idle again; in-flight orders keep
    /// their snapshot TTL. Returns true when cleared.
    pub fn clear_risk_overrides_if_idle(&mut self, position_side: PositionSide) -> bool {
        let state = self.state_mut(position_side);
        if !state.risk_active || state.state != ExecutionState::Idle {
            return false;
        }
        state.risk_active = false;
        state.ttl_ms_override = None;
        state.maker_timeouts_to_escalate_override = None;
        true
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// The side is done when the step-floored remainder is zero, below
    /// min_qty, or can no longer satisfy min_notional even enlarged to the
    /// whole position.
    pub fn is_done(
        &self,
        position_amt: Decimal,
        rules: &InstrumentRules,
        last_trade_price: Decimal,
    ) -> bool {
        let tradable = tradable_qty(position_amt, rules);
        if tradable <= Decimal::ZERO {
            return true;
        }
        last_trade_price > Decimal::ZERO && tradable * last_trade_price < rules.min_notional
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn finish_filled(&mut self, position_side: PositionSide, now_ms: i64) {
        let params = self.params.clone();
        let state = self.state_mut(position_side);
        let executed_mode = state.current_order_mode.unwrap_or(state.mode);

        if !state.current_order_is_risk && executed_mode == ExecutionMode::MakerOnly {
            state.recent_maker_fills.push_back(now_ms);
        }

        match executed_mode {
            ExecutionMode::MakerOnly => state.maker_timeout_count = 0,
            ExecutionMode::AggressiveLimit => {
                state.aggr_timeout_count = 0;
                state.aggr_fill_count += 1;
                if params.aggr_fills_to_deescalate > 0
                    && state.aggr_fill_count >= params.aggr_fills_to_deescalate
                {
                    set_mode(state, ExecutionMode::MakerOnly, "aggr_fill_deescalate");
                }
            }
        }

        state.state = ExecutionState::Idle;
        state.clear_current_order();
    }

    fn emit_fill(
        &self,
        position_side: PositionSide,
        fill: &PendingFill,
        role: Option<String>,
        realized_pnl: Option<Decimal>,
        fee: Option<Decimal>,
    ) {
        log_order_fill(
            &self.symbol,
            position_side.as_str(),
            &fill.order_id,
            fill.filled_qty,
            fill.avg_price,
            role.as_deref(),
            realized_pnl,
            fee,
        );
        if let Some(tx) = &self.fills_tx {
            let _ = tx.send(FillEvent {
                symbol: self.symbol.clone(),
                position_side,
                mode: fill.mode,
                filled_qty: fill.filled_qty,
                avg_price: fill.avg_price,
                reason: fill.reason.clone(),
                role,
                realized_pnl,
                fee,
            });
        }
    }
}

fn set_mode(state: &mut SideExecutionState, new_mode: ExecutionMode, reason: &str) {
    if state.mode == new_mode {
        return;
    }
    let from = state.mode;
    state.mode = new_mode;
    // Counters never survive a mode change; cross-mode accumulation would
    // make the rotation oscillate.
    state.maker_timeout_count = 0;
    state.aggr_timeout_count = 0;
    state.aggr_fill_count = 0;
    log_mode_switch(
        &state.symbol,
        state.position_side.as_str(),
        from.as_str(),
        new_mode.as_str(),
        reason,
    );
}

/// Escalation threshold for maker timeouts. Precedence: panic-tier override,
/// then fill-ratio feedback (ceil(base / ratio) clamped to [base, 4*base]),
/// then the configured base.
fn effective_maker_timeouts(
    params: &ExecutionParams,
    state: &mut SideExecutionState,
    now_ms: i64,
) -> u32 {
    if let Some(over) = state.maker_timeouts_to_escalate_override {
        return over;
    }
    let base = params.maker_timeouts_to_escalate;
    if !params.fill_rate_feedback_enabled || base == 0 {
        return base;
    }
    let ratio = state.maker_fill_ratio(now_ms, params.fill_rate_window_ms);
    let floor = Decimal::new(1, 9); // 1e-9
    let effective = (Decimal::from(base) / ratio.max(floor)).ceil();
    let effective = effective.to_u32().unwrap_or(base * 4);
    effective.clamp(base, base * 4)
}

fn price_for_mode(
    params: &ExecutionParams,
    mode: ExecutionMode,
    position_side: PositionSide,
    view: MarketView,
    rules: &InstrumentRules,
) -> (Decimal, Tif) {
    match mode {
        ExecutionMode::MakerOnly => (
            maker_price(params, position_side, view, rules.tick_size),
            Tif::Gtx,
        ),
        ExecutionMode::AggressiveLimit => (
            aggressive_price(position_side, view, rules.tick_size),
            Tif::Gtc,
        ),
    }
}

/// Maker (post-only) price on the opposite touch, shifted per mode, clamped
/// so the order cannot cross: a SELL stays at least `safety` ticks above the
/// bid, a BUY at least `safety` ticks below the ask.
fn maker_price(
    params: &ExecutionParams,
    position_side: PositionSide,
    view: MarketView,
    tick_size: Decimal,
) -> Decimal {
    let n_ticks = Decimal::from(params.maker_n_ticks);
    let shift = match params.maker_price_mode {
        MakerPriceMode::AtTouch => Decimal::ZERO,
        MakerPriceMode::InsideSpread1tick => tick_size,
        MakerPriceMode::CustomTicks => tick_size * n_ticks,
    };

    let mut price = match position_side {
        PositionSide::Long => view.best_ask - shift,
        PositionSide::Short => view.best_bid + shift,
    };
    price = round_price_down(price, tick_size);

    if tick_size > Decimal::ZERO {
        let safety = tick_size * Decimal::from(params.maker_safety_ticks);
        match position_side {
            PositionSide::Long => {
                // SELL must stay above the bid to rest as a maker.
                let min_price = round_price_down(view.best_bid, tick_size) + safety;
                if price < min_price {
                    price = min_price;
                }
            }
            PositionSide::Short => {
                // BUY must stay below the ask.
                let mut max_price = round_price_down(view.best_ask, tick_size) - safety;
                if max_price <= Decimal::ZERO {
                    max_price = tick_size;
                }
                if price > max_price {
                    price = max_price;
                }
            }
        }
    }

    price
}

/// Aggressive limit price on the same-side touch: SELL at the bid, BUY at the
/// ask (rounded up so the BUY does not land below it).
fn aggressive_price(position_side: PositionSide, view: MarketView, tick_size: Decimal) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return match position_side {
            PositionSide::Long => view.best_bid,
            PositionSide::Short => view.best_ask,
        };
    }
    match position_side {
        PositionSide::Long => round_price_down(view.best_bid, tick_size),
        PositionSide::Short => round_price_up(view.best_ask, tick_size),
    }
}

/// Quantity composition: base * roi * accel lot multipliers capped at
/// max_mult, bounded by the position, enlarged for min_notional (reduce-only
/// permits this up to the position), trimmed under max_order_notional.
/// Zero means nothing tradable at this price.
fn compute_qty(
    params: &ExecutionParams,
    position_amt: Decimal,
    rules: &InstrumentRules,
    last_trade_price: Decimal,
    roi_mult: u32,
    accel_mult: u32,
) -> Decimal {
    let tradable = tradable_qty(position_amt, rules);
    if tradable <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mult = (params.base_lot_mult.max(1) as u64)
        .saturating_mul(roi_mult.max(1) as u64)
        .saturating_mul(accel_mult.max(1) as u64)
        .min(params.max_mult.max(1) as u64);

    let mut qty = rules.min_qty * Decimal::from(mult);
    if qty > tradable {
        qty = tradable;
    }
    qty = round_qty_down(qty, rules.step_size);
    if qty < rules.min_qty {
        qty = round_qty_up(rules.min_qty, rules.step_size).min(tradable);
    }

    if last_trade_price > Decimal::ZERO {
        // Enlargement is safe: every order is reduce-only, so growing towards
        // the position cannot increase exposure.
        if qty * last_trade_price < rules.min_notional {
            qty = ensure_min_notional(qty, last_trade_price, rules).min(tradable);
            if qty * last_trade_price < rules.min_notional {
                return Decimal::ZERO;
            }
        }

        if params.max_order_notional > Decimal::ZERO {
            while qty * last_trade_price > params.max_order_notional {
                qty -= rules.step_size;
                if qty < rules.min_qty || qty * last_trade_price < rules.min_notional {
                    return Decimal::ZERO;
                }
            }
        }
    }

    if qty < rules.min_qty {
        return Decimal::ZERO;
    }
    qty
}

/// Panic slice: ratio of the position, floored to step, floored at min_qty,
/// capped at the position. Deliberately exempt from max_mult and
/// max_order_notional.
fn compute_panic_qty(
    position_amt: Decimal,
    rules: &InstrumentRules,
    slice_ratio: Decimal,
) -> Decimal {
    let abs_position = position_amt.abs();
    if abs_position < rules.min_qty || slice_ratio <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut qty = round_qty_down(abs_position * slice_ratio, rules.step_size);
    if qty < rules.min_qty {
        qty = rules.min_qty;
    }
    if qty > abs_position {
        qty = round_qty_down(abs_position, rules.step_size);
    }
    if qty < rules.min_qty {
        return Decimal::ZERO;
    }
    qty
}
