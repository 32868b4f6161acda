// Orchestrator. Owns the caches (positions, leverage, rules), the run
// identity, and the task set: market/user stream pumps, one evaluation loop
// per (symbol, side), the TTL/cooldown timer, reconnect recalibration and
// graceful shutdown. All venue I/O funnels through here so the execution
// engine stays pure.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{load_config, load_credentials, AppConfig, SymbolSettings};
use crate::connection::{market_ws, rest, user_ws, Connection, StreamKind, UserEvent};
use crate::execution::{ExecutionEngine, FillEvent};
use crate::logging::log_risk_trigger;
use crate::notify::Notifier;
use crate::protective_stop::{is_stop_order_type, ProtectiveStopManager, PROTECTIVE_STOP_PREFIX};
use crate::rate_limiter::RateLimiter;
use crate::risk::{select_panic_tier, RiskManager};
use crate::rules::InstrumentRules;
use crate::signal::{MarketView, SignalEngine};
use crate::types::{
    ExecutionMode, MarketEvent, MarketEventKind, OrderIntent, OrderResult, OrderUpdate, Position,
    PositionSide, PositionUpdate,
};

/// Client-order prefix for this program. Normal orders append the run id so
/// shutdown only ever cancels orders from this process lifetime.
pub const CLIENT_ORDER_PREFIX: &str = "uw";

const SIDE_LOOP_INTERVAL: Duration = Duration::from_millis(50);
const TIMER_LOOP_INTERVAL: Duration = Duration::from_millis(100);
const SHUTDOWN_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// External stop/tp takeover latch for one (symbol, side). Armed from stream
/// events, released only by a REST-verified reconciliation.
#[derive(Clone, Debug, Default)]
struct TakeoverState {
    active: bool,
    first_seen_ms: i64,
    last_seen_ms: i64,
    last_verify_ms: i64,
    pending_release: bool,
}

pub struct Application {
    symbols: Vec<String>,
    settings: HashMap<String, Arc<SymbolSettings>>,
    connection: Arc<Connection>,
    limiter: Arc<RateLimiter>,
    signal: Arc<Mutex<SignalEngine>>,
    engines: HashMap<String, Arc<Mutex<ExecutionEngine>>>,
    risk: HashMap<String, Arc<std::sync::Mutex<RiskManager>>>,
    stops: Arc<ProtectiveStopManager<Arc<Connection>>>,
    notifier: Arc<Notifier>,
    notifier_events: crate::config::TelegramEventsConfig,

    positions: Arc<RwLock<HashMap<String, HashMap<PositionSide, Position>>>>,
    leverage: Arc<RwLock<HashMap<String, u32>>>,
    rules: Arc<RwLock<HashMap<String, InstrumentRules>>>,

    run_id: String,
    client_order_prefix: String,

    stale_data_ms: i64,

    running: AtomicBool,
    calibrating: AtomicBool,
    shutdown_started: AtomicBool,
    shutdown_notify: Notify,

    takeover: Mutex<HashMap<(String, PositionSide), TakeoverState>>,
    done_sides: Mutex<HashSet<(String, PositionSide)>>,
    panic_last_tier: Mutex<HashMap<(String, PositionSide), Decimal>>,
    stop_sync_tasks: Mutex<HashMap<String, (String, JoinHandle<()>)>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    fills_rx: Mutex<Option<UnboundedReceiver<FillEvent>>>,
}

impl Application {
    pub fn from_config_path(path: &Path) -> Result<Arc<Self>> {
        let cfg = load_config(path)?;
        let credentials = load_credentials()?;
        Self::new(cfg, credentials)
    }

    pub fn new(cfg: AppConfig, credentials: crate::config::Credentials) -> Result<Arc<Self>> {
        let symbols = cfg.symbols();
        let connection = Arc::new(Connection::new(
            credentials,
            cfg.global.testnet,
            cfg.global.ws.reconnect.clone(),
        )?);

        let run_id = Uuid::new_v4().simple().to_string()[..10].to_string();
        let client_order_prefix = format!("{CLIENT_ORDER_PREFIX}-{run_id}-");
        info!(run_id = %run_id, prefix = %client_order_prefix, "APP: run identity");

        let (fills_tx, fills_rx) = unbounded_channel::<FillEvent>();

        let mut settings = HashMap::new();
        let mut engines = HashMap::new();
        let mut risk = HashMap::new();
        let mut signal_engine = SignalEngine::new();
        for symbol in &symbols {
            let s = Arc::new(cfg.symbol_settings(symbol));
            signal_engine.configure_symbol(&s);
            engines.insert(
                symbol.clone(),
                Arc::new(Mutex::new(ExecutionEngine::new(&s, Some(fills_tx.clone())))),
            );
            risk.insert(
                symbol.clone(),
                Arc::new(std::sync::Mutex::new(RiskManager::new(
                    s.liq_distance_threshold,
                    s.liq_distance_hysteresis,
                ))),
            );
            settings.insert(symbol.clone(), s);
        }

        let notifier = Arc::new(Notifier::from_env(cfg.global.telegram.enabled)?);

        Ok(Arc::new(Self {
            symbols,
            settings,
            stops: Arc::new(ProtectiveStopManager::new(Arc::new(connection.clone()))),
            connection,
            limiter: Arc::new(RateLimiter::new(
                cfg.global.rate_limit.max_orders_per_sec,
                cfg.global.rate_limit.max_cancels_per_sec,
            )),
            signal: Arc::new(Mutex::new(signal_engine)),
            engines,
            risk,
            notifier,
            notifier_events: cfg.global.telegram.events.clone(),
            positions: Arc::new(RwLock::new(HashMap::new())),
            leverage: Arc::new(RwLock::new(HashMap::new())),
            rules: Arc::new(RwLock::new(HashMap::new())),
            run_id,
            client_order_prefix,
            stale_data_ms: cfg.global.ws.stale_data_ms,
            running: AtomicBool::new(false),
            calibrating: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            takeover: Mutex::new(HashMap::new()),
            done_sides: Mutex::new(HashSet::new()),
            panic_last_tier: Mutex::new(HashMap::new()),
            stop_sync_tasks: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            fills_rx: Mutex::new(Some(fills_rx)),
        }))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn next_client_order_id(&self) -> String {
        let suffix_len = 36usize.saturating_sub(self.client_order_prefix.len());
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}{}",
            self.client_order_prefix,
            &suffix[..suffix_len.min(suffix.len())]
        )
    }

    fn is_own_run_order(&self, client_order_id: &str) -> bool {
        client_order_id.starts_with(&self.client_order_prefix)
    }

    // ==================================================================
    // Startup
    // ==================================================================

    /// Load rules, leverage and positions; fatal errors abort before the main
    /// loop ever starts.
    pub async fn initialize(&self) -> Result<()> {
        if let Err(e) = rest::sync_server_time(&self.connection).await {
            warn!(error = %e, "APP: server time sync failed, using client clock");
        }

        let rules = rest::fetch_instrument_rules(&self.connection, &self.symbols)
            .await
            .context("failed to load instrument rules")?;
        for symbol in &self.symbols {
            if !rules.contains_key(symbol) {
                anyhow::bail!("no instrument rules for configured symbol {symbol}");
            }
        }

        let leverage = rest::fetch_leverage_map(&self.connection, &self.symbols)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "APP: leverage fetch failed, defaulting per position");
                HashMap::new()
            });

        {
            let mut rules_guard = self.rules.write().await;
            *rules_guard = rules;
            for (symbol, lev) in &leverage {
                if let Some(r) = rules_guard.get_mut(symbol) {
                    r.leverage = *lev;
                }
            }
        }
        *self.leverage.write().await = leverage;

        self.refresh_positions(None).await?;
        for symbol in &self.symbols {
            let rules = self.rules.read().await.get(symbol).cloned();
            if let Some(r) = rules {
                info!(
                    symbol = %symbol,
                    tick = %r.tick_size,
                    step = %r.step_size,
                    min_qty = %r.min_qty,
                    min_notional = %r.min_notional,
                    "APP: instrument rules loaded"
                );
            }
        }
        Ok(())
    }

    /// Replace the position cache from REST (clear first, then refill, so a
    /// closed position cannot linger as a ghost).
    async fn refresh_positions(&self, symbol: Option<&str>) -> Result<()> {
        let fetched = rest::fetch_positions(&self.connection, symbol).await?;
        let leverage = self.leverage.read().await.clone();
        let mut cache = self.positions.write().await;
        match symbol {
            Some(s) => {
                cache.insert(s.to_string(), HashMap::new());
            }
            None => cache.clear(),
        }
        for mut pos in fetched {
            if !self.symbols.contains(&pos.symbol) {
                continue;
            }
            if let Some(lev) = leverage.get(&pos.symbol) {
                pos.leverage = *lev;
            }
            cache
                .entry(pos.symbol.clone())
                .or_default()
                .insert(pos.position_side, pos);
        }
        Ok(())
    }

    // ==================================================================
    // Main loop
    // ==================================================================

    pub async fn run(self: &Arc<Self>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);

        let (market_tx, mut market_rx) = unbounded_channel::<MarketEvent>();
        let (user_tx, mut user_rx) = unbounded_channel::<UserEvent>();
        let (reconnect_tx, mut reconnect_rx) = unbounded_channel::<StreamKind>();

        // Protective stops first: the process may have been down for a while.
        for symbol in self.symbols.clone() {
            self.sync_protective_stop(&symbol, "startup").await;
        }

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(market_ws::run(
            self.connection.clone(),
            self.symbols.clone(),
            market_tx,
            reconnect_tx.clone(),
        )));
        tasks.push(tokio::spawn(user_ws::run(
            self.connection.clone(),
            user_tx,
            reconnect_tx,
        )));

        {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = market_rx.recv().await {
                    app.on_market_event(event).await;
                }
            }));
        }
        {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = user_rx.recv().await {
                    app.on_user_event(event).await;
                }
            }));
        }
        {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(kind) = reconnect_rx.recv().await {
                    app.calibrate_after_reconnect(kind).await;
                }
            }));
        }

        // Fill notifications.
        if let Some(mut fills_rx) = self.fills_rx.lock().await.take() {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(fill) = fills_rx.recv().await {
                    if app.notifier_events.on_fill {
                        app.notifier.notify_fill(
                            &fill.symbol,
                            fill.position_side.as_str(),
                            fill.mode.as_str(),
                            &fill.filled_qty.normalize().to_string(),
                            &fill.avg_price.normalize().to_string(),
                            &fill.reason,
                        );
                    }
                }
            }));
        }

        // One evaluation loop per (symbol, side).
        for symbol in self.symbols.clone() {
            for side in [PositionSide::Long, PositionSide::Short] {
                let app = self.clone();
                let symbol = symbol.clone();
                tasks.push(tokio::spawn(async move {
                    loop {
                        if !app.running.load(Ordering::SeqCst) {
                            break;
                        }
                        if let Err(e) = app.evaluate_side(&symbol, side).await {
                            warn!(symbol = %symbol, side = %side.as_str(), error = %e, "APP: side loop error");
                            sleep(Duration::from_secs(1)).await;
                        }
                        sleep(SIDE_LOOP_INTERVAL).await;
                    }
                }));
            }
        }

        // TTL / cooldown / takeover-verify timer.
        {
            let app = self.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    if !app.running.load(Ordering::SeqCst) {
                        break;
                    }
                    app.check_timers().await;
                    sleep(TIMER_LOOP_INTERVAL).await;
                }
            }));
        }

        *self.tasks.lock().await = tasks;

        self.shutdown_notify.notified().await;
        self.shutdown().await;
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.shutdown_notify.notify_one();
    }

    // ==================================================================
    // Event handlers
    // ==================================================================

    async fn on_market_event(&self, event: MarketEvent) {
        {
            let mut signal = self.signal.lock().await;
            signal.update_market(&event);
        }

        // Mark price feeds the risk supervisor only.
        if let MarketEventKind::MarkPrice { price } = event.kind {
            let held = {
                let mut cache = self.positions.write().await;
                let Some(sides) = cache.get_mut(&event.symbol) else {
                    return;
                };
                for pos in sides.values_mut() {
                    pos.mark_price = Some(price);
                }
                sides.values().cloned().collect::<Vec<_>>()
            };
            for pos in held {
                let assessment = {
                    let Some(risk) = self.risk.get(&event.symbol) else {
                        return;
                    };
                    risk.lock().expect("risk mutex poisoned").assess(&pos)
                };
                if assessment.newly_triggered {
                    if self.notifier_events.on_risk_trigger {
                        self.notifier.notify_risk_trigger(
                            &pos.symbol,
                            pos.position_side.as_str(),
                            &assessment
                                .dist_to_liq
                                .map(|d| d.normalize().to_string())
                                .unwrap_or_else(|| "?".to_string()),
                        );
                    }
                }
            }
        }
    }

    async fn on_user_event(self: &Arc<Self>, event: UserEvent) {
        match event {
            UserEvent::Order(update) => self.on_order_update(update).await,
            UserEvent::Algo(update) => self.on_algo_update(update).await,
            UserEvent::Position(update) => self.on_position_update(update).await,
            UserEvent::Leverage(update) => {
                if !self.symbols.contains(&update.symbol) {
                    return;
                }
                info!(symbol = %update.symbol, leverage = update.leverage, "APP: leverage updated");
                self.leverage
                    .write()
                    .await
                    .insert(update.symbol.clone(), update.leverage);
                if let Some(r) = self.rules.write().await.get_mut(&update.symbol) {
                    r.leverage = update.leverage;
                }
                if let Some(sides) = self.positions.write().await.get_mut(&update.symbol) {
                    for pos in sides.values_mut() {
                        pos.leverage = update.leverage;
                    }
                }
            }
        }
    }

    async fn on_order_update(self: &Arc<Self>, update: OrderUpdate) {
        if let Some(engine) = self.engines.get(&update.symbol) {
            engine.lock().await.on_order_update(&update, now_ms());
        }
        self.stops.on_order_update(&update).await;

        if update.client_order_id.starts_with(PROTECTIVE_STOP_PREFIX) {
            self.schedule_stop_sync(&update.symbol, "own_stop_update").await;
            return;
        }

        // External conditional on our side: arm or (pending REST verify)
        // release the takeover latch.
        let is_stop = update
            .order_type
            .as_deref()
            .map_or(false, is_stop_order_type);
        if is_stop
            && (update.close_position == Some(true) || update.reduce_only == Some(true))
            && !self.is_own_run_order(&update.client_order_id)
            && self.symbols.contains(&update.symbol)
        {
            let now = now_ms();
            if update.status.is_terminal() {
                self.takeover_request_release(&update.symbol, update.position_side, now)
                    .await;
            } else {
                self.takeover_set(&update.symbol, update.position_side, now, "ws_order")
                    .await;
            }
            self.schedule_stop_sync(&update.symbol, "external_stop_update")
                .await;
        }
    }

    async fn on_algo_update(self: &Arc<Self>, update: crate::types::AlgoOrderUpdate) {
        if !self.symbols.contains(&update.symbol) {
            return;
        }

        if update.client_algo_id.starts_with(PROTECTIVE_STOP_PREFIX) {
            self.stops.on_algo_order_update(&update).await;
            self.schedule_stop_sync(&update.symbol, "own_algo_update").await;
            return;
        }

        let is_stop = update
            .order_type
            .as_deref()
            .map_or(false, is_stop_order_type);
        if is_stop && (update.close_position == Some(true) || update.reduce_only == Some(true)) {
            let now = now_ms();
            // Unknown position side (BOTH) conservatively latches both.
            let sides = match update.position_side {
                Some(side) => vec![side],
                None => vec![PositionSide::Long, PositionSide::Short],
            };
            for side in sides {
                if update.is_terminal() {
                    self.takeover_request_release(&update.symbol, side, now).await;
                } else {
                    self.takeover_set(&update.symbol, side, now, "ws_algo").await;
                }
            }
            self.schedule_stop_sync(&update.symbol, "external_algo_update")
                .await;
        }
    }

    async fn on_position_update(self: &Arc<Self>, update: PositionUpdate) {
        if !self.symbols.contains(&update.symbol) {
            return;
        }
        let key = (update.symbol.clone(), update.position_side);

        let prev_amt = {
            let cache = self.positions.read().await;
            cache
                .get(&update.symbol)
                .and_then(|sides| sides.get(&update.position_side))
                .map(|p| p.position_amt)
                .unwrap_or(Decimal::ZERO)
        };

        if update.position_amt == Decimal::ZERO {
            // Ghost-free cache: remove at zero, recycle the side state, and
            // clear any leftover run-scoped orders that could reopen the side.
            {
                let mut cache = self.positions.write().await;
                if let Some(sides) = cache.get_mut(&update.symbol) {
                    sides.remove(&update.position_side);
                }
            }
            if prev_amt != Decimal::ZERO {
                info!(
                    symbol = %update.symbol,
                    side = %update.position_side.as_str(),
                    "APP: position fully closed"
                );
                if let Some(engine) = self.engines.get(&update.symbol) {
                    engine.lock().await.reset_side(update.position_side);
                }
                self.signal
                    .lock()
                    .await
                    .reset_side(&update.symbol, update.position_side);
                if let Some(risk) = self.risk.get(&update.symbol) {
                    risk.lock()
                        .expect("risk mutex poisoned")
                        .clear_side(&update.symbol, update.position_side);
                }
                self.done_sides.lock().await.remove(&key);
                self.cancel_run_orders_for_side(&update.symbol, update.position_side)
                    .await;
            }
            self.schedule_stop_sync(&update.symbol, "position_update").await;
            return;
        }

        self.done_sides.lock().await.remove(&key);

        // This executor only reduces; any growth is worth an alert.
        if update.position_amt.abs() > prev_amt.abs() && self.notifier_events.on_open_alert {
            self.notifier.notify_position_increase(
                &update.symbol,
                update.position_side.as_str(),
                &prev_amt.abs().normalize().to_string(),
                &update.position_amt.abs().normalize().to_string(),
            );
        }

        {
            let leverage = self
                .leverage
                .read()
                .await
                .get(&update.symbol)
                .copied()
                .unwrap_or(1);
            let mut cache = self.positions.write().await;
            let sides = cache.entry(update.symbol.clone()).or_default();
            let prev = sides.get(&update.position_side);
            let merged = Position {
                symbol: update.symbol.clone(),
                position_side: update.position_side,
                position_amt: update.position_amt,
                entry_price: update
                    .entry_price
                    .or(prev.map(|p| p.entry_price))
                    .unwrap_or(Decimal::ZERO),
                unrealized_pnl: update
                    .unrealized_pnl
                    .or(prev.map(|p| p.unrealized_pnl))
                    .unwrap_or(Decimal::ZERO),
                leverage: prev.map(|p| p.leverage).unwrap_or(leverage),
                mark_price: prev.and_then(|p| p.mark_price),
                liquidation_price: prev.and_then(|p| p.liquidation_price),
            };
            sides.insert(update.position_side, merged);
        }

        if prev_amt != update.position_amt {
            debug!(
                symbol = %update.symbol,
                side = %update.position_side.as_str(),
                amt = %update.position_amt,
                "APP: position updated"
            );
            self.schedule_stop_sync(&update.symbol, "position_update").await;
        }
    }

    // ==================================================================
    // Evaluation
    // ==================================================================

    async fn evaluate_side(self: &Arc<Self>, symbol: &str, side: PositionSide) -> Result<()> {
        if self.calibrating.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Some(settings) = self.settings.get(symbol) else {
            return Ok(());
        };
        let Some(engine) = self.engines.get(symbol) else {
            return Ok(());
        };

        let position = {
            let cache = self.positions.read().await;
            cache.get(symbol).and_then(|sides| sides.get(&side)).cloned()
        };
        let Some(position) = position else {
            return Ok(());
        };
        if position.abs_amt() == Decimal::ZERO {
            return Ok(());
        }

        let now = now_ms();
        let (stale, view) = {
            let signal = self.signal.lock().await;
            (
                signal.is_stale(symbol, now, self.stale_data_ms),
                signal.market_view(symbol),
            )
        };
        // No submit on stale data, panic slices included; the snapshot is the
        // only defensible price source.
        if stale {
            return Ok(());
        }
        let Some(view) = view else {
            return Ok(());
        };
        let Some(rules) = self.rules.read().await.get(symbol).cloned() else {
            return Ok(());
        };

        // Tier 2: panic sliced close, independent of signals and throttle.
        if settings.panic_close_enabled {
            if let Some(dist) = position.dist_to_liq() {
                if let Some(tier) = select_panic_tier(&settings.panic_close_tiers, dist) {
                    return self
                        .run_panic_close(symbol, side, &position, &rules, view, dist, tier.clone(), settings)
                        .await;
                }
            }
        }
        // Out of the panic band: retire the overrides once the side is idle.
        {
            let mut engine_guard = engine.lock().await;
            if engine_guard.clear_risk_overrides_if_idle(side) {
                self.panic_last_tier
                    .lock()
                    .await
                    .remove(&(symbol.to_string(), side));
            }
        }

        // Completion rule: stop acting on untradable remainders.
        {
            let engine_guard = engine.lock().await;
            if engine_guard.is_done(position.position_amt, &rules, view.last_trade_price) {
                drop(engine_guard);
                let key = (symbol.to_string(), side);
                if self.done_sides.lock().await.insert(key) {
                    info!(
                        symbol = %symbol,
                        side = %side.as_str(),
                        position_amt = %position.position_amt,
                        "APP: side complete, remainder below tradable minimums"
                    );
                    self.cancel_run_orders_for_side(symbol, side).await;
                }
                return Ok(());
            }
        }

        engine.lock().await.check_cooldown(side, now);

        let ready = self.signal.lock().await.is_ready(symbol);
        if !ready {
            return Ok(());
        }

        let signal = {
            let mut signal_engine = self.signal.lock().await;
            signal_engine.evaluate(symbol, side, &position, now)
        };
        let Some(signal) = signal else {
            return Ok(());
        };

        // Tier 1: near liquidation the engine is pinned to aggressive.
        let flagged = self
            .risk
            .get(symbol)
            .map(|r| r.lock().expect("risk mutex poisoned").is_flagged(symbol, side))
            .unwrap_or(false);

        let intent = {
            let mut engine_guard = engine.lock().await;
            if flagged && engine_guard.mode(side) != ExecutionMode::AggressiveLimit {
                engine_guard.set_mode(side, ExecutionMode::AggressiveLimit, "risk_trigger");
            }
            engine_guard.on_signal(&signal, position.position_amt, &rules, view, now)
        };

        if let Some(intent) = intent {
            self.submit_and_track(engine, intent, view, &rules).await;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_panic_close(
        &self,
        symbol: &str,
        side: PositionSide,
        position: &Position,
        rules: &InstrumentRules,
        view: MarketView,
        dist: Decimal,
        tier: crate::config::PanicCloseTier,
        settings: &Arc<SymbolSettings>,
    ) -> Result<()> {
        let Some(engine) = self.engines.get(symbol) else {
            return Ok(());
        };
        let key = (symbol.to_string(), side);

        // Log (and notify) once per tier entry, not every 50 ms.
        {
            let mut last = self.panic_last_tier.lock().await;
            if last.get(&key) != Some(&tier.dist_to_liq) {
                last.insert(key.clone(), tier.dist_to_liq);
                log_risk_trigger(symbol, side.as_str(), "panic_close", Some(dist));
                if self.notifier_events.on_risk_trigger {
                    self.notifier.notify_risk_trigger(
                        symbol,
                        side.as_str(),
                        &dist.normalize().to_string(),
                    );
                }
            }
        }

        let now = now_ms();
        let intent = {
            let mut engine_guard = engine.lock().await;
            let ttl = ttl_from_percent(settings.order_ttl_ms, settings.panic_close_ttl_percent);
            engine_guard.set_risk_overrides(side, ttl, tier.maker_timeouts_to_escalate);
            engine_guard.check_cooldown(side, now);
            engine_guard.on_panic_close(
                side,
                position.position_amt,
                rules,
                view,
                now,
                tier.slice_ratio,
                &format!("panic_close@{}", tier.dist_to_liq.normalize()),
            )
        };

        if let Some(intent) = intent {
            self.submit_and_track(engine, intent, view, rules).await;
        }
        Ok(())
    }

    /// Submit an intent through the limiter, handle the venue's immediate
    /// rejections (post-only upgrade retry, duplicate-id regenerate), and feed
    /// the result back to the engine.
    async fn submit_and_track(
        &self,
        engine: &Arc<Mutex<ExecutionEngine>>,
        mut intent: OrderIntent,
        view: MarketView,
        rules: &InstrumentRules,
    ) {
        let now = now_ms();

        if !intent.is_risk && !self.limiter.try_acquire_submit(now) {
            debug!(symbol = %intent.symbol, "APP: submit denied by rate limiter");
            let result = OrderResult::rejected(None, "rate_limited: submit");
            engine.lock().await.on_order_placed(&intent, &result, now);
            return;
        }

        if intent.client_order_id.is_none() {
            intent.client_order_id = Some(self.next_client_order_id());
        }
        let mut result = rest::place_order(&self.connection, &intent).await;

        // Duplicate client id: regenerate and retry once.
        if result.is_duplicate_client_id() {
            warn!(symbol = %intent.symbol, "APP: duplicate client id, regenerating");
            intent.client_order_id = Some(self.next_client_order_id());
            result = rest::place_order(&self.connection, &intent).await;
        }

        // Post-only reject: one aggressive retry within the same opportunity.
        if result.is_post_only_reject() {
            let retry = engine
                .lock()
                .await
                .on_post_only_reject(&intent, view, rules, now_ms());
            if let Some(mut retry) = retry {
                retry.client_order_id = Some(self.next_client_order_id());
                let retry_result = rest::place_order(&self.connection, &retry).await;
                engine
                    .lock()
                    .await
                    .on_order_placed(&retry, &retry_result, now_ms());
                return;
            }
        }

        engine.lock().await.on_order_placed(&intent, &result, now_ms());
    }

    // ==================================================================
    // Timers
    // ==================================================================

    async fn check_timers(self: &Arc<Self>) {
        let now = now_ms();
        for symbol in &self.symbols {
            let Some(engine) = self.engines.get(symbol) else {
                continue;
            };
            for side in [PositionSide::Long, PositionSide::Short] {
                let cancel = engine.lock().await.check_timeout(side, now);
                if let Some(cancel) = cancel {
                    if !cancel.is_risk && !self.limiter.try_acquire_cancel(now) {
                        debug!(symbol = %symbol, "APP: cancel denied by rate limiter");
                        engine.lock().await.on_cancel_dispatched(side, now);
                        continue;
                    }
                    let result =
                        rest::cancel_order(&self.connection, &cancel.symbol, &cancel.order_id)
                            .await;
                    if !result.success {
                        warn!(
                            symbol = %cancel.symbol,
                            order_id = %cancel.order_id,
                            error = ?result.error_message,
                            "APP: cancel request failed"
                        );
                    }
                    engine.lock().await.on_cancel_dispatched(side, now_ms());
                }
                engine.lock().await.check_cooldown(side, now);
            }

            // Latch held without stream traffic: force a REST verification.
            if self.takeover_should_verify(symbol, now).await {
                self.schedule_stop_sync(symbol, "takeover_verify").await;
            }
        }
    }

    // ==================================================================
    // External takeover latch
    // ==================================================================

    async fn takeover_enabled(&self, symbol: &str) -> bool {
        self.settings
            .get(symbol)
            .map(|s| s.external_takeover_enabled)
            .unwrap_or(false)
    }

    async fn takeover_set(&self, symbol: &str, side: PositionSide, now: i64, source: &str) {
        if !self.takeover_enabled(symbol).await {
            return;
        }
        let mut latches = self.takeover.lock().await;
        let st = latches
            .entry((symbol.to_string(), side))
            .or_default();
        if !st.active {
            st.active = true;
            st.first_seen_ms = now;
            st.pending_release = false;
            info!(
                symbol = %symbol,
                side = %side.as_str(),
                source = %source,
                "STOP: external takeover latched"
            );
        }
        st.last_seen_ms = now;
    }

    /// A terminal stream event for one external order is not proof the side
    /// is clear (several externals may coexist). Mark pending and let the
    /// REST verify decide.
    async fn takeover_request_release(&self, symbol: &str, side: PositionSide, now: i64) {
        if !self.takeover_enabled(symbol).await {
            return;
        }
        let mut latches = self.takeover.lock().await;
        if let Some(st) = latches.get_mut(&(symbol.to_string(), side)) {
            if st.active {
                st.pending_release = true;
                st.last_seen_ms = now;
            }
        }
    }

    async fn takeover_latch_map(&self, symbol: &str) -> HashMap<PositionSide, bool> {
        let latches = self.takeover.lock().await;
        let mut map = HashMap::new();
        for side in [PositionSide::Long, PositionSide::Short] {
            map.insert(
                side,
                latches
                    .get(&(symbol.to_string(), side))
                    .map(|st| st.active)
                    .unwrap_or(false),
            );
        }
        map
    }

    async fn takeover_should_verify(&self, symbol: &str, now: i64) -> bool {
        let Some(settings) = self.settings.get(symbol) else {
            return false;
        };
        if !settings.external_takeover_enabled {
            return false;
        }
        let verify_ms = settings.external_takeover_rest_verify_interval_s as i64 * 1000;
        let max_hold_ms = settings.external_takeover_max_hold_s as i64 * 1000;
        let latches = self.takeover.lock().await;
        for side in [PositionSide::Long, PositionSide::Short] {
            let Some(st) = latches.get(&(symbol.to_string(), side)) else {
                continue;
            };
            if !st.active {
                continue;
            }
            if st.last_verify_ms == 0 || now - st.last_verify_ms >= verify_ms {
                return true;
            }
            if st.first_seen_ms > 0
                && now - st.first_seen_ms >= max_hold_ms
                && now - st.last_verify_ms >= verify_ms.min(5_000)
            {
                return true;
            }
        }
        false
    }

    // ==================================================================
    // Protective stop sync
    // ==================================================================

    fn sync_debounce(reason: &str) -> Duration {
        if reason.starts_with("position_update") {
            Duration::from_secs(1)
        } else if reason.starts_with("startup") || reason.starts_with("calibration") {
            Duration::ZERO
        } else {
            Duration::from_millis(200)
        }
    }

    /// Debounced per-symbol sync scheduling; bursts collapse into one pass.
    async fn schedule_stop_sync(self: &Arc<Self>, symbol: &str, reason: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let app = self.clone();
        let debounce = Self::sync_debounce(reason);

        let mut tasks = self.stop_sync_tasks.lock().await;
        if let Some((prev_reason, handle)) = tasks.get(symbol) {
            // A queued verify pass only needs to run once.
            if reason == "takeover_verify" && prev_reason == "takeover_verify" && !handle.is_finished()
            {
                return;
            }
            handle.abort();
        }
        let symbol_owned = symbol.to_string();
        let reason_owned = reason.to_string();
        let handle = tokio::spawn(async move {
            if debounce > Duration::ZERO {
                sleep(debounce).await;
            }
            app.sync_protective_stop(&symbol_owned, &reason_owned).await;
        });
        tasks.insert(symbol.to_string(), (reason.to_string(), handle));
    }

    async fn sync_protective_stop(&self, symbol: &str, reason: &str) {
        let Some(settings) = self.settings.get(symbol) else {
            return;
        };
        let Some(rules) = self.rules.read().await.get(symbol).cloned() else {
            return;
        };
        let positions = self
            .positions
            .read()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default();
        let latch = self.takeover_latch_map(symbol).await;
        let now = now_ms();

        let presence = match self
            .stops
            .sync_symbol(
                symbol,
                &rules,
                &positions,
                settings.protective_stop_enabled,
                settings.protective_stop_dist_to_liq,
                &latch,
                now,
            )
            .await
        {
            Ok(p) => p,
            Err(e) => {
                warn!(symbol = %symbol, reason = %reason, error = %e, "STOP: sync failed");
                return;
            }
        };

        if !settings.external_takeover_enabled {
            return;
        }

        // REST-verified latch bookkeeping.
        let verify_ms = settings.external_takeover_rest_verify_interval_s as i64 * 1000;
        let mut needs_resync = false;
        {
            let mut latches = self.takeover.lock().await;
            for side in [PositionSide::Long, PositionSide::Short] {
                let present = *presence.get(&side).unwrap_or(&false);
                let key = (symbol.to_string(), side);
                let st = latches.entry(key).or_default();
                st.last_verify_ms = now;
                if present {
                    if !st.active {
                        st.active = true;
                        st.first_seen_ms = now;
                        info!(
                            symbol = %symbol,
                            side = %side.as_str(),
                            "STOP: external takeover latched (rest)"
                        );
                    }
                    st.pending_release = false;
                    st.last_seen_ms = now;
                } else if st.active
                    && (st.pending_release || now - st.last_seen_ms >= verify_ms)
                {
                    st.active = false;
                    st.pending_release = false;
                    info!(
                        symbol = %symbol,
                        side = %side.as_str(),
                        "STOP: external takeover released (rest verified)"
                    );
                    needs_resync = true;
                }
            }
        }

        // The side just came back under our protection: re-arm immediately.
        if needs_resync && reason != "takeover_release" {
            Box::pin(self.sync_protective_stop(symbol, "takeover_release")).await;
        }
    }

    // ==================================================================
    // Reconnect recalibration
    // ==================================================================

    /// No-submit window around a REST re-sync after either stream reconnects.
    async fn calibrate_after_reconnect(self: &Arc<Self>, kind: StreamKind) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if self
            .calibrating
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!(stream = kind.as_str(), "APP: recalibration started");
        if self.notifier_events.on_reconnect {
            self.notifier.notify_reconnect(kind.as_str());
        }

        let result: Result<()> = async {
            let rules = rest::fetch_instrument_rules(&self.connection, &self.symbols).await?;
            let leverage = rest::fetch_leverage_map(&self.connection, &self.symbols)
                .await
                .unwrap_or_default();
            {
                let mut rules_guard = self.rules.write().await;
                for (symbol, mut r) in rules {
                    if let Some(lev) = leverage.get(&symbol) {
                        r.leverage = *lev;
                    }
                    rules_guard.insert(symbol, r);
                }
            }
            if !leverage.is_empty() {
                *self.leverage.write().await = leverage;
            }
            self.refresh_positions(None).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            error!(error = %e, "APP: recalibration failed");
        }

        self.calibrating.store(false, Ordering::SeqCst);
        info!(stream = kind.as_str(), "APP: recalibration done");

        // Only after the window closes: protective-stop reconciliation.
        for symbol in self.symbols.clone() {
            self.schedule_stop_sync(&symbol, "calibration").await;
        }
    }

    // ==================================================================
    // Shutdown and cleanup
    // ==================================================================

    /// Graceful shutdown. Idempotent; a second call is a no-op. Protective
    /// stops are left on the venue on purpose — they exist to survive us.
    pub async fn shutdown(&self) {
        if self
            .shutdown_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        info!("APP: shutdown started");
        self.running.store(false, Ordering::SeqCst);

        {
            let mut sync_tasks = self.stop_sync_tasks.lock().await;
            for (_, (_, handle)) in sync_tasks.drain() {
                handle.abort();
            }
        }

        if tokio::time::timeout(SHUTDOWN_CANCEL_TIMEOUT, self.cancel_own_orders("shutdown"))
            .await
            .is_err()
        {
            warn!("APP: own-order cleanup timed out");
        }

        {
            let mut tasks = self.tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        if let Err(e) = rest::close_listen_key(&self.connection).await {
            debug!(error = %e, "APP: listen key close failed");
        }

        info!("APP: shutdown complete");
    }

    /// Cancel every open order whose client id carries this run's prefix.
    /// Foreign orders — manual, other instances, protective stops — are never
    /// touched.
    async fn cancel_own_orders(&self, reason: &str) {
        let mut cancels = Vec::new();
        for symbol in &self.symbols {
            let orders = match rest::fetch_open_orders_raw(&self.connection, Some(symbol)).await {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "APP: open-order fetch failed");
                    continue;
                }
            };
            for order in orders {
                let cid = order
                    .get("clientOrderId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                if !self.is_own_run_order(cid) {
                    continue;
                }
                let order_id = match order.get("orderId") {
                    Some(serde_json::Value::Number(n)) => n.to_string(),
                    Some(serde_json::Value::String(s)) => s.clone(),
                    _ => continue,
                };
                info!(
                    symbol = %symbol,
                    order_id = %order_id,
                    client_order_id = %cid,
                    reason = %reason,
                    "APP: cancelling own order"
                );
                let conn = self.connection.clone();
                let symbol = symbol.clone();
                cancels.push(async move {
                    let result = rest::cancel_order(&conn, &symbol, &order_id).await;
                    if !result.success {
                        warn!(
                            symbol = %symbol,
                            order_id = %order_id,
                            error = ?result.error_message,
                            "APP: own-order cancel failed"
                        );
                    }
                });
            }
        }
        join_all(cancels).await;
    }

    /// Cancel this run's open orders on one side only (position externally
    /// closed; a leftover reduce order could flip the side back open).
    async fn cancel_run_orders_for_side(&self, symbol: &str, side: PositionSide) {
        let orders = match rest::fetch_open_orders_raw(&self.connection, Some(symbol)).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "APP: open-order fetch failed");
                return;
            }
        };
        let mut cancelled = 0u32;
        for order in orders {
            let cid = order
                .get("clientOrderId")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if !self.is_own_run_order(cid) {
                continue;
            }
            let ps = order
                .get("positionSide")
                .and_then(|v| v.as_str())
                .and_then(PositionSide::parse);
            if ps.is_some() && ps != Some(side) {
                continue;
            }
            let order_id = match order.get("orderId") {
                Some(serde_json::Value::Number(n)) => n.to_string(),
                Some(serde_json::Value::String(s)) => s.clone(),
                _ => continue,
            };
            let result = rest::cancel_order(&self.connection, symbol, &order_id).await;
            if result.success {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(
                symbol = %symbol,
                side = %side.as_str(),
                cancelled,
                "APP: leftover side orders cancelled"
            );
        }
    }

}

fn ttl_from_percent(order_ttl_ms: i64, percent: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    (Decimal::from(order_ttl_ms) * percent)
        .to_i64()
        .unwrap_or(order_ttl_ms)
        .max(1)
}
