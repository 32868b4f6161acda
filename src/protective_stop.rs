// Exchange-resident protective stop (risk tier 3).
// One STOP_MARKET closePosition=true per held (symbol, side), triggered on
// mark price, so the position still dies near its target distance if this
// process crashes or loses connectivity. Identified by a stable client-id
// prefix that survives restarts — unlike normal orders, which are run-scoped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::rules::{round_price_down, round_price_up, InstrumentRules};
use crate::types::{
    AlgoOrderUpdate, OrderIntent, OrderResult, OrderStatus, OrderUpdate, Position, PositionSide,
};

/// Stable cross-run client-id prefix for protective stops.
pub const PROTECTIVE_STOP_PREFIX: &str = "uw-ps-";

/// Relative tolerance when judging whether an external stop sits on the wrong
/// side of the liquidation price.
const WRONG_SIDE_TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 4); // 1e-4

/// Venue order types that count as stop / take-profit conditionals.
pub fn is_stop_order_type(order_type: &str) -> bool {
    matches!(
        order_type,
        "STOP_MARKET" | "TAKE_PROFIT_MARKET" | "STOP" | "TAKE_PROFIT"
    )
}

/// The slice of the exchange the stop manager needs. `Connection` implements
/// this; tests substitute a mock.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Raw open orders; must surface closePosition stops.
    async fn fetch_open_orders_raw(&self, symbol: &str) -> Result<Vec<Value>>;
    /// Open algo (conditional) orders; both array and wrapped response forms.
    async fn fetch_open_algo_orders(&self, symbol: &str) -> Result<Vec<Value>>;
    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult>;
    /// Cancel by id, trying the normal order endpoint then the algo endpoint.
    async fn cancel_any(&self, symbol: &str, order_id: &str) -> Result<OrderResult>;
}

#[derive(Clone, Debug)]
struct StopState {
    client_order_id: String,
    order_id: Option<String>,
    stop_price: Option<Decimal>,
}

/// Outcome of one per-symbol sync: whether an external reduce-only stop/tp
/// was present on each side (after invalid ones were cleaned up).
pub type ExternalPresence = HashMap<PositionSide, bool>;

pub struct ProtectiveStopManager<G: OrderGateway> {
    gateway: Arc<G>,
    states: Mutex<HashMap<(String, PositionSide), StopState>>,
    sync_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<G: OrderGateway> ProtectiveStopManager<G> {
    pub fn new(gateway: Arc<G>) -> Self {
        Self {
            gateway,
            states: Mutex::new(HashMap::new()),
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    fn side_prefix(symbol: &str, position_side: PositionSide) -> String {
        let code = match position_side {
            PositionSide::Long => "L",
            PositionSide::Short => "S",
        };
        format!("{}{}-{}", PROTECTIVE_STOP_PREFIX, symbol.to_lowercase(), code)
    }

    /// Unique client id: stable prefix plus a millisecond suffix (the venue
    /// requires uniqueness inside its 7-day window), capped at 36 chars.
    pub fn build_client_order_id(symbol: &str, position_side: PositionSide, now_ms: i64) -> String {
        let prefix = Self::side_prefix(symbol, position_side);
        let mut cid = format!("{}-{}", prefix, now_ms % 100_000);
        cid.truncate(36);
        cid
    }

    pub fn matches_side(client_order_id: &str, symbol: &str, position_side: PositionSide) -> bool {
        client_order_id.starts_with(&Self::side_prefix(symbol, position_side))
    }

    pub fn is_own_client_id(client_order_id: &str) -> bool {
        client_order_id.starts_with(PROTECTIVE_STOP_PREFIX)
    }

    /// Stop price that makes the stop trigger at roughly `dist_to_liq` from
    /// the advertised liquidation price. Rounding is toward the safe side:
    /// LONG stops round up (earlier trigger), SHORT stops round down.
    pub fn compute_stop_price(
        position_side: PositionSide,
        liquidation_price: Decimal,
        dist_to_liq: Decimal,
        tick_size: Decimal,
    ) -> Result<Decimal> {
        if liquidation_price <= Decimal::ZERO {
            anyhow::bail!("liquidation price must be positive");
        }
        if dist_to_liq <= Decimal::ZERO || dist_to_liq >= Decimal::ONE {
            anyhow::bail!("dist_to_liq must be in (0, 1)");
        }
        Ok(match position_side {
            PositionSide::Long => {
                round_price_up(liquidation_price / (Decimal::ONE - dist_to_liq), tick_size)
            }
            PositionSide::Short => {
                round_price_down(liquidation_price / (Decimal::ONE + dist_to_liq), tick_size)
            }
        })
    }

    /// Clear local state when our own stop reaches a terminal status.
    pub async fn on_order_update(&self, update: &OrderUpdate) {
        if update.client_order_id.is_empty() {
            return;
        }
        let mut states = self.states.lock().await;
        for side in [PositionSide::Long, PositionSide::Short] {
            let key = (update.symbol.clone(), side);
            if !states.contains_key(&key) {
                continue;
            }
            if !Self::matches_side(&update.client_order_id, &update.symbol, side) {
                continue;
            }
            if update.status.is_terminal() {
                states.remove(&key);
                info!(
                    symbol = %update.symbol,
                    side = %side.as_str(),
                    order_id = %update.order_id,
                    status = ?update.status,
                    "STOP: own protective stop reached terminal state"
                );
            }
        }
    }

    pub async fn on_algo_order_update(&self, update: &AlgoOrderUpdate) {
        if !update.is_terminal() {
            return;
        }
        let mut states = self.states.lock().await;
        for side in [PositionSide::Long, PositionSide::Short] {
            let key = (update.symbol.clone(), side);
            if !states.contains_key(&key) {
                continue;
            }
            if !Self::matches_side(&update.client_algo_id, &update.symbol, side) {
                continue;
            }
            states.remove(&key);
            info!(
                symbol = %update.symbol,
                side = %side.as_str(),
                algo_id = %update.algo_id,
                status = %update.status,
                "STOP: own protective stop reached terminal state (algo)"
            );
        }
    }

    /// Reconcile one symbol against the venue. Returns, per side, whether an
    /// external reduce-only stop/tp is present (drives the takeover latch).
    pub async fn sync_symbol(
        &self,
        symbol: &str,
        rules: &InstrumentRules,
        positions: &HashMap<PositionSide, Position>,
        enabled: bool,
        dist_to_liq: Decimal,
        latch_by_side: &HashMap<PositionSide, bool>,
        now_ms: i64,
    ) -> Result<ExternalPresence> {
        let lock = {
            let mut locks = self.sync_locks.lock().await;
            locks
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let open_orders = self.gateway.fetch_open_orders_raw(symbol).await?;
        let algo_orders = self.gateway.fetch_open_algo_orders(symbol).await?;
        let all_orders = merge_order_sources(open_orders, algo_orders);

        let mut own_by_side: HashMap<PositionSide, Vec<Value>> = HashMap::new();
        let mut external_by_side: ExternalPresence = HashMap::new();
        external_by_side.insert(PositionSide::Long, false);
        external_by_side.insert(PositionSide::Short, false);

        for order in &all_orders {
            let Some(side) = extract_position_side(order) else {
                continue;
            };
            let cid = extract_client_order_id(order);
            if cid
                .as_deref()
                .map_or(false, |c| Self::matches_side(c, symbol, side))
            {
                own_by_side.entry(side).or_default().push(order.clone());
                continue;
            }
            if !is_external_protective(order) {
                continue;
            }
            // An external stop resting on the wrong side of the liquidation
            // price can never protect; cancel it and take over.
            let liq = positions.get(&side).and_then(|p| p.liquidation_price);
            if let (Some(liq), Some(stop_price)) = (liq, extract_stop_price(order)) {
                if is_wrong_side_stop(side, stop_price, liq) {
                    if let Some(order_id) = extract_order_id(order) {
                        warn!(
                            symbol = %symbol,
                            side = %side.as_str(),
                            order_id = %order_id,
                            stop_price = %stop_price,
                            liquidation = %liq,
                            "STOP: cancelling invalid external stop"
                        );
                        let _ = self.gateway.cancel_any(symbol, &order_id).await;
                    }
                    continue;
                }
            }
            external_by_side.insert(side, true);
        }

        for side in [PositionSide::Long, PositionSide::Short] {
            self.sync_side(
                symbol,
                side,
                rules,
                positions.get(&side),
                enabled,
                dist_to_liq,
                own_by_side.remove(&side).unwrap_or_default(),
                *external_by_side.get(&side).unwrap_or(&false),
                *latch_by_side.get(&side).unwrap_or(&false),
                now_ms,
            )
            .await?;
        }

        Ok(external_by_side)
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_side(
        &self,
        symbol: &str,
        side: PositionSide,
        rules: &InstrumentRules,
        position: Option<&Position>,
        enabled: bool,
        dist_to_liq: Decimal,
        existing: Vec<Value>,
        has_external: bool,
        latched: bool,
        now_ms: i64,
    ) -> Result<()> {
        // Duplicate own stops should not exist; keep the first, drop the rest.
        let mut existing = existing.into_iter();
        let keep = existing.next();
        for extra in existing {
            if let Some(order_id) = extract_order_id(&extra) {
                if let Err(e) = self.gateway.cancel_any(symbol, &order_id).await {
                    warn!(symbol = %symbol, order_id = %order_id, error = %e, "STOP: duplicate cancel failed");
                }
            }
        }

        let has_position = position.map_or(false, |p| p.abs_amt() > Decimal::ZERO);

        // No position (or disabled): a resting stop could fire later and
        // reopen the side. Cancel unconditionally.
        if !enabled || !has_position {
            if let Some(order) = &keep {
                if let Some(order_id) = extract_order_id(order) {
                    match self.gateway.cancel_any(symbol, &order_id).await {
                        Ok(_) => info!(
                            symbol = %symbol,
                            side = %side.as_str(),
                            order_id = %order_id,
                            reason = if has_position { "disabled" } else { "no_position" },
                            "STOP: protective stop cancelled"
                        ),
                        Err(e) => {
                            warn!(symbol = %symbol, order_id = %order_id, error = %e, "STOP: cancel failed")
                        }
                    }
                }
            }
            self.states.lock().await.remove(&(symbol.to_string(), side));
            return Ok(());
        }
        let position = match position {
            Some(p) => p,
            None => return Ok(()),
        };

        // External stop/tp owns the side: cancel our stop and stand down.
        if has_external {
            if let Some(order) = &keep {
                if let Some(order_id) = extract_order_id(order) {
                    match self.gateway.cancel_any(symbol, &order_id).await {
                        Ok(_) => info!(
                            symbol = %symbol,
                            side = %side.as_str(),
                            order_id = %order_id,
                            "STOP: own stop cancelled, external stop takes over"
                        ),
                        Err(e) => {
                            warn!(symbol = %symbol, order_id = %order_id, error = %e, "STOP: cancel failed");
                            return Ok(());
                        }
                    }
                }
            }
            self.states.lock().await.remove(&(symbol.to_string(), side));
            return Ok(());
        }

        // Latched: an external stop was seen on the stream but is not (yet)
        // visible over REST. Hold maintenance to avoid racing the external
        // client; release happens only through a verified sync.
        if latched {
            debug!(
                symbol = %symbol,
                side = %side.as_str(),
                keeping = keep.is_some(),
                "STOP: takeover latch active, maintenance skipped"
            );
            return Ok(());
        }

        let liquidation_price = match position.liquidation_price {
            Some(p) if p > Decimal::ZERO => p,
            _ => {
                debug!(
                    symbol = %symbol,
                    side = %side.as_str(),
                    "STOP: no liquidation price, skip"
                );
                return Ok(());
            }
        };

        let desired =
            Self::compute_stop_price(side, liquidation_price, dist_to_liq, rules.tick_size)?;

        let existing_price =
            keep.as_ref()
                .and_then(extract_stop_price)
                .map(|p| match side {
                    // Normalize float-ish venue prices back onto the grid
                    // before comparing, mirroring our own rounding direction.
                    PositionSide::Long => round_price_up(p, rules.tick_size),
                    PositionSide::Short => round_price_down(p, rules.tick_size),
                });
        let existing_order_id = keep.as_ref().and_then(extract_order_id);
        let existing_cid = keep.as_ref().and_then(extract_client_order_id);

        if let Some(current) = existing_price {
            let tightens = match side {
                PositionSide::Long => desired > current,
                PositionSide::Short => desired < current,
            };
            if !tightens {
                // Replacement is monotone: never widen, never churn on equal.
                self.states.lock().await.insert(
                    (symbol.to_string(), side),
                    StopState {
                        client_order_id: existing_cid.unwrap_or_else(|| {
                            Self::build_client_order_id(symbol, side, now_ms)
                        }),
                        order_id: existing_order_id,
                        stop_price: Some(current),
                    },
                );
                return Ok(());
            }
        }

        // Replace: cancel the old stop first; if that fails, do not place a
        // second one.
        if let Some(order_id) = &existing_order_id {
            if let Err(e) = self.gateway.cancel_any(symbol, order_id).await {
                warn!(symbol = %symbol, order_id = %order_id, error = %e, "STOP: cancel before replace failed");
                return Ok(());
            }
        }

        let cid = Self::build_client_order_id(symbol, side, now_ms);
        let intent = OrderIntent::protective_stop(symbol, side, desired, cid.clone());
        let result = self.gateway.place_order(&intent).await?;
        if !result.success || result.order_id.is_none() {
            warn!(
                symbol = %symbol,
                side = %side.as_str(),
                error = ?result.error_message,
                "STOP: protective stop placement failed"
            );
            return Ok(());
        }

        info!(
            symbol = %symbol,
            side = %side.as_str(),
            order_id = %result.order_id.clone().unwrap_or_default(),
            stop_price = %desired,
            "STOP: protective stop placed"
        );
        self.states.lock().await.insert(
            (symbol.to_string(), side),
            StopState {
                client_order_id: cid,
                order_id: result.order_id,
                stop_price: Some(desired),
            },
        );
        Ok(())
    }

    /// Locally tracked stop price, if any. Diagnostic surface for tests and
    /// status logging; the venue remains the source of truth.
    pub async fn tracked_stop_price(&self, symbol: &str, side: PositionSide) -> Option<Decimal> {
        self.states
            .lock()
            .await
            .get(&(symbol.to_string(), side))
            .and_then(|s| s.stop_price)
    }
}

// ----------------------------------------------------------------------
// Raw order helpers. Binance returns loosely shaped JSON, algo orders use
// different key names than plain orders, and numbers arrive as strings.
// ----------------------------------------------------------------------

/// Merge open orders and algo orders, de-duplicating on order id first and
/// client id second (an order may appear in both listings around the algo
/// service migration).
pub fn merge_order_sources(open_orders: Vec<Value>, algo_orders: Vec<Value>) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(open_orders.len() + algo_orders.len());
    let mut seen_ids: Vec<String> = Vec::new();
    let mut seen_cids: Vec<String> = Vec::new();

    for order in open_orders.into_iter().chain(algo_orders.into_iter()) {
        if !order.is_object() {
            continue;
        }
        if let Some(id) = extract_order_id(&order) {
            if seen_ids.contains(&id) {
                continue;
            }
            seen_ids.push(id);
        } else if let Some(cid) = extract_client_order_id(&order) {
            if seen_cids.contains(&cid) {
                continue;
            }
            seen_cids.push(cid);
        }
        merged.push(order);
    }
    merged
}

pub fn extract_order_id(order: &Value) -> Option<String> {
    for key in ["algoId", "orderId", "id"] {
        match order.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

pub fn extract_client_order_id(order: &Value) -> Option<String> {
    for key in ["clientAlgoId", "clientOrderId"] {
        if let Some(Value::String(s)) = order.get(key) {
            if !s.is_empty() {
                return Some(s.clone());
            }
        }
    }
    None
}

pub fn extract_position_side(order: &Value) -> Option<PositionSide> {
    match order.get("positionSide") {
        Some(Value::String(s)) => PositionSide::parse(s),
        _ => None,
    }
}

pub fn extract_order_type(order: &Value) -> Option<String> {
    for key in ["orderType", "type", "algoType"] {
        if let Some(Value::String(s)) = order.get(key) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_uppercase());
            }
        }
    }
    None
}

pub fn extract_stop_price(order: &Value) -> Option<Decimal> {
    for key in ["triggerPrice", "stopPrice"] {
        let value = match order.get(key) {
            Some(Value::String(s)) => s.parse::<Decimal>().ok(),
            Some(Value::Number(n)) => n.to_string().parse::<Decimal>().ok(),
            _ => None,
        };
        if let Some(p) = value {
            if p > Decimal::ZERO {
                return Some(p);
            }
        }
    }
    None
}

pub fn coerce_bool(value: Option<&Value>) -> Option<bool> {
    match value {
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        Some(Value::Number(n)) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// External takeover trigger: a stop/tp conditional with closePosition=true
/// OR reduceOnly=true and a determinable position side.
pub fn is_external_protective(order: &Value) -> bool {
    let Some(order_type) = extract_order_type(order) else {
        return false;
    };
    if !is_stop_order_type(&order_type) {
        return false;
    }
    if extract_position_side(order).is_none() {
        return false;
    }
    coerce_bool(order.get("closePosition")) == Some(true)
        || coerce_bool(order.get("reduceOnly")) == Some(true)
}

/// A LONG stop below the liquidation price (or a SHORT stop above it) by more
/// than the tolerance can never fire before liquidation does.
pub fn is_wrong_side_stop(side: PositionSide, stop_price: Decimal, liquidation: Decimal) -> bool {
    if liquidation <= Decimal::ZERO {
        return false;
    }
    match side {
        PositionSide::Long => (liquidation - stop_price) / liquidation > WRONG_SIDE_TOLERANCE,
        PositionSide::Short => (stop_price - liquidation) / liquidation > WRONG_SIDE_TOLERANCE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn stop_price_rounds_toward_safety() {
        // LONG: 150 / 0.99 = 151.5151.. -> up to 151.52
        let p = ProtectiveStopManager::<DummyGateway>::compute_stop_price(
            PositionSide::Long,
            dec!(150),
            dec!(0.01),
            dec!(0.01),
        )
        .unwrap();
        assert_eq!(p, dec!(151.52));

        // SHORT: 150 / 1.01 = 148.5148.. -> down to 148.51
        let p = ProtectiveStopManager::<DummyGateway>::compute_stop_price(
            PositionSide::Short,
            dec!(150),
            dec!(0.01),
            dec!(0.01),
        )
        .unwrap();
        assert_eq!(p, dec!(148.51));
    }

    #[test]
    fn stop_price_rejects_degenerate_inputs() {
        assert!(ProtectiveStopManager::<DummyGateway>::compute_stop_price(
            PositionSide::Long,
            Decimal::ZERO,
            dec!(0.01),
            dec!(0.01),
        )
        .is_err());
        assert!(ProtectiveStopManager::<DummyGateway>::compute_stop_price(
            PositionSide::Long,
            dec!(150),
            Decimal::ONE,
            dec!(0.01),
        )
        .is_err());
    }

    #[test]
    fn client_id_has_stable_prefix_and_fits_venue_limit() {
        let cid = ProtectiveStopManager::<DummyGateway>::build_client_order_id(
            "BTCUSDT",
            PositionSide::Long,
            1_700_000_123_456,
        );
        assert!(cid.starts_with("uw-ps-btcusdt-L"));
        assert!(cid.len() <= 36);
        assert!(ProtectiveStopManager::<DummyGateway>::matches_side(
            &cid,
            "BTCUSDT",
            PositionSide::Long
        ));
        assert!(!ProtectiveStopManager::<DummyGateway>::matches_side(
            &cid,
            "BTCUSDT",
            PositionSide::Short
        ));
    }

    #[test]
    fn external_detection_accepts_reduce_only_and_close_position() {
        let cp = json!({
            "orderId": 1, "positionSide": "LONG", "type": "STOP_MARKET",
            "closePosition": true
        });
        let ro = json!({
            "algoId": "7", "positionSide": "LONG", "algoType": "TAKE_PROFIT",
            "reduceOnly": "true"
        });
        let plain_limit = json!({
            "orderId": 2, "positionSide": "LONG", "type": "LIMIT", "reduceOnly": true
        });
        let no_side = json!({
            "orderId": 3, "type": "STOP_MARKET", "closePosition": true
        });
        assert!(is_external_protective(&cp));
        assert!(is_external_protective(&ro));
        assert!(!is_external_protective(&plain_limit));
        assert!(!is_external_protective(&no_side));
    }

    #[test]
    fn wrong_side_detection_uses_relative_tolerance() {
        // LONG stop must sit above liquidation
        assert!(is_wrong_side_stop(PositionSide::Long, dec!(149), dec!(150)));
        assert!(!is_wrong_side_stop(PositionSide::Long, dec!(151), dec!(150)));
        // inside tolerance: 150 * 1e-4 = 0.015
        assert!(!is_wrong_side_stop(
            PositionSide::Long,
            dec!(149.99),
            dec!(150)
        ));
        assert!(is_wrong_side_stop(PositionSide::Short, dec!(151), dec!(150)));
        assert!(!is_wrong_side_stop(PositionSide::Short, dec!(149), dec!(150)));
    }

    #[test]
    fn merge_prefers_order_id_then_client_id() {
        let open = vec![
            json!({"orderId": 11, "clientOrderId": "a"}),
            json!({"clientOrderId": "b"}),
        ];
        let algo = vec![
            json!({"algoId": "11", "clientAlgoId": "a"}), // same id, dropped
            json!({"clientAlgoId": "b"}),                 // same cid, dropped
            json!({"algoId": "12"}),
        ];
        let merged = merge_order_sources(open, algo);
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn stop_price_parses_string_and_number_forms() {
        assert_eq!(
            extract_stop_price(&json!({"stopPrice": "151.52"})),
            Some(dec!(151.52))
        );
        assert_eq!(
            extract_stop_price(&json!({"triggerPrice": 148.51})),
            Some(dec!(148.51))
        );
        assert_eq!(extract_stop_price(&json!({"stopPrice": "0"})), None);
    }

    struct DummyGateway;

    #[async_trait]
    impl OrderGateway for DummyGateway {
        async fn fetch_open_orders_raw(&self, _symbol: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        async fn fetch_open_algo_orders(&self, _symbol: &str) -> Result<Vec<Value>> {
            Ok(vec![])
        }
        async fn place_order(&self, _intent: &OrderIntent) -> Result<OrderResult> {
            Ok(OrderResult::default())
        }
        async fn cancel_any(&self, _symbol: &str, _order_id: &str) -> Result<OrderResult> {
            Ok(OrderResult::default())
        }
    }

    #[tokio::test]
    async fn terminal_update_clears_tracked_state() {
        let mgr = ProtectiveStopManager::new(Arc::new(DummyGateway));
        let cid = ProtectiveStopManager::<DummyGateway>::build_client_order_id(
            "BTCUSDT",
            PositionSide::Long,
            12_345,
        );
        mgr.states.lock().await.insert(
            ("BTCUSDT".to_string(), PositionSide::Long),
            StopState {
                client_order_id: cid.clone(),
                order_id: Some("9".to_string()),
                stop_price: Some(dec!(151.52)),
            },
        );

        mgr.on_order_update(&OrderUpdate {
            symbol: "BTCUSDT".to_string(),
            order_id: "9".to_string(),
            client_order_id: cid,
            side: crate::types::OrderSide::Sell,
            position_side: PositionSide::Long,
            status: OrderStatus::Canceled,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            ts_ms: 0,
            order_type: Some("STOP_MARKET".to_string()),
            close_position: Some(true),
            reduce_only: Some(true),
            is_maker: None,
            realized_pnl: None,
            fee: None,
        })
        .await;

        assert!(mgr
            .tracked_stop_price("BTCUSDT", PositionSide::Long)
            .await
            .is_none());
    }
}
