// Protective stop maintenance against a mock exchange: monotone tightening,
// external takeover, invalid external stops and zero-position cleanup.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use unwind_bot::protective_stop::{OrderGateway, ProtectiveStopManager};
use unwind_bot::rules::InstrumentRules;
use unwind_bot::types::{OrderIntent, OrderResult, OrderStatus, Position, PositionSide};

#[derive(Default)]
struct MockGateway {
    open_orders: Mutex<Vec<Value>>,
    algo_orders: Mutex<Vec<Value>>,
    placed: Mutex<Vec<OrderIntent>>,
    cancelled: Mutex<Vec<String>>,
    next_order_id: Mutex<u64>,
}

impl MockGateway {
    async fn set_open_orders(&self, orders: Vec<Value>) {
        *self.open_orders.lock().await = orders;
    }

    async fn placed_intents(&self) -> Vec<OrderIntent> {
        self.placed.lock().await.clone()
    }

    async fn cancelled_ids(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }
}

#[async_trait]
impl OrderGateway for MockGateway {
    async fn fetch_open_orders_raw(&self, _symbol: &str) -> Result<Vec<Value>> {
        Ok(self.open_orders.lock().await.clone())
    }

    async fn fetch_open_algo_orders(&self, _symbol: &str) -> Result<Vec<Value>> {
        Ok(self.algo_orders.lock().await.clone())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        self.placed.lock().await.push(intent.clone());
        let mut next = self.next_order_id.lock().await;
        *next += 1;
        Ok(OrderResult {
            success: true,
            order_id: Some(next.to_string()),
            client_order_id: intent.client_order_id.clone(),
            status: Some(OrderStatus::New),
            ..OrderResult::default()
        })
    }

    async fn cancel_any(&self, _symbol: &str, order_id: &str) -> Result<OrderResult> {
        self.cancelled.lock().await.push(order_id.to_string());
        Ok(OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            status: Some(OrderStatus::Canceled),
            ..OrderResult::default()
        })
    }
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

fn long_position(liquidation: Decimal) -> HashMap<PositionSide, Position> {
    let mut map = HashMap::new();
    map.insert(
        PositionSide::Long,
        Position {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            position_amt: dec!(1.0),
            entry_price: dec!(200),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            mark_price: Some(dec!(190)),
            liquidation_price: Some(liquidation),
        },
    );
    map
}

fn no_latch() -> HashMap<PositionSide, bool> {
    let mut map = HashMap::new();
    map.insert(PositionSide::Long, false);
    map.insert(PositionSide::Short, false);
    map
}

fn own_stop_order(order_id: &str, cid: &str, stop_price: &str) -> Value {
    json!({
        "orderId": order_id,
        "clientOrderId": cid,
        "positionSide": "LONG",
        "type": "STOP_MARKET",
        "closePosition": true,
        "reduceOnly": true,
        "stopPrice": stop_price,
        "workingType": "MARK_PRICE"
    })
}

#[tokio::test]
async fn initial_stop_placed_from_liquidation_price() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());

    let external = mgr
        .sync_symbol(
            "BTCUSDT",
            &rules(),
            &long_position(dec!(150)),
            true,
            dec!(0.01),
            &no_latch(),
            1_000,
        )
        .await
        .unwrap();

    assert_eq!(external.get(&PositionSide::Long), Some(&false));
    let placed = gateway.placed_intents().await;
    assert_eq!(placed.len(), 1);
    let intent = &placed[0];
    // 150 / 0.99 = 151.5151.. rounded up to the grid
    assert_eq!(intent.stop_price, Some(dec!(151.52)));
    assert!(intent.close_position);
    assert!(intent.reduce_only);
    assert!(intent
        .client_order_id
        .as_deref()
        .unwrap()
        .starts_with("uw-ps-btcusdt-L"));
}

#[tokio::test]
async fn replacement_is_monotone_tightening_only() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());
    let cid = ProtectiveStopManager::<MockGateway>::build_client_order_id(
        "BTCUSDT",
        PositionSide::Long,
        1_000,
    );

    // Own stop resting at 151.52; liquidation moved up to 152 -> candidate
    // 153.54 is strictly safer -> replace.
    gateway
        .set_open_orders(vec![own_stop_order("10", &cid, "151.52")])
        .await;
    mgr.sync_symbol(
        "BTCUSDT",
        &rules(),
        &long_position(dec!(152)),
        true,
        dec!(0.01),
        &no_latch(),
        2_000,
    )
    .await
    .unwrap();
    assert_eq!(gateway.cancelled_ids().await, vec!["10".to_string()]);
    let placed = gateway.placed_intents().await;
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].stop_price, Some(dec!(153.54)));

    // Stop now at 153.54; liquidation falls back to 150 -> candidate 151.52
    // would widen the stop -> no replacement.
    gateway
        .set_open_orders(vec![own_stop_order("11", &cid, "153.54")])
        .await;
    mgr.sync_symbol(
        "BTCUSDT",
        &rules(),
        &long_position(dec!(150)),
        true,
        dec!(0.01),
        &no_latch(),
        3_000,
    )
    .await
    .unwrap();
    assert_eq!(gateway.cancelled_ids().await.len(), 1, "no second cancel");
    assert_eq!(gateway.placed_intents().await.len(), 1, "no second placement");
    assert_eq!(
        mgr.tracked_stop_price("BTCUSDT", PositionSide::Long).await,
        Some(dec!(153.54))
    );
}

#[tokio::test]
async fn equal_stop_price_causes_no_churn() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());
    let cid = ProtectiveStopManager::<MockGateway>::build_client_order_id(
        "BTCUSDT",
        PositionSide::Long,
        1_000,
    );
    gateway
        .set_open_orders(vec![own_stop_order("10", &cid, "151.52")])
        .await;
    mgr.sync_symbol(
        "BTCUSDT",
        &rules(),
        &long_position(dec!(150)),
        true,
        dec!(0.01),
        &no_latch(),
        2_000,
    )
    .await
    .unwrap();
    assert!(gateway.cancelled_ids().await.is_empty());
    assert!(gateway.placed_intents().await.is_empty());
}

#[tokio::test]
async fn external_reduce_only_stop_takes_over() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());
    let cid = ProtectiveStopManager::<MockGateway>::build_client_order_id(
        "BTCUSDT",
        PositionSide::Long,
        1_000,
    );

    // Our stop plus a manual reduce-only stop on the same side.
    gateway
        .set_open_orders(vec![
            own_stop_order("10", &cid, "151.52"),
            json!({
                "orderId": "77",
                "clientOrderId": "manual-1",
                "positionSide": "LONG",
                "type": "STOP_MARKET",
                "reduceOnly": true,
                "stopPrice": "155.00"
            }),
        ])
        .await;

    let external = mgr
        .sync_symbol(
            "BTCUSDT",
            &rules(),
            &long_position(dec!(150)),
            true,
            dec!(0.01),
            &no_latch(),
            2_000,
        )
        .await
        .unwrap();

    assert_eq!(external.get(&PositionSide::Long), Some(&true));
    // our own stop was cancelled, nothing new placed
    assert_eq!(gateway.cancelled_ids().await, vec!["10".to_string()]);
    assert!(gateway.placed_intents().await.is_empty());
}

#[tokio::test]
async fn latch_blocks_rearm_until_rest_verified_clear() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());

    // Latch held (external seen on the stream), REST shows nothing yet:
    // maintenance must not re-arm.
    let mut latch = no_latch();
    latch.insert(PositionSide::Long, true);
    let external = mgr
        .sync_symbol(
            "BTCUSDT",
            &rules(),
            &long_position(dec!(150)),
            true,
            dec!(0.01),
            &latch,
            2_000,
        )
        .await
        .unwrap();
    assert_eq!(external.get(&PositionSide::Long), Some(&false));
    assert!(gateway.placed_intents().await.is_empty());

    // Latch released after the verified pass: the stop is re-armed.
    let external = mgr
        .sync_symbol(
            "BTCUSDT",
            &rules(),
            &long_position(dec!(150)),
            true,
            dec!(0.01),
            &no_latch(),
            3_000,
        )
        .await
        .unwrap();
    assert_eq!(external.get(&PositionSide::Long), Some(&false));
    assert_eq!(gateway.placed_intents().await.len(), 1);
}

#[tokio::test]
async fn invalid_external_stop_is_cancelled_and_taken_over() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());

    // External LONG stop below the liquidation price: can never protect.
    gateway
        .set_open_orders(vec![json!({
            "orderId": "88",
            "clientOrderId": "manual-bad",
            "positionSide": "LONG",
            "type": "STOP_MARKET",
            "closePosition": true,
            "stopPrice": "140.00"
        })])
        .await;

    let external = mgr
        .sync_symbol(
            "BTCUSDT",
            &rules(),
            &long_position(dec!(150)),
            true,
            dec!(0.01),
            &no_latch(),
            2_000,
        )
        .await
        .unwrap();

    // invalid external cancelled, not treated as a takeover, own stop placed
    assert_eq!(external.get(&PositionSide::Long), Some(&false));
    assert!(gateway.cancelled_ids().await.contains(&"88".to_string()));
    assert_eq!(gateway.placed_intents().await.len(), 1);
}

#[tokio::test]
async fn zero_position_cancels_own_stop() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());
    let cid = ProtectiveStopManager::<MockGateway>::build_client_order_id(
        "BTCUSDT",
        PositionSide::Long,
        1_000,
    );
    gateway
        .set_open_orders(vec![own_stop_order("10", &cid, "151.52")])
        .await;

    mgr.sync_symbol(
        "BTCUSDT",
        &rules(),
        &HashMap::new(),
        true,
        dec!(0.01),
        &no_latch(),
        2_000,
    )
    .await
    .unwrap();

    assert_eq!(gateway.cancelled_ids().await, vec!["10".to_string()]);
    assert!(gateway.placed_intents().await.is_empty());
}

#[tokio::test]
async fn duplicate_own_stops_are_pruned_to_one() {
    let gateway = Arc::new(MockGateway::default());
    let mgr = ProtectiveStopManager::new(gateway.clone());
    let cid_a = ProtectiveStopManager::<MockGateway>::build_client_order_id(
        "BTCUSDT",
        PositionSide::Long,
        1_000,
    );
    let cid_b = ProtectiveStopManager::<MockGateway>::build_client_order_id(
        "BTCUSDT",
        PositionSide::Long,
        2_000,
    );
    gateway
        .set_open_orders(vec![
            own_stop_order("10", &cid_a, "151.52"),
            own_stop_order("11", &cid_b, "151.00"),
        ])
        .await;

    mgr.sync_symbol(
        "BTCUSDT",
        &rules(),
        &long_position(dec!(150)),
        true,
        dec!(0.01),
        &no_latch(),
        3_000,
    )
    .await
    .unwrap();

    // the duplicate is cancelled; the kept one already matches the target
    assert_eq!(gateway.cancelled_ids().await, vec!["11".to_string()]);
    assert!(gateway.placed_intents().await.is_empty());
}
