// Stream events, exit signals, order intents and results.
// These are the only values that cross module boundaries; modules never read
// each other's internal state.

use rust_decimal::Decimal;

use super::core::{OrderSide, OrderStatus, OrderType, PositionSide, SignalReason, Tif};

/// Market-data event, one per websocket message that survived parsing.
#[derive(Clone, Debug)]
pub struct MarketEvent {
    pub symbol: String,
    pub ts_ms: i64,
    pub kind: MarketEventKind,
}

#[derive(Clone, Debug)]
pub enum MarketEventKind {
    /// bookTicker: best bid / best ask snapshot.
    BookTicker { best_bid: Decimal, best_ask: Decimal },
    /// aggTrade: last trade price.
    AggTrade { price: Decimal },
    /// markPriceUpdate: feeds risk only, never refreshes staleness.
    MarkPrice { price: Decimal },
}

/// Order status transition pushed by the user-data stream (ORDER_TRADE_UPDATE).
#[derive(Clone, Debug)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    pub client_order_id: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub ts_ms: i64,
    /// Raw venue order type (LIMIT / STOP_MARKET / TAKE_PROFIT_MARKET / ...).
    pub order_type: Option<String>,
    pub close_position: Option<bool>,
    pub reduce_only: Option<bool>,
    pub is_maker: Option<bool>,
    pub realized_pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
}

/// Conditional-order transition pushed by the user-data stream (ALGO_UPDATE).
/// Status stays a raw string: the algo service has a wider vocabulary
/// (TRIGGERED, FINISHED, ...) than plain orders.
#[derive(Clone, Debug)]
pub struct AlgoOrderUpdate {
    pub symbol: String,
    pub algo_id: String,
    pub client_algo_id: String,
    pub side: OrderSide,
    pub status: String,
    pub ts_ms: i64,
    pub order_type: Option<String>,
    pub position_side: Option<PositionSide>,
    pub close_position: Option<bool>,
    pub reduce_only: Option<bool>,
}

impl AlgoOrderUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "CANCELED" | "FILLED" | "TRIGGERED" | "EXPIRED" | "REJECTED" | "FINISHED"
        )
    }
}

/// Position change from ACCOUNT_UPDATE. Entry price / PnL may be absent; the
/// orchestrator merges the update into its cached `Position`.
#[derive(Clone, Debug)]
pub struct PositionUpdate {
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_amt: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub ts_ms: i64,
}

/// Leverage change from ACCOUNT_CONFIG_UPDATE.
#[derive(Clone, Debug)]
pub struct LeverageUpdate {
    pub symbol: String,
    pub leverage: u32,
    pub ts_ms: i64,
}

/// Exit signal produced by the signal engine. Carries the multipliers; size
/// composition happens in the execution engine.
#[derive(Clone, Debug)]
pub struct ExitSignal {
    pub symbol: String,
    pub position_side: PositionSide,
    pub reason: SignalReason,
    pub ts_ms: i64,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub last_trade_price: Decimal,
    pub roi_mult: u32,
    pub accel_mult: u32,
    pub roi: Option<Decimal>,
    pub ret_window: Option<Decimal>,
}

/// Order intent handed to the REST client. `is_risk` marks rate-limiter
/// bypass and panic/protective priority.
#[derive(Clone, Debug)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: PositionSide,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: Tif,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: Option<String>,
    pub is_risk: bool,
}

impl OrderIntent {
    /// Reduce-only limit order, the normal path out of a position.
    pub fn reduce_limit(
        symbol: &str,
        position_side: PositionSide,
        qty: Decimal,
        price: Decimal,
        time_in_force: Tif,
        is_risk: bool,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: position_side.reduce_side(),
            position_side,
            qty,
            price: Some(price),
            stop_price: None,
            order_type: OrderType::Limit,
            time_in_force,
            reduce_only: true,
            close_position: false,
            client_order_id: None,
            is_risk,
        }
    }

    /// Exchange-resident protective stop: STOP_MARKET closePosition on mark price.
    pub fn protective_stop(
        symbol: &str,
        position_side: PositionSide,
        stop_price: Decimal,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side: position_side.reduce_side(),
            position_side,
            qty: Decimal::ZERO,
            price: None,
            stop_price: Some(stop_price),
            order_type: OrderType::StopMarket,
            time_in_force: Tif::Gtc,
            reduce_only: true,
            close_position: true,
            client_order_id: Some(client_order_id),
            is_risk: true,
        }
    }
}

/// Outcome of a REST submit/cancel. Venue-level rejections are data, not Err.
#[derive(Clone, Debug, Default)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl OrderResult {
    pub fn rejected(code: Option<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(OrderStatus::Rejected),
            error_code: code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_post_only_reject(&self) -> bool {
        self.error_code.as_deref() == Some("-5022")
    }

    pub fn is_duplicate_client_id(&self) -> bool {
        self.error_code.as_deref() == Some("-4015")
    }
}
