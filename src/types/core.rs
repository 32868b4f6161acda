// Core domain types shared by every module.
// All prices and quantities are exact decimals; binary floats never touch order math.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Position side in hedge mode. LONG and SHORT coexist independently on the
/// same instrument; every order and every execution state is keyed by it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "LONG" => Some(PositionSide::Long),
            "SHORT" => Some(PositionSide::Short),
            _ => None,
        }
    }

    /// Order side that reduces this position: closing LONG sells, closing SHORT buys.
    pub fn reduce_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Sell,
            PositionSide::Short => OrderSide::Buy,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "BUY" => Some(OrderSide::Buy),
            "SELL" => Some(OrderSide::Sell),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    StopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }
}

/// Time in force. GTX is Binance post-only: rejected if it would take.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tif {
    Gtc,
    Gtx,
}

impl Tif {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tif::Gtc => "GTC",
            Tif::Gtx => "GTX",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "NEW" => Some(OrderStatus::New),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Canceled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" | "EXPIRED_IN_MATCH" => Some(OrderStatus::Expired),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

/// Per (symbol, side) state machine state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Placing,
    Waiting,
    Canceling,
    Cooldown,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Idle => "IDLE",
            ExecutionState::Placing => "PLACING",
            ExecutionState::Waiting => "WAITING",
            ExecutionState::Canceling => "CANCELING",
            ExecutionState::Cooldown => "COOLDOWN",
        }
    }
}

/// Pricing aggressiveness. Rotation between the two is driven by the timeout
/// and fill counters; the risk supervisor can force AggressiveLimit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    MakerOnly,
    AggressiveLimit,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::MakerOnly => "MAKER_ONLY",
            ExecutionMode::AggressiveLimit => "AGGRESSIVE_LIMIT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalReason {
    LongPrimary,
    LongBidImprove,
    ShortPrimary,
    ShortAskImprove,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::LongPrimary => "long_primary",
            SignalReason::LongBidImprove => "long_bid_improve",
            SignalReason::ShortPrimary => "short_primary",
            SignalReason::ShortAskImprove => "short_ask_improve",
        }
    }
}

/// Hedge-mode position. `position_amt` keeps the venue sign convention
/// (negative for SHORT); use `abs_amt()` for sizing.
#[derive(Clone, Debug)]
pub struct Position {
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub mark_price: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
}

impl Position {
    pub fn abs_amt(&self) -> Decimal {
        self.position_amt.abs()
    }

    /// dist_to_liq = |mark - liquidation| / mark. None while either input is missing.
    pub fn dist_to_liq(&self) -> Option<Decimal> {
        let mark = self.mark_price.filter(|p| *p > Decimal::ZERO)?;
        let liq = self.liquidation_price.filter(|p| *p > Decimal::ZERO)?;
        Some((mark - liq).abs() / mark)
    }
}
