pub mod core;
pub mod events;

pub use core::{
    ExecutionMode, ExecutionState, OrderSide, OrderStatus, OrderType, Position, PositionSide,
    SignalReason, Tif,
};
pub use events::{
    AlgoOrderUpdate, ExitSignal, LeverageUpdate, MarketEvent, MarketEventKind, OrderIntent,
    OrderResult, OrderUpdate, PositionUpdate,
};
