pub mod enums;
pub mod error;
pub mod money;
pub mod structs;

// Re-export the core types to provide a clean public API.
pub use enums::{
    CircuitLevel, EngineOwner, InstrumentCategory, OrderSide, OrderStatus, OrderType,
    PositionSide,
};
pub use error::CoreError;
pub use money::{Asset, Money, TaggedMoney, DUST_THRESHOLD_USD, STORAGE_SCALE};
pub use structs::{
    ApprovedAction, CircuitState, EngineSlot, Fill, Kline, Order, Portfolio, ProposedAction,
    Position, StrategyMeta, Symbol,
};
