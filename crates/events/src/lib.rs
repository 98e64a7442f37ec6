//! # Aegis Events
//!
//! Defines the structured event taxonomy broadcast from the Engine Runtime to
//! any observability sink (the alerter, a log exporter, a future dashboard).
//!
//! As a Layer 0 crate, it depends only on `core-types` and provides the
//! definitive language for all outbound observability.

pub mod error;
pub mod messages;

pub use error::EventsError;
pub use messages::{
    ActionProposed, ActionRejected, CircuitTransition, EngineEvent, LogLevel, LogMessage,
    OrderFilled, OrderSubmitted, PositionClosed, PositionOpened, ReconcileSummary, Shutdown,
    TickStarted,
};
