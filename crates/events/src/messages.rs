use chrono::{DateTime, Utc};
use core_types::{CircuitLevel, EngineOwner, Fill, Position};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a log message for structured logging, and of a broadcast
/// `EngineEvent` for sinks (e.g. `alerter`) that filter on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A structured log message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogMessage {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickStarted {
    pub owner: EngineOwner,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposed {
    pub owner: EngineOwner,
    pub symbol: String,
    pub client_id: Uuid,
    pub qty: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRejected {
    pub owner: EngineOwner,
    pub symbol: String,
    pub client_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSubmitted {
    pub owner: EngineOwner,
    pub symbol: String,
    pub client_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderFilled {
    pub owner: EngineOwner,
    pub fill: Fill,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOpened {
    pub position: Position,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosed {
    pub symbol: String,
    pub owner: EngineOwner,
    pub realized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitTransition {
    pub from: CircuitLevel,
    pub to: CircuitLevel,
    pub drawdown: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub imported_positions: u32,
    pub deleted_positions: u32,
    pub imported_orders: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// The structured event taxonomy: one entry per key transition named in
/// `EXTERNAL INTERFACES / Observability`. Produced via an abstract sink
/// (a `tokio::sync::broadcast::Sender<EngineEvent>`); no specific format is
/// mandated by anything that only reads the channel.
///
/// `#[serde(tag = "type", content = "payload")]` serializes each variant to
/// a flat JSON object, e.g. `{"type": "CircuitTransition", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    Log(LogMessage),
    TickStarted(TickStarted),
    ActionProposed(ActionProposed),
    ActionRejected(ActionRejected),
    OrderSubmitted(OrderSubmitted),
    OrderFilled(OrderFilled),
    PositionOpened(PositionOpened),
    PositionClosed(PositionClosed),
    CircuitTransition(CircuitTransition),
    ReconcileSummary(ReconcileSummary),
    Shutdown(Shutdown),
    /// Sent once to a freshly-subscribed sink so it can confirm liveness.
    Connected,
}

impl EngineEvent {
    /// The severity a sink should use to decide whether to alert on this
    /// event. Most variants are informational; circuit transitions and
    /// rejections are the ones worth paging on.
    pub fn level(&self) -> LogLevel {
        match self {
            EngineEvent::Log(m) => m.level,
            EngineEvent::CircuitTransition(t) if t.to > t.from => LogLevel::Warn,
            EngineEvent::ActionRejected(_) => LogLevel::Debug,
            EngineEvent::Shutdown(_) => LogLevel::Warn,
            _ => LogLevel::Info,
        }
    }
}
