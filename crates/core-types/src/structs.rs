use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::{
    CircuitLevel, EngineOwner, InstrumentCategory, OrderSide, OrderStatus, OrderType,
    PositionSide,
};
use crate::error::CoreError;
use crate::money::Money;

/// A trading pair identifier, immutable once created. Constructed only
/// through `Symbol::new`, never assembled field-by-field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol {
    name: String,
    category: InstrumentCategory,
}

impl Symbol {
    pub fn new(name: impl Into<String>, category: InstrumentCategory) -> Result<Self, CoreError> {
        let name = name.into();
        if !name.contains('/') {
            return Err(CoreError::InvalidInput(
                "Symbol".into(),
                format!("`{name}` is missing the base/quote separator"),
            ));
        }
        Ok(Self { name, category })
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> InstrumentCategory {
        self.category
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// `(symbol, side, size ≥ 0, avg_entry_price > 0, engine_owner)`. A Position
/// with `size = 0` MUST NOT exist; callers destroy it instead of storing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub owner: EngineOwner,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl Position {
    /// Notional value at the given mark price, in the symbol's quote asset.
    pub fn notional(&self, mark_price: Decimal) -> Decimal {
        self.size * mark_price
    }

    pub fn is_dust(&self, mark_price: Decimal) -> bool {
        Money::new(self.notional(mark_price)).is_dust()
    }
}

/// `(client_id, venue_id?, symbol, side, kind, qty, ...)`. `client_id` is
/// mandatory and stable; the system tolerates unknown `venue_id` across
/// restarts by reconciling via `client_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Order {
    pub client_id: Uuid,
    pub venue_id: Option<String>,
    pub symbol: String,
    pub owner: EngineOwner,
    pub side: OrderSide,
    pub kind: OrderType,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
    pub reduce_only: bool,
    pub post_only: bool,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

/// An immutable fill record. Fills are appended, never mutated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Fill {
    pub fill_id: Uuid,
    pub client_id: Uuid,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub qty: Decimal,
    pub fee: Decimal,
    pub fee_asset: String,
    pub timestamp: DateTime<Utc>,
}

/// One OHLCV bar, used by TREND's ATR/trend-flip indicator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub symbol: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: DateTime<Utc>,
    pub interval: String,
}

/// `(equity_usd, available_usd, used_margin_usd, peak_equity_usd,
/// realized_pnl_today)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Portfolio {
    pub equity_usd: Decimal,
    pub available_usd: Decimal,
    pub used_margin_usd: Decimal,
    pub peak_equity_usd: Decimal,
    pub realized_pnl_today: Decimal,
    pub snapshot_at: DateTime<Utc>,
}

impl Portfolio {
    /// `1 − equity / peak_equity`. Zero if there is no peak yet.
    pub fn drawdown(&self) -> Decimal {
        if self.peak_equity_usd.is_zero() {
            return Decimal::ZERO;
        }
        Decimal::ONE - (self.equity_usd / self.peak_equity_usd)
    }

    /// Applies a closed-bar equity reading: bumps `peak_equity_usd` if the
    /// new equity is a new high. Call at most once per closed minute bar.
    pub fn observe_closed_bar_equity(&mut self, equity_usd: Decimal, at: DateTime<Utc>) {
        self.equity_usd = equity_usd;
        self.peak_equity_usd = self.peak_equity_usd.max(equity_usd);
        self.snapshot_at = at;
    }
}

/// Four-level circuit breaker state with a `since` timestamp and the
/// drawdown reading that triggered the last transition. Transitions are
/// monotonic in severity until an operator-sanctioned recovery event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CircuitState {
    pub level: CircuitLevel,
    pub since: DateTime<Utc>,
    pub triggering_drawdown: Decimal,
    /// Set permanently by L4; survives restarts; cleared only by the dual
    /// authorized `clear-kill-flag` control surface call.
    pub kill_flag: bool,
}

impl CircuitState {
    pub fn normal(at: DateTime<Utc>) -> Self {
        Self {
            level: CircuitLevel::Normal,
            since: at,
            triggering_drawdown: Decimal::ZERO,
            kill_flag: false,
        }
    }
}

/// `(name, target_allocation ∈ [0,1], enabled, paused_until?, last_tick_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EngineSlot {
    pub owner: EngineOwner,
    pub target_allocation: Decimal,
    pub enabled: bool,
    pub paused_until: Option<DateTime<Utc>>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl EngineSlot {
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        matches!(self.paused_until, Some(until) if until > now)
    }
}

/// Per-(owner, symbol, key) persisted scalar, used chiefly for
/// `last_action_at` idempotency bookkeeping across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StrategyMeta {
    pub owner: EngineOwner,
    pub symbol: String,
    pub key: String,
    pub value: String,
    pub updated_at: DateTime<Utc>,
}

/// A strategy's proposal, not yet validated by the Arbiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub owner: EngineOwner,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: Decimal,
    pub kind: OrderType,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub reduce_only: bool,
    /// Generated at proposal time, not at submission time, and persisted
    /// before the Venue call — the backbone of crash recovery.
    pub client_id: Uuid,
    /// Actions sharing a `group_id` with more than one member form an atomic
    /// leg group (e.g. FUNDING's long-spot/short-perp pair): the Arbiter
    /// either accepts the whole group or rejects it.
    pub group_id: Option<Uuid>,
}

impl ProposedAction {
    pub fn new(
        owner: EngineOwner,
        symbol: impl Into<String>,
        side: OrderSide,
        qty: Decimal,
        kind: OrderType,
    ) -> Self {
        Self {
            owner,
            symbol: symbol.into(),
            side,
            qty,
            kind,
            limit_price: None,
            stop_price: None,
            reduce_only: false,
            client_id: Uuid::new_v4(),
            group_id: None,
        }
    }
}

/// An action the Arbiter has cleared for submission. Carries the approval
/// timestamp so the Executor can log latency from proposal to approval.
#[derive(Debug, Clone, PartialEq)]
pub struct ApprovedAction {
    pub action: ProposedAction,
    pub approved_at: DateTime<Utc>,
}
