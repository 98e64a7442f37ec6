//! # Aegis Strategies Crate
//!
//! The four hosted strategies of spec.md §4.6 (CORE-HODL, TREND, FUNDING,
//! TACTICAL) and the `Strategy` contract the Engine Runtime schedules them
//! through.
//!
//! ## Architectural Principles
//!
//! - **Layer 1 logic, no submission authority:** a strategy proposes
//!   `ProposedAction`s; it never talks to a `Venue` or an `Executor`. `Ctx`
//!   deliberately has no handle to either.
//! - **Own no mutable state outside `StrategyMeta`:** anything a strategy
//!   needs to remember across ticks (`last_purchase_at`, a trailing-stop
//!   level) is read and written through `Ctx`'s `StateStore` handle, scoped
//!   to the strategy's own `EngineOwner`, so restarts lose nothing.
//! - **Extensibility:** the teacher's one-module-per-strategy-plus-factory
//!   layout is unchanged; only the roster of strategies is rebuilt. The
//!   generic technical-indicator families (`MACrossover`, `ProbReversion`,
//!   `MlStrategy`) are retired in favor of the four owners this system
//!   actually hosts, each keyed by `EngineOwner` rather than a `StrategyId`.

pub mod core_hodl;
pub mod error;
pub mod factory;
pub mod funding;
pub mod tactical;
pub mod trend;

pub use core_hodl::CoreHodl;
pub use error::StrategyError;
pub use factory::create_strategies;
pub use funding::Funding;
pub use tactical::{FearIndexSource, Tactical};
pub use trend::Trend as TrendStrategy;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use core_types::{CircuitLevel, EngineOwner, Fill, Kline, Portfolio, Position, ProposedAction};
use database::StateStore;

/// A strategy's declared scheduling contract: either a fixed interval, or
/// "wake me only on an external event" (spec.md §4.2). The scheduler never
/// inspects which; it just re-polls `cadence()` after every `on_tick`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Interval(ChronoDuration),
    EventTriggered,
}

/// A read-only market-data accessor. The one handle `Ctx` grants into the
/// venue's read side; strategies can observe prices, funding, and history
/// but never place or cancel anything — that capability belongs to the
/// Arbiter and `Executor` alone.
#[async_trait]
pub trait MarketView: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> Result<api_client::responses::MarketSnapshot, StrategyError>;
    async fn funding(&self, symbol: &str) -> Result<api_client::responses::FundingInfo, StrategyError>;
    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, StrategyError>;
}

/// Everything a strategy tick is handed: the clock, a read-only market view,
/// the current portfolio snapshot, and a `StateStore` handle scoped to this
/// strategy's own `EngineOwner` for `StrategyMeta` bookkeeping and position
/// lookups. Deliberately carries no `Venue` or `Executor` handle (spec.md
/// §4.6: "Ctx does NOT expose the Venue; only the Arbiter can submit").
pub struct Ctx {
    pub now: DateTime<Utc>,
    pub owner: EngineOwner,
    pub portfolio: Portfolio,
    /// The Arbiter's current circuit level. Strategies that must self-limit
    /// on top of the Arbiter's pre-trade gate (TACTICAL going quiet at
    /// L3/L4, spec.md §4.6 #4) read this rather than guessing from rejected
    /// proposals.
    pub circuit_level: CircuitLevel,
    store: Arc<dyn StateStore>,
    market: Arc<dyn MarketView>,
}

impl Ctx {
    pub fn new(
        now: DateTime<Utc>,
        owner: EngineOwner,
        portfolio: Portfolio,
        circuit_level: CircuitLevel,
        store: Arc<dyn StateStore>,
        market: Arc<dyn MarketView>,
    ) -> Self {
        Self { now, owner, portfolio, circuit_level, store, market }
    }

    pub async fn get_meta(&self, symbol: &str, key: &str) -> Result<Option<String>, StrategyError> {
        Ok(self
            .store
            .get_strategy_meta(self.owner, symbol, key)
            .await?
            .map(|m| m.value))
    }

    pub async fn set_meta(&self, symbol: &str, key: &str, value: &str) -> Result<(), StrategyError> {
        self.store.set_strategy_meta(self.owner, symbol, key, value).await?;
        Ok(())
    }

    /// Only this owner's own open positions — a strategy never sees another
    /// engine's book.
    pub async fn positions(&self) -> Result<Vec<Position>, StrategyError> {
        let owner = self.owner;
        Ok(self
            .store
            .load_all_positions()
            .await?
            .into_iter()
            .filter(|p| p.owner == owner)
            .collect())
    }

    pub async fn market_snapshot(
        &self,
        symbol: &str,
    ) -> Result<api_client::responses::MarketSnapshot, StrategyError> {
        self.market.snapshot(symbol).await
    }

    pub async fn funding(&self, symbol: &str) -> Result<api_client::responses::FundingInfo, StrategyError> {
        self.market.funding(symbol).await
    }

    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Kline>, StrategyError> {
        self.market.klines(symbol, interval, start, end).await
    }
}

/// The contract every hosted strategy implements, generalizing spec.md
/// §4.6's pseudocode block. `&mut self` because trend/trailing-stop state
/// lives in the struct between ticks even though the durable copy is in
/// `StrategyMeta`; in-memory state is a cache, never the source of truth.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn owner(&self) -> EngineOwner;
    fn cadence(&self) -> Cadence;
    fn allocation_weight(&self) -> rust_decimal::Decimal;

    async fn on_tick(&mut self, ctx: &Ctx) -> Result<Vec<ProposedAction>, StrategyError>;

    /// Optional bookkeeping hook; most strategies no-op here since the
    /// Executor already recorded the fill and the position delta.
    async fn on_fill(&mut self, ctx: &Ctx, fill: &Fill) -> Result<(), StrategyError>;

    /// The idempotency window the Arbiter's duplicate-suppression gate
    /// enforces for this (owner, symbol) pair (spec.md §4.3 gate 7).
    fn min_reaction_interval(&self, symbol: &str) -> ChronoDuration;
}
