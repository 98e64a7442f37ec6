//! # Aegis Engine Crate
//!
//! The Engine Runtime of spec.md §4.6: the single cooperative dispatcher that
//! owns the `Scheduler`, the four hosted strategies, the `RiskArbiter`, the
//! `Executor`, and the `Venue` subscription stream, and wires them into one
//! run loop.
//!
//! ## Architectural Principles
//!
//! - **Cooperative, not parallel:** only one strategy is ever mid-tick at a
//!   time; the underlying tokio runtime may be multi-threaded, but nothing
//!   here relies on that for correctness. Generalizes the teacher's
//!   single-symbol, kline-driven `Engine`/`Bot` model (one strategy per
//!   symbol, woken only by inbound klines) into the owner-keyed, min-heap
//!   cadence scheduler of spec.md §4.2 — TREND is the only hosted strategy
//!   that is itself kline-driven; the other three run on fixed intervals or
//!   are event-triggered.
//! - **Reconcile before anything else:** `run` calls `Reconciler::reconcile`
//!   once before the first tick; a persisted kill flag refuses to proceed
//!   past that point even though reconciliation itself has already brought
//!   state current.
//! - **Arbiter in the critical path, always:** every `ProposedAction` a
//!   strategy returns crosses `RiskArbiter::approve` under that symbol's
//!   per-symbol lock before it ever reaches the `Executor`.

pub mod error;
pub mod market_view;
pub mod reconciler;
pub mod scheduler;

pub use error::EngineError;
pub use market_view::VenueMarketView;
pub use reconciler::Reconciler;
pub use scheduler::Scheduler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use api_client::responses::VenueEvent;
use api_client::Venue;
use chrono::{Duration as ChronoDuration, Utc};
use configuration::{Config, EngineConfig};
use core_types::{CircuitLevel, EngineOwner, Fill, OrderSide, Portfolio, ProposedAction};
use database::StateStore;
use events::messages::{ActionProposed, ActionRejected, Shutdown, TickStarted};
use events::EngineEvent as Evt;
use executor::{Executor, VenueExecutor};
use risk::RiskArbiter;
use rust_decimal::Decimal;
use strategies::{Cadence, Ctx, FearIndexSource, Strategy};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A strategy tick that runs past this gets its next cadence delayed by the
/// overrun (spec.md §5's soft budget).
const SOFT_TICK_BUDGET: ChronoDuration = ChronoDuration::seconds(30);
/// A strategy tick that runs past this is aborted outright and logged as an
/// error (spec.md §5's hard budget).
const HARD_TICK_BUDGET: StdDuration = StdDuration::from_secs(120);
/// Cadence of the background maintenance sweep: drawdown/daily-loss-cap
/// re-evaluation, correlation price observation, and the UTC-midnight daily
/// reset check (spec.md §4.6: "run at least once per minute").
const MAINTENANCE_INTERVAL: StdDuration = StdDuration::from_secs(60);
/// How long the loop waits idle when the scheduler holds no due slot; just a
/// backstop so `run` always has something to select on.
const IDLE_POLL: StdDuration = StdDuration::from_secs(3600);

/// A read-only snapshot for the control surface's `status` call (spec.md
/// §6.2). Constructed without a `Venue`/`Executor`: a status read only needs
/// the durable store and the circuit state restored from it.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub circuit_level: CircuitLevel,
    pub kill_flag: bool,
    pub equity_usd: Decimal,
    pub drawdown: Decimal,
}

/// The live Engine Runtime: scheduler, risk arbiter, executor, and venue
/// subscription wired into one cooperative loop.
pub struct EngineRuntime {
    config: Config,
    venue: Arc<dyn Venue>,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn Executor>,
    arbiter: Arc<RiskArbiter>,
    events: broadcast::Sender<Evt>,
    market: Arc<VenueMarketView>,
    strategies: HashMap<EngineOwner, Box<dyn Strategy>>,
    scheduler: Scheduler,
    shutdown: Arc<AtomicBool>,
}

impl EngineRuntime {
    pub async fn new(
        config: Config,
        venue: Arc<dyn Venue>,
        store: Arc<dyn StateStore>,
        events: broadcast::Sender<Evt>,
        fear_index: Option<Box<dyn FearIndexSource>>,
    ) -> Result<Self, EngineError> {
        let executor: Arc<dyn Executor> =
            Arc::new(VenueExecutor::new(venue.clone(), store.clone(), events.clone()));
        let arbiter = Arc::new(RiskArbiter::new(config.clone(), store.clone(), events.clone()).await?);
        let market = Arc::new(VenueMarketView::new(venue.clone()));

        let roster = strategies::create_strategies(&config, fear_index)?;
        let strategies = roster.into_iter().map(|s| (s.owner(), s)).collect();
        let scheduler = Scheduler::new(EngineOwner::ALL, Utc::now());

        Ok(Self {
            config,
            venue,
            store,
            executor,
            arbiter,
            events,
            market,
            strategies,
            scheduler,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A clonable flag the CLI's signal handler sets to request a graceful
    /// shutdown at the next loop suspension point. In-flight single actions
    /// finish; an atomic group mid-submission is allowed to complete its
    /// rollback path rather than being torn down mid-leg.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Runs the eight-step startup reconciliation, then the cooperative loop
    /// until `shutdown_handle()` is set. Returns `Err(EngineError::KillFlagSet)`
    /// without ticking any strategy if a kill flag survived from a prior L4
    /// trip; the store is still left fully reconciled and query-able.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let reconciler = Reconciler::new(
            self.venue.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.arbiter.clone(),
            self.events.clone(),
            self.config.symbol_owners.clone(),
            self.config.dust_threshold_usd,
        );
        let summary = reconciler.reconcile().await?;
        tracing::info!(
            imported_positions = summary.imported_positions,
            deleted_positions = summary.deleted_positions,
            imported_orders = summary.imported_orders,
            "startup reconciliation complete"
        );

        let portfolio = self.current_portfolio().await?;
        self.arbiter.reset_daily_equity(portfolio.equity_usd).await;
        let mut last_daily_reset = Utc::now().date_naive();

        let mut venue_events = self.venue.subscribe().map_err(EngineError::Venue)?;
        let mut pending_fills: HashMap<Uuid, (String, OrderSide, Decimal)> = HashMap::new();
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let sleep = match self.scheduler.next_due() {
                Some(due) => (due - Utc::now()).to_std().unwrap_or(StdDuration::from_millis(0)),
                None => IDLE_POLL,
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {
                    self.drain_due_ticks(&mut pending_fills).await?;
                }
                Some(event) = venue_events.recv() => {
                    self.handle_venue_event(event, &mut pending_fills).await;
                }
                _ = maintenance.tick() => {
                    self.run_maintenance(&mut last_daily_reset).await?;
                }
            }
        }

        let _ = self.events.send(Evt::Shutdown(Shutdown {
            reason: "graceful shutdown requested".to_string(),
            at: Utc::now(),
        }));
        Ok(())
    }

    async fn current_portfolio(&self) -> Result<Portfolio, EngineError> {
        Ok(self.store.get_portfolio_snapshot().await?.unwrap_or_else(|| Portfolio {
            equity_usd: Decimal::ZERO,
            available_usd: Decimal::ZERO,
            used_margin_usd: Decimal::ZERO,
            peak_equity_usd: Decimal::ZERO,
            realized_pnl_today: Decimal::ZERO,
            snapshot_at: Utc::now(),
        }))
    }

    /// Pops every currently-due slot (in practice at most one per wakeup;
    /// the scheduler never has two owners due at the same instant by
    /// construction) and ticks each in turn.
    async fn drain_due_ticks(
        &mut self,
        pending_fills: &mut HashMap<Uuid, (String, OrderSide, Decimal)>,
    ) -> Result<(), EngineError> {
        loop {
            let now = Utc::now();
            let cadence_of = |owner: EngineOwner| -> Cadence {
                self.strategies.get(&owner).map(|s| s.cadence()).unwrap_or(Cadence::EventTriggered)
            };
            let Some(owner) = self.scheduler.pop_due(now, cadence_of) else {
                break;
            };
            self.tick_owner(owner, pending_fills).await?;
        }
        Ok(())
    }

    async fn tick_owner(
        &mut self,
        owner: EngineOwner,
        pending_fills: &mut HashMap<Uuid, (String, OrderSide, Decimal)>,
    ) -> Result<(), EngineError> {
        let engine_config = self.config.engines.get(owner).clone();
        if !engine_config.enabled {
            tracing::debug!(%owner, "engine slot disabled; skipping tick");
            return Ok(());
        }

        let started = std::time::Instant::now();
        let now = Utc::now();
        let _ = self.events.send(Evt::TickStarted(TickStarted { owner, at: now }));

        let portfolio = self.current_portfolio().await?;
        let circuit_level = self.arbiter.circuit_level().await;
        let ctx = Ctx::new(now, owner, portfolio.clone(), circuit_level, self.store.clone(), self.market.clone());

        let tick_result = {
            let strategy = self.strategies.get_mut(&owner).expect("owner drawn from the closed roster");
            tokio::time::timeout(HARD_TICK_BUDGET, strategy.on_tick(&ctx)).await
        };

        let actions = match tick_result {
            Ok(Ok(actions)) => actions,
            Ok(Err(e)) => {
                tracing::error!(%owner, error = %e, "strategy tick failed");
                return Ok(());
            }
            Err(_) => {
                tracing::error!(%owner, "strategy tick exceeded the hard wall-clock budget; aborted");
                return Ok(());
            }
        };

        for action in &actions {
            let _ = self.events.send(Evt::ActionProposed(ActionProposed {
                owner: action.owner,
                symbol: action.symbol.clone(),
                client_id: action.client_id,
                qty: action.qty,
            }));
        }

        self.dispatch_actions(actions, &engine_config, &portfolio, owner, pending_fills).await;

        let elapsed = ChronoDuration::from_std(started.elapsed()).unwrap_or_else(|_| ChronoDuration::zero());
        if elapsed > SOFT_TICK_BUDGET {
            let overrun = elapsed - SOFT_TICK_BUDGET;
            tracing::warn!(%owner, overrun_secs = overrun.num_seconds(), "tick exceeded the soft wall-clock budget; next cadence delayed");
            self.scheduler.delay(owner, overrun);
        }

        Ok(())
    }

    fn min_reaction_interval_for(&self, owner: EngineOwner, symbol: &str) -> ChronoDuration {
        self.strategies
            .get(&owner)
            .map(|s| s.min_reaction_interval(symbol))
            .unwrap_or_else(|| ChronoDuration::hours(1))
    }

    async fn dispatch_actions(
        &self,
        actions: Vec<ProposedAction>,
        engine_config: &EngineConfig,
        portfolio: &Portfolio,
        owner: EngineOwner,
        pending_fills: &mut HashMap<Uuid, (String, OrderSide, Decimal)>,
    ) {
        let mut singles = Vec::new();
        let mut groups: HashMap<Uuid, Vec<ProposedAction>> = HashMap::new();
        for action in actions {
            match action.group_id {
                Some(gid) => groups.entry(gid).or_default().push(action),
                None => singles.push(action),
            }
        }

        for action in singles {
            self.dispatch_single(action, engine_config, portfolio, owner, pending_fills).await;
        }
        for (_, legs) in groups {
            self.dispatch_group(legs, engine_config, portfolio, owner, pending_fills).await;
        }
    }

    async fn dispatch_single(
        &self,
        action: ProposedAction,
        engine_config: &EngineConfig,
        portfolio: &Portfolio,
        owner: EngineOwner,
        pending_fills: &mut HashMap<Uuid, (String, OrderSide, Decimal)>,
    ) {
        let _guard = self.arbiter.lock_symbol(&action.symbol).await;
        let min_reaction_interval = self.min_reaction_interval_for(owner, &action.symbol);
        let mark_price = match self.market.snapshot(&action.symbol).await {
            Ok(s) => s.mark,
            Err(e) => {
                tracing::error!(symbol = %action.symbol, error = %e, "failed to fetch mark price; skipping action");
                return;
            }
        };

        let client_id = action.client_id;
        let symbol = action.symbol.clone();
        let side = action.side;
        match self.arbiter.approve(action, engine_config, portfolio, mark_price, min_reaction_interval).await {
            Ok(approved) => {
                pending_fills.insert(client_id, (symbol.clone(), side, Decimal::ZERO));
                if let Err(e) = self.executor.submit(&approved).await {
                    tracing::error!(%owner, symbol = %symbol, error = %e, "failed to submit approved action");
                }
            }
            Err(e) => self.reject_single(owner, symbol, client_id, e),
        }
    }

    async fn dispatch_group(
        &self,
        legs: Vec<ProposedAction>,
        engine_config: &EngineConfig,
        portfolio: &Portfolio,
        owner: EngineOwner,
        pending_fills: &mut HashMap<Uuid, (String, OrderSide, Decimal)>,
    ) {
        let mut symbols: Vec<String> = legs.iter().map(|l| l.symbol.clone()).collect();
        symbols.sort();
        symbols.dedup();
        // Locks are acquired in sorted symbol order across every group so two
        // concurrent groups sharing a pair of symbols can never deadlock on
        // each other's locks.
        let mut guards = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            guards.push(self.arbiter.lock_symbol(symbol).await);
        }

        let mut approved_legs = Vec::with_capacity(legs.len());
        for action in &legs {
            let min_reaction_interval = self.min_reaction_interval_for(owner, &action.symbol);
            let mark_price = match self.market.snapshot(&action.symbol).await {
                Ok(s) => s.mark,
                Err(e) => {
                    tracing::error!(symbol = %action.symbol, error = %e, "failed to price a leg; rejecting whole atomic group");
                    self.reject_group(&legs, owner, "failed to fetch mark price for a leg");
                    return;
                }
            };
            match self.arbiter.approve(action.clone(), engine_config, portfolio, mark_price, min_reaction_interval).await {
                Ok(approved) => approved_legs.push(approved),
                Err(e) => {
                    tracing::warn!(%owner, reason = %e, "atomic action group rejected: a leg failed the risk gate");
                    self.reject_group(&legs, owner, &e.to_string());
                    return;
                }
            }
        }

        for approved in &approved_legs {
            pending_fills.insert(
                approved.action.client_id,
                (approved.action.symbol.clone(), approved.action.side, Decimal::ZERO),
            );
        }

        drop(guards);
        if let Err(e) = self.executor.submit_group(&approved_legs).await {
            tracing::error!(%owner, error = %e, "failed to submit atomic action group");
        }
    }

    fn reject_single(&self, owner: EngineOwner, symbol: String, client_id: Uuid, err: risk::RiskError) {
        let reason = err.to_string();
        if reason.to_lowercase().contains("duplicate") {
            tracing::debug!(%owner, symbol = %symbol, "action suppressed: duplicate within reaction interval");
        } else {
            tracing::warn!(%owner, symbol = %symbol, reason = %reason, "action rejected by risk arbiter");
        }
        let _ = self.events.send(Evt::ActionRejected(ActionRejected { owner, symbol, client_id, reason }));
    }

    fn reject_group(&self, legs: &[ProposedAction], owner: EngineOwner, reason: &str) {
        for leg in legs {
            let _ = self.events.send(Evt::ActionRejected(ActionRejected {
                owner,
                symbol: leg.symbol.clone(),
                client_id: leg.client_id,
                reason: reason.to_string(),
            }));
        }
    }

    /// Translates the venue's user-data stream into `Executor::handle_fill`
    /// calls. `OrderUpdate.filled_qty` is cumulative, not a per-event delta,
    /// so `pending_fills` tracks the last-seen cumulative quantity per
    /// `client_id` (seeded when the order is submitted) to recover the
    /// delta this tick actually filled.
    async fn handle_venue_event(
        &self,
        event: VenueEvent,
        pending_fills: &mut HashMap<Uuid, (String, OrderSide, Decimal)>,
    ) {
        match event {
            VenueEvent::OrderUpdate { client_id: Some(client_id), status, filled_qty, avg_fill_price, .. } => {
                let Some((symbol, side, last_filled)) = pending_fills.get(&client_id).cloned() else {
                    return;
                };
                let delta = filled_qty - last_filled;
                if delta > Decimal::ZERO {
                    if let Some(owner) = self.order_owner(client_id).await {
                        let fill = Fill {
                            fill_id: Uuid::new_v4(),
                            client_id,
                            symbol: symbol.clone(),
                            side,
                            price: avg_fill_price,
                            qty: delta,
                            fee: Decimal::ZERO,
                            fee_asset: String::new(),
                            timestamp: Utc::now(),
                        };
                        if let Err(e) = self.executor.handle_fill(fill, owner).await {
                            tracing::error!(%client_id, error = %e, "failed to apply venue fill");
                        }
                    }
                }
                if is_terminal_status(&status) {
                    pending_fills.remove(&client_id);
                } else {
                    pending_fills.insert(client_id, (symbol, side, filled_qty));
                }
            }
            VenueEvent::Disconnect => {
                tracing::warn!("venue subscription stream disconnected; the next reconciliation sweep will catch up");
            }
            // Foreign orders (no client_id) and read-side position/balance
            // pushes are informational; the periodic reconciliation sweep,
            // not this stream, is the source of truth for state this
            // engine doesn't itself own.
            VenueEvent::OrderUpdate { client_id: None, .. }
            | VenueEvent::PositionUpdate { .. }
            | VenueEvent::BalanceUpdate { .. } => {}
        }
    }

    async fn order_owner(&self, client_id: Uuid) -> Option<EngineOwner> {
        self.store
            .load_open_orders()
            .await
            .ok()?
            .into_iter()
            .find(|o| o.client_id == client_id)
            .map(|o| o.owner)
    }

    /// Background maintenance (spec.md §4.6): re-evaluates drawdown and the
    /// daily loss cap, feeds the correlation window a closed-bar price per
    /// tracked symbol, and resets the UTC-day equity baseline at rollover.
    async fn run_maintenance(&self, last_daily_reset: &mut chrono::NaiveDate) -> Result<(), EngineError> {
        let Some(portfolio) = self.store.get_portfolio_snapshot().await? else {
            return Ok(());
        };

        self.arbiter.evaluate_drawdown(&portfolio).await?;
        self.arbiter.check_daily_loss_cap(&portfolio).await?;

        for symbol in self.config.symbol_owners.keys() {
            if let Ok(snapshot) = self.market.snapshot(symbol).await {
                self.arbiter.observe_price(symbol, Utc::now(), snapshot.mark).await;
            }
        }

        let today = Utc::now().date_naive();
        if today != *last_daily_reset && Utc::now().time() >= self.config.daily_reset_utc {
            self.arbiter.reset_daily_equity(portfolio.equity_usd).await;
            let mut reset_portfolio = portfolio.clone();
            reset_portfolio.realized_pnl_today = Decimal::ZERO;
            self.store.set_portfolio_snapshot(&reset_portfolio).await?;
            *last_daily_reset = today;
            tracing::info!("daily equity baseline and realized P&L reset at UTC rollover");
        }

        Ok(())
    }

    /// The control surface's `status` call (spec.md §6.2). Does not require
    /// a `Venue`/`Executor`: a status read only needs the durable store and
    /// the circuit state restored from it.
    pub async fn status(
        store: Arc<dyn StateStore>,
        config: Config,
        events: broadcast::Sender<Evt>,
    ) -> Result<StatusReport, EngineError> {
        let arbiter = RiskArbiter::new(config, store.clone(), events).await?;
        let portfolio = store.get_portfolio_snapshot().await?.unwrap_or_else(|| Portfolio {
            equity_usd: Decimal::ZERO,
            available_usd: Decimal::ZERO,
            used_margin_usd: Decimal::ZERO,
            peak_equity_usd: Decimal::ZERO,
            realized_pnl_today: Decimal::ZERO,
            snapshot_at: Utc::now(),
        });
        Ok(StatusReport {
            circuit_level: arbiter.circuit_level().await,
            kill_flag: arbiter.kill_flag().await,
            equity_usd: portfolio.equity_usd,
            drawdown: portfolio.drawdown(),
        })
    }

    /// The control surface's `ack-recovery(level)` call.
    pub async fn ack_recovery(
        store: Arc<dyn StateStore>,
        config: Config,
        events: broadcast::Sender<Evt>,
        target_level: CircuitLevel,
    ) -> Result<(), EngineError> {
        let arbiter = RiskArbiter::new(config, store.clone(), events).await?;
        let portfolio = store
            .get_portfolio_snapshot()
            .await?
            .ok_or_else(|| EngineError::StateStoreUnavailable("no portfolio snapshot recorded yet".into()))?;
        arbiter.acknowledge_recovery(target_level, &portfolio).await?;
        Ok(())
    }

    /// The control surface's `clear-kill-flag` call, the only way out of L4.
    pub async fn clear_kill_flag(
        store: Arc<dyn StateStore>,
        config: Config,
        events: broadcast::Sender<Evt>,
    ) -> Result<(), EngineError> {
        let arbiter = RiskArbiter::new(config, store, events).await?;
        arbiter.clear_kill_flag().await?;
        Ok(())
    }
}

fn is_terminal_status(status: &str) -> bool {
    matches!(status, "FILLED" | "CANCELED" | "CANCELLED" | "REJECTED" | "EXPIRED")
}
