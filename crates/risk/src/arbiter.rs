use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use configuration::{Config, EngineConfig};
use core_types::{ApprovedAction, CircuitLevel, CircuitState, EngineOwner, Portfolio, ProposedAction};
use database::StateStore;
use events::messages::CircuitTransition;
use events::EngineEvent;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::correlation::PriceHistory;
use crate::error::RiskError;

/// The single pre-trade gate and background drawdown monitor. Owns the
/// four-level circuit breaker; the only component permitted to halt the
/// engine (spec.md §2).
///
/// Combines a fixed-fractional sizing gate with a global drawdown halt and
/// per-owner loss-streak cooldown into the seven-gate chain and tiered
/// circuit-breaker matrix of spec.md §4.3.
pub struct RiskArbiter {
    config: Config,
    store: Arc<dyn StateStore>,
    events: broadcast::Sender<EngineEvent>,
    circuit: Mutex<CircuitState>,
    prices: Mutex<PriceHistory>,
    symbol_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    daily_start_equity: Mutex<Decimal>,
}

impl RiskArbiter {
    /// Restores circuit state from the durable store (or starts `Normal` on
    /// a fresh install) so the kill flag survives restarts per spec.md §8
    /// invariant 9.
    pub async fn new(
        config: Config,
        store: Arc<dyn StateStore>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Result<Self, RiskError> {
        let circuit = store
            .get_circuit_state()
            .await?
            .unwrap_or_else(|| CircuitState::normal(Utc::now()));

        Ok(Self {
            config,
            store,
            events,
            circuit: Mutex::new(circuit),
            prices: Mutex::new(PriceHistory::new()),
            symbol_locks: Mutex::new(HashMap::new()),
            daily_start_equity: Mutex::new(Decimal::ZERO),
        })
    }

    /// Acquires the per-symbol FIFO serialization lock of spec.md §4.2/§5.
    /// The caller must hold the returned guard across validate+submit+record
    /// for this symbol; across symbols, actions may interleave freely.
    pub async fn lock_symbol(&self, symbol: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.symbol_locks.lock().await;
            locks
                .entry(symbol.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn circuit_level(&self) -> CircuitLevel {
        self.circuit.lock().await.level
    }

    pub async fn kill_flag(&self) -> bool {
        self.circuit.lock().await.kill_flag
    }

    pub async fn circuit_state(&self) -> CircuitState {
        self.circuit.lock().await.clone()
    }

    /// Feeds a closed-bar price observation into the 30-day correlation
    /// window. Called by the Engine Runtime once per closed minute bar per
    /// tracked symbol.
    pub async fn observe_price(&self, symbol: &str, at: DateTime<Utc>, price: Decimal) {
        self.prices.lock().await.push(symbol, at, price);
    }

    /// Seeds the UTC-day starting equity used by the daily-loss-cap gate.
    /// Called once at startup and again at every `daily_reset_utc` rollover.
    pub async fn reset_daily_equity(&self, equity: Decimal) {
        *self.daily_start_equity.lock().await = equity;
    }

    /// Runs the seven-gate pre-trade chain of spec.md §4.3 in order; the
    /// first failing gate short-circuits the rest. On success, records the
    /// idempotency timestamp and returns an `ApprovedAction` ready for
    /// `Executor::submit`.
    ///
    /// `min_reaction_interval` is the calling strategy's own idempotency
    /// window (spec.md §4.6's `Strategy::min_reaction_interval`); the
    /// Arbiter does not know strategy internals, only the interval it must
    /// enforce.
    pub async fn approve(
        &self,
        action: ProposedAction,
        engine: &EngineConfig,
        portfolio: &Portfolio,
        mark_price: Decimal,
        min_reaction_interval: ChronoDuration,
    ) -> Result<ApprovedAction, RiskError> {
        self.gate_owner(engine)?;
        self.gate_sizing(&action, portfolio, mark_price)?;
        self.gate_per_trade_risk(&action, portfolio)?;
        self.gate_leverage(&action, engine, portfolio, mark_price)?;
        self.gate_correlation(&action).await?;
        self.gate_circuit_breaker(&action).await?;
        self.gate_idempotency(&action, min_reaction_interval).await?;

        let approved_at = Utc::now();
        self.store
            .set_strategy_meta(
                action.owner,
                &action.symbol,
                "last_action_at",
                &approved_at.to_rfc3339(),
            )
            .await?;

        Ok(ApprovedAction { action, approved_at })
    }

    fn gate_owner(&self, engine: &EngineConfig) -> Result<(), RiskError> {
        if !engine.enabled {
            return Err(RiskError::OwnerDisabled);
        }
        Ok(())
    }

    fn gate_sizing(
        &self,
        action: &ProposedAction,
        portfolio: &Portfolio,
        mark_price: Decimal,
    ) -> Result<(), RiskError> {
        let notional = action.qty * mark_price;
        let cap = self.config.risk.max_position_pct * portfolio.equity_usd;
        if notional > cap {
            return Err(RiskError::SizingExceeded { notional, cap });
        }
        Ok(())
    }

    fn gate_per_trade_risk(
        &self,
        action: &ProposedAction,
        portfolio: &Portfolio,
    ) -> Result<(), RiskError> {
        let Some(stop) = action.stop_price else {
            return Ok(());
        };
        let Some(entry) = action.limit_price else {
            return Ok(());
        };
        let risk = (entry - stop).abs() * action.qty;
        let cap = self.config.risk.risk_per_trade_pct * portfolio.equity_usd;
        if risk > cap {
            return Err(RiskError::PerTradeRiskExceeded { risk, cap });
        }
        Ok(())
    }

    fn gate_leverage(
        &self,
        action: &ProposedAction,
        engine: &EngineConfig,
        portfolio: &Portfolio,
        mark_price: Decimal,
    ) -> Result<(), RiskError> {
        if portfolio.equity_usd.is_zero() {
            return Err(RiskError::LeverageExceeded {
                projected: Decimal::MAX,
                cap: engine.max_leverage,
            });
        }
        let notional = action.qty * mark_price;
        let projected = (portfolio.used_margin_usd + notional) / portfolio.equity_usd;
        if projected > engine.max_leverage {
            return Err(RiskError::LeverageExceeded {
                projected,
                cap: engine.max_leverage,
            });
        }
        Ok(())
    }

    async fn gate_correlation(&self, action: &ProposedAction) -> Result<(), RiskError> {
        if action.reduce_only {
            return Ok(());
        }
        let prices = self.prices.lock().await;
        match prices.count_correlated_above(&action.symbol, self.config.risk.correlation_threshold) {
            None => {
                tracing::debug!(symbol = %action.symbol, "insufficient price history for correlation gate, skipping");
                Ok(())
            }
            Some(count) if count as u32 > self.config.risk.max_correlated_positions => {
                Err(RiskError::CorrelationBreach { count })
            }
            Some(_) => Ok(()),
        }
    }

    /// Effect-on-new-actions column of spec.md §4.3's circuit-breaker
    /// matrix. Reduced sizing (×0.75/×0.50) is the caller's concern — the
    /// gate here only blocks actions the matrix forbids outright.
    async fn gate_circuit_breaker(&self, action: &ProposedAction) -> Result<(), RiskError> {
        let level = self.circuit.lock().await.level;
        let blocked = match level {
            CircuitLevel::Normal => false,
            CircuitLevel::Caution => matches!(action.owner, EngineOwner::Tactical) && !action.reduce_only,
            CircuitLevel::Warning => matches!(action.owner, EngineOwner::Trend) && !action.reduce_only,
            CircuitLevel::Alert => {
                matches!(action.owner, EngineOwner::Trend | EngineOwner::Funding) && !action.reduce_only
            }
            CircuitLevel::Emergency => true,
        };
        if blocked {
            return Err(RiskError::CircuitTripped(level));
        }
        Ok(())
    }

    async fn gate_idempotency(
        &self,
        action: &ProposedAction,
        min_reaction_interval: ChronoDuration,
    ) -> Result<(), RiskError> {
        let meta = self
            .store
            .get_strategy_meta(action.owner, &action.symbol, "last_action_at")
            .await?;
        let Some(meta) = meta else {
            return Ok(());
        };
        let Ok(last) = DateTime::parse_from_rfc3339(&meta.value) else {
            return Ok(());
        };
        if Utc::now() - last.with_timezone(&Utc) < min_reaction_interval {
            return Err(RiskError::DuplicateSuppressed);
        }
        Ok(())
    }

    /// Re-evaluates drawdown against the four-level matrix. Transitions are
    /// monotonic upward only (spec.md §4.3); a lower reading never
    /// auto-recovers the level — that requires `acknowledge_recovery`.
    /// Called after every fill and at least once per minute.
    pub async fn evaluate_drawdown(&self, portfolio: &Portfolio) -> Result<(), RiskError> {
        let drawdown = portfolio.drawdown();
        let thresholds = &self.config.risk.circuit;
        let candidate = if drawdown >= thresholds.l4_emergency {
            CircuitLevel::Emergency
        } else if drawdown >= thresholds.l3_alert {
            CircuitLevel::Alert
        } else if drawdown >= thresholds.l2_warning {
            CircuitLevel::Warning
        } else if drawdown >= thresholds.l1_caution {
            CircuitLevel::Caution
        } else {
            CircuitLevel::Normal
        };

        self.raise_to(candidate, drawdown).await
    }

    /// An independent trigger: a daily realized loss past the configured cap
    /// forces an immediate L1, regardless of cumulative peak drawdown
    /// (spec.md §4.3 "Drawdown tracker semantics").
    pub async fn check_daily_loss_cap(&self, portfolio: &Portfolio) -> Result<(), RiskError> {
        let start = *self.daily_start_equity.lock().await;
        if start.is_zero() {
            return Ok(());
        }
        let loss = start - portfolio.equity_usd;
        let cap = self.config.risk.daily_loss_cap_pct * start;
        if loss > cap {
            self.raise_to(CircuitLevel::Caution, portfolio.drawdown()).await?;
        }
        Ok(())
    }

    async fn raise_to(&self, candidate: CircuitLevel, drawdown: Decimal) -> Result<(), RiskError> {
        let mut circuit = self.circuit.lock().await;
        if candidate <= circuit.level {
            return Ok(());
        }
        let from = circuit.level;
        let at = Utc::now();
        circuit.level = candidate;
        circuit.since = at;
        circuit.triggering_drawdown = drawdown;
        if candidate == CircuitLevel::Emergency {
            circuit.kill_flag = true;
        }
        self.store.set_circuit_state(&circuit).await?;
        let _ = self.events.send(EngineEvent::CircuitTransition(CircuitTransition {
            from,
            to: candidate,
            drawdown,
            at,
        }));
        Ok(())
    }

    /// The external control surface's `ack-recovery(level)`: only valid when
    /// the drawdown condition for the requested downgrade is also satisfied
    /// (spec.md §4.3's "Exit" column), never on level alone.
    pub async fn acknowledge_recovery(
        &self,
        target_level: CircuitLevel,
        portfolio: &Portfolio,
    ) -> Result<(), RiskError> {
        let mut circuit = self.circuit.lock().await;
        let condition_met = match circuit.level {
            CircuitLevel::Normal => return Ok(()),
            CircuitLevel::Caution => portfolio.drawdown() < dec!(0.05),
            CircuitLevel::Warning => portfolio.drawdown() < dec!(0.10),
            CircuitLevel::Alert => true,
            CircuitLevel::Emergency => false,
        };
        if !condition_met || target_level >= circuit.level {
            return Err(RiskError::RecoveryConditionNotMet);
        }
        let from = circuit.level;
        let at = Utc::now();
        circuit.level = target_level;
        circuit.since = at;
        self.store.set_circuit_state(&circuit).await?;
        let _ = self.events.send(EngineEvent::CircuitTransition(CircuitTransition {
            from,
            to: target_level,
            drawdown: portfolio.drawdown(),
            at,
        }));
        Ok(())
    }

    /// `clear-kill-flag`: the only way out of L4. Dual-authorization (who
    /// may call this) is enforced at the control-surface boundary (§6.2),
    /// not here.
    pub async fn clear_kill_flag(&self) -> Result<(), RiskError> {
        let mut circuit = self.circuit.lock().await;
        circuit.kill_flag = false;
        circuit.level = CircuitLevel::Normal;
        circuit.since = Utc::now();
        circuit.triggering_drawdown = Decimal::ZERO;
        self.store.set_circuit_state(&circuit).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use core_types::{Fill, Order, OrderStatus, Position, PositionSide, StrategyMeta};
    use database::DbError;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeStore {
        circuit: StdMutex<Option<CircuitState>>,
        meta: StdMutex<HashMap<(EngineOwner, String, String), StrategyMeta>>,
    }

    #[async_trait]
    impl StateStore for FakeStore {
        async fn upsert_position(&self, _position: &Position) -> Result<(), DbError> {
            Ok(())
        }
        async fn delete_position(
            &self,
            _symbol: &str,
            _owner: EngineOwner,
            _side: PositionSide,
        ) -> Result<(), DbError> {
            Ok(())
        }
        async fn load_all_positions(&self) -> Result<Vec<Position>, DbError> {
            Ok(vec![])
        }
        async fn record_order(&self, _order: &Order) -> Result<(), DbError> {
            Ok(())
        }
        async fn update_order_status(
            &self,
            _client_id: Uuid,
            _status: OrderStatus,
            _filled_qty: Decimal,
            _avg_fill_price: Option<Decimal>,
            _venue_id: Option<String>,
        ) -> Result<(), DbError> {
            Ok(())
        }
        async fn load_open_orders(&self) -> Result<Vec<Order>, DbError> {
            Ok(vec![])
        }
        async fn record_fill(&self, _fill: &Fill) -> Result<(), DbError> {
            Ok(())
        }
        async fn record_fill_and_position(
            &self,
            _fill: &Fill,
            _position: Option<&Position>,
            _owner: EngineOwner,
            _side: PositionSide,
        ) -> Result<(), DbError> {
            Ok(())
        }
        async fn set_portfolio_snapshot(&self, _snapshot: &Portfolio) -> Result<(), DbError> {
            Ok(())
        }
        async fn get_portfolio_snapshot(&self) -> Result<Option<Portfolio>, DbError> {
            Ok(None)
        }
        async fn set_circuit_state(&self, state: &CircuitState) -> Result<(), DbError> {
            *self.circuit.lock().unwrap() = Some(state.clone());
            Ok(())
        }
        async fn get_circuit_state(&self) -> Result<Option<CircuitState>, DbError> {
            Ok(self.circuit.lock().unwrap().clone())
        }
        async fn set_strategy_meta(
            &self,
            owner: EngineOwner,
            symbol: &str,
            key: &str,
            value: &str,
        ) -> Result<(), DbError> {
            self.meta.lock().unwrap().insert(
                (owner, symbol.to_string(), key.to_string()),
                StrategyMeta {
                    owner,
                    symbol: symbol.to_string(),
                    key: key.to_string(),
                    value: value.to_string(),
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }
        async fn get_strategy_meta(
            &self,
            owner: EngineOwner,
            symbol: &str,
            key: &str,
        ) -> Result<Option<StrategyMeta>, DbError> {
            Ok(self
                .meta
                .lock()
                .unwrap()
                .get(&(owner, symbol.to_string(), key.to_string()))
                .cloned())
        }
    }

    fn portfolio(equity: Decimal, peak: Decimal) -> Portfolio {
        Portfolio {
            equity_usd: equity,
            available_usd: equity,
            used_margin_usd: Decimal::ZERO,
            peak_equity_usd: peak,
            realized_pnl_today: Decimal::ZERO,
            snapshot_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn drawdown_raises_circuit_level_monotonically() {
        let (tx, _rx) = broadcast::channel(16);
        let store: Arc<dyn StateStore> = Arc::new(FakeStore::default());
        let config = test_config();
        let arbiter = RiskArbiter::new(config, store, tx).await.unwrap();

        arbiter.evaluate_drawdown(&portfolio(dec!(84500), dec!(100000))).await.unwrap();
        assert_eq!(arbiter.circuit_level().await, CircuitLevel::Warning);

        // A later recovery in drawdown must not lower the level on its own.
        arbiter.evaluate_drawdown(&portfolio(dec!(99000), dec!(100000))).await.unwrap();
        assert_eq!(arbiter.circuit_level().await, CircuitLevel::Warning);
    }

    #[tokio::test]
    async fn emergency_sets_permanent_kill_flag() {
        let (tx, _rx) = broadcast::channel(16);
        let store: Arc<dyn StateStore> = Arc::new(FakeStore::default());
        let arbiter = RiskArbiter::new(test_config(), store, tx).await.unwrap();

        arbiter.evaluate_drawdown(&portfolio(dec!(74000), dec!(100000))).await.unwrap();
        assert_eq!(arbiter.circuit_level().await, CircuitLevel::Emergency);
        assert!(arbiter.kill_flag().await);
    }

    #[tokio::test]
    async fn idempotency_gate_suppresses_rapid_duplicate() {
        let (tx, _rx) = broadcast::channel(16);
        let store: Arc<dyn StateStore> = Arc::new(FakeStore::default());
        let arbiter = RiskArbiter::new(test_config(), store, tx).await.unwrap();

        let engine = test_config().engines.trend.clone();
        let portfolio = portfolio(dec!(100000), dec!(100000));
        let action = ProposedAction::new(
            EngineOwner::Trend,
            "BTC/USDT",
            core_types::OrderSide::Buy,
            dec!(0.01),
            core_types::OrderType::Market,
        );

        arbiter
            .approve(action.clone(), &engine, &portfolio, dec!(20000), ChronoDuration::hours(4))
            .await
            .unwrap();

        let second = ProposedAction::new(
            EngineOwner::Trend,
            "BTC/USDT",
            core_types::OrderSide::Buy,
            dec!(0.01),
            core_types::OrderType::Market,
        );
        let err = arbiter
            .approve(second, &engine, &portfolio, dec!(20000), ChronoDuration::hours(4))
            .await
            .unwrap_err();
        assert!(matches!(err, RiskError::DuplicateSuppressed));
    }

    fn test_config() -> Config {
        use configuration::{CoreHodlParams, EngineConfig, EnginesConfig, FundingParams, RiskConfig, StrategyParams, TacticalParams, TrendParams, VenueConfig};
        use std::collections::HashMap as Map;

        Config {
            engines: EnginesConfig {
                core_hodl: EngineConfig { target_allocation: dec!(0.60), enabled: true, max_leverage: dec!(1.0) },
                trend: EngineConfig { target_allocation: dec!(0.20), enabled: true, max_leverage: dec!(2.0) },
                funding: EngineConfig { target_allocation: dec!(0.15), enabled: true, max_leverage: dec!(2.0) },
                tactical: EngineConfig { target_allocation: dec!(0.05), enabled: true, max_leverage: dec!(1.0) },
            },
            risk: RiskConfig {
                max_position_pct: dec!(0.05),
                risk_per_trade_pct: dec!(0.01),
                correlation_threshold: dec!(0.70),
                max_correlated_positions: 3,
                daily_loss_cap_pct: dec!(0.02),
                circuit: configuration::CircuitThresholds {
                    l1_caution: dec!(0.10),
                    l2_warning: dec!(0.15),
                    l3_alert: dec!(0.20),
                    l4_emergency: dec!(0.25),
                },
            },
            venue: VenueConfig {
                rest_base_url: "https://example.invalid".into(),
                ws_base_url: "wss://example.invalid".into(),
            },
            symbol_owners: Map::new(),
            daily_reset_utc: chrono::NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            dust_threshold_usd: dec!(1.00),
            strategies: StrategyParams {
                core_hodl: CoreHodlParams {
                    core_assets: vec!["BTC".into(), "ETH".into()],
                    dca_notional_usd: dec!(100),
                    dca_interval_days: 7,
                    rebalance_drift_pct: dec!(0.10),
                    ath_drawdown_sell_guard_pct: dec!(0.70),
                },
                trend: TrendParams {
                    symbols: vec!["BTC/USDT".into(), "ETH/USDT".into()],
                    atr_period: 14,
                    atr_multiplier: dec!(3.0),
                    trail_atr_multiplier: dec!(1.5),
                },
                funding: FundingParams {
                    symbols: vec!["BTC/USDT".into()],
                    target_rate_threshold: dec!(0.0001),
                    basis_safety_threshold: dec!(0.005),
                },
                tactical: TacticalParams {
                    reserve_asset: "USDT".into(),
                    deployment_notional_usd: dec!(500),
                    min_interval_days: 30,
                    fear_index_entry_threshold: 20,
                },
            },
            alerting: Default::default(),
        }
    }
}
