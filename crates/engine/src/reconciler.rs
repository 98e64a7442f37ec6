use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use api_client::Venue;
use chrono::Utc;
use core_types::{EngineOwner, Order, OrderStatus, OrderType, Portfolio, Position, PositionSide};
use database::StateStore;
use events::messages::ReconcileSummary;
use events::EngineEvent;
use executor::Executor;
use risk::RiskArbiter;
use rust_decimal::Decimal;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EngineError;

/// The "subtle part" of spec.md §4.6: eight steps run once at every start,
/// before any strategy is ticked, reconciling persisted state against venue
/// truth. Generalizes the teacher's `StateReconciler` (which only ever
/// replaced a single flat `Portfolio.positions` map wholesale) into the
/// owner-aware, dust-filtering, foreign-order-adopting procedure spec.md
/// requires.
pub struct Reconciler {
    venue: Arc<dyn Venue>,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn Executor>,
    arbiter: Arc<RiskArbiter>,
    events: broadcast::Sender<EngineEvent>,
    symbol_owners: HashMap<String, EngineOwner>,
    dust_threshold_usd: Decimal,
    /// Fraction of equity above which a reconciliation divergence (stored
    /// positions absent from the venue) becomes a fatal halt rather than a
    /// logged warning (spec.md §7 `ReconcileMismatch`, scenario F).
    mismatch_halt_pct: Decimal,
}

impl Reconciler {
    pub fn new(
        venue: Arc<dyn Venue>,
        store: Arc<dyn StateStore>,
        executor: Arc<dyn Executor>,
        arbiter: Arc<RiskArbiter>,
        events: broadcast::Sender<EngineEvent>,
        symbol_owners: HashMap<String, EngineOwner>,
        dust_threshold_usd: Decimal,
    ) -> Self {
        Self {
            venue,
            store,
            executor,
            arbiter,
            events,
            symbol_owners,
            dust_threshold_usd,
            mismatch_halt_pct: Decimal::new(1, 2),
        }
    }

    /// Runs all eight steps. Returns `Err(EngineError::KillFlagSet)` after
    /// fully reconciling (step 8 is a post-condition, not a short-circuit):
    /// the caller must still refuse to start strategies, but state is left
    /// consistent and query-able.
    pub async fn reconcile(&self) -> Result<ReconcileSummary, EngineError> {
        // 1. Load persisted positions and open orders.
        let stored_positions = self.store.load_all_positions().await?;
        let stored_orders = self.store.load_open_orders().await?;
        let mut stored_by_key: HashMap<(String, PositionSide), Position> = stored_positions
            .into_iter()
            .map(|p| ((p.symbol.clone(), p.side), p))
            .collect();

        // 2. Query venue positions and open orders.
        let venue_positions = self.venue.positions().await?;
        let venue_open_orders = self.venue.open_orders(None).await?;

        // 3. Non-dust venue positions absent from the store are inserted,
        // owner inferred from the static symbol->owner map.
        let mut imported_positions = 0u32;
        for vp in &venue_positions {
            if vp.position_amt.is_zero() {
                continue;
            }
            let notional = vp.position_amt.abs() * vp.mark_price;
            if notional < self.dust_threshold_usd {
                continue;
            }
            let side = if vp.position_amt.is_sign_positive() { PositionSide::Long } else { PositionSide::Short };
            let key = (vp.symbol.clone(), side);
            if stored_by_key.contains_key(&key) {
                continue;
            }
            let owner = *self.symbol_owners.get(&vp.symbol).ok_or_else(|| {
                EngineError::ReconcileMismatch(format!(
                    "venue position on `{}` has no configured owner in symbol_owners",
                    vp.symbol
                ))
            })?;
            let position = Position {
                symbol: vp.symbol.clone(),
                side,
                owner,
                size: vp.position_amt.abs(),
                avg_entry_price: vp.entry_price,
                unrealized_pnl: vp.un_realized_profit,
                last_updated: Utc::now(),
            };
            self.store.upsert_position(&position).await?;
            stored_by_key.insert(key, position);
            imported_positions += 1;
        }

        // 4. Stored positions absent from venue were closed while we were down.
        let venue_keys: HashSet<(String, PositionSide)> = venue_positions
            .iter()
            .filter(|vp| !vp.position_amt.is_zero())
            .map(|vp| {
                let side = if vp.position_amt.is_sign_positive() { PositionSide::Long } else { PositionSide::Short };
                (vp.symbol.clone(), side)
            })
            .collect();
        let mut deleted_positions = 0u32;
        let mut deleted_notional = Decimal::ZERO;
        let stale_keys: Vec<(String, PositionSide)> =
            stored_by_key.keys().filter(|k| !venue_keys.contains(*k)).cloned().collect();
        for key in stale_keys {
            if let Some(position) = stored_by_key.remove(&key) {
                deleted_notional += position.notional(position.avg_entry_price);
                self.store.delete_position(&position.symbol, position.owner, position.side).await?;
                deleted_positions += 1;
                tracing::warn!(
                    symbol = %position.symbol,
                    owner = %position.owner,
                    notional = %position.notional(position.avg_entry_price),
                    "stored position absent from venue; deleted as closed while down"
                );
            }
        }

        // 5. Open orders on venue with an unrecognized client_id are
        // adopted as foreign and tracked, never cancelled.
        let known_ids: HashSet<Uuid> = stored_orders.iter().map(|o| o.client_id).collect();
        let mut imported_orders = 0u32;
        for vo in &venue_open_orders {
            let parsed = Uuid::parse_str(&vo.client_order_id).ok();
            if parsed.is_some_and(|id| known_ids.contains(&id)) {
                continue;
            }
            let Some(&owner) = self.symbol_owners.get(&vo.symbol) else {
                tracing::warn!(symbol = %vo.symbol, "foreign order on an unmapped symbol; leaving untouched on venue");
                continue;
            };
            let order = Order {
                client_id: parsed.unwrap_or_else(Uuid::new_v4),
                venue_id: Some(vo.order_id.to_string()),
                symbol: vo.symbol.clone(),
                owner,
                side: vo.side,
                kind: OrderType::Limit,
                qty: vo.orig_qty,
                limit_price: Some(vo.price),
                trigger_price: if vo.stop_price.is_zero() { None } else { Some(vo.stop_price) },
                reduce_only: vo.reduce_only,
                post_only: false,
                status: OrderStatus::Live,
                filled_qty: vo.executed_qty,
                avg_fill_price: if vo.avg_price.is_zero() { None } else { Some(vo.avg_price) },
                created_at: Utc::now(),
            };
            self.store.record_order(&order).await?;
            imported_orders += 1;
        }

        // 6. Symbols with a surviving position get `last_action_at` seeded
        // to now, suppressing an immediate duplicate entry on first tick —
        // "the root cause of the duplicate-DCA class of bugs".
        for position in stored_by_key.values() {
            self.store
                .set_strategy_meta(position.owner, &position.symbol, "last_action_at", &Utc::now().to_rfc3339())
                .await?;
        }

        // 7. Recompute peak_equity = max(stored_peak, current_equity).
        let mark_by_symbol: HashMap<&str, Decimal> =
            venue_positions.iter().map(|vp| (vp.symbol.as_str(), vp.mark_price)).collect();
        let positions_notional: Decimal = stored_by_key
            .values()
            .map(|p| p.notional(mark_by_symbol.get(p.symbol.as_str()).copied().unwrap_or(p.avg_entry_price)))
            .sum();
        let available_usd: Decimal = self.venue.balances().await?.iter().map(|b| b.available_balance).sum();
        let current_equity = available_usd + positions_notional;

        let mut snapshot = self.store.get_portfolio_snapshot().await?.unwrap_or(Portfolio {
            equity_usd: Decimal::ZERO,
            available_usd: Decimal::ZERO,
            used_margin_usd: Decimal::ZERO,
            peak_equity_usd: Decimal::ZERO,
            realized_pnl_today: Decimal::ZERO,
            snapshot_at: Utc::now(),
        });
        snapshot.equity_usd = current_equity;
        snapshot.available_usd = available_usd;
        snapshot.used_margin_usd = positions_notional;
        snapshot.peak_equity_usd = snapshot.peak_equity_usd.max(current_equity);
        snapshot.snapshot_at = Utc::now();
        self.store.set_portfolio_snapshot(&snapshot).await?;

        self.executor.seed_positions(stored_by_key.into_values().collect()).await;

        let summary = ReconcileSummary {
            imported_positions,
            deleted_positions,
            imported_orders,
            at: Utc::now(),
        };
        let _ = self.events.send(EngineEvent::ReconcileSummary(summary.clone()));

        // A divergence this large (spec.md §7 `ReconcileMismatch`) means the
        // stored and venue truths disagreed by more than is plausible from
        // ordinary drift; refuse to start trading into an unexplained gap.
        if !current_equity.is_zero() && deleted_notional > self.mismatch_halt_pct * current_equity {
            return Err(EngineError::ReconcileMismatch(format!(
                "deleted position notional ${deleted_notional} exceeds {}% of equity (${current_equity}); halting into needs-operator state",
                self.mismatch_halt_pct * Decimal::from(100)
            )));
        }

        // 8. A persisted kill flag refuses strategy starts; reconciliation
        // itself has already completed so read-only state is fully caught up.
        if self.arbiter.kill_flag().await {
            return Err(EngineError::KillFlagSet);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::responses::{
        AmendRequest, BalanceResponse, FundingInfo, MarketSnapshot, OrderResponse, PlaceAck, PositionResponse,
        VenueEvent,
    };
    use api_client::error::ApiError;
    use async_trait::async_trait;
    use core_types::{Fill, Kline};
    use database::DbError;
    use rust_decimal_macros::dec;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::mpsc;

    /// A venue double that serves whatever fixed positions/balances/orders
    /// a test configures; every unused endpoint is unreachable for these
    /// tests (the reconciler never calls `place`/`amend`/etc.).
    struct FakeVenue {
        positions: Vec<PositionResponse>,
        balances: Vec<BalanceResponse>,
        open_orders: Vec<OrderResponse>,
    }

    #[async_trait]
    impl Venue for FakeVenue {
        async fn market_snapshot(&self, _symbol: &str) -> Result<MarketSnapshot, ApiError> {
            unreachable!("reconciliation does not read market snapshots")
        }
        async fn funding(&self, _symbol: &str) -> Result<FundingInfo, ApiError> {
            unreachable!("reconciliation does not read funding")
        }
        async fn balances(&self) -> Result<Vec<BalanceResponse>, ApiError> {
            Ok(self.balances.clone())
        }
        async fn positions(&self) -> Result<Vec<PositionResponse>, ApiError> {
            Ok(self.positions.clone())
        }
        async fn open_orders(&self, _symbol: Option<&str>) -> Result<Vec<OrderResponse>, ApiError> {
            Ok(self.open_orders.clone())
        }
        async fn place(&self, _action: &core_types::ProposedAction) -> Result<PlaceAck, ApiError> {
            unreachable!("reconciliation never places orders")
        }
        async fn amend(&self, _client_id: Uuid, _amendment: AmendRequest) -> Result<(), ApiError> {
            unreachable!()
        }
        async fn cancel(&self, _client_id: Uuid) -> Result<(), ApiError> {
            unreachable!()
        }
        async fn cancel_all(&self, _symbol: Option<&str>) -> Result<(), ApiError> {
            unreachable!()
        }
        async fn history(&self, _symbol: &str, _since: chrono::DateTime<Utc>) -> Result<Vec<OrderResponse>, ApiError> {
            Ok(vec![])
        }
        async fn fetch_klines(
            &self,
            _symbol: &str,
            _interval: &str,
            _start_time: chrono::DateTime<Utc>,
            _end_time: chrono::DateTime<Utc>,
        ) -> Result<Vec<Kline>, ApiError> {
            Ok(vec![])
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u8) -> Result<(), ApiError> {
            Ok(())
        }
        fn subscribe(&self) -> Result<mpsc::Receiver<VenueEvent>, ApiError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }
    }

    #[derive(Default)]
    struct FakeStore {
        positions: StdMutex<Vec<Position>>,
        meta: StdMutex<HashMap<(EngineOwner, String, String), String>>,
        circuit: StdMutex<Option<core_types::CircuitState>>,
        snapshot: StdMutex<Option<Portfolio>>,
    }

    #[async_trait]
    impl StateStore for FakeStore {
        async fn upsert_position(&self, position: &Position) -> Result<(), DbError> {
            self.positions.lock().unwrap().push(position.clone());
            Ok(())
        }
        async fn delete_position(&self, symbol: &str, owner: EngineOwner, side: PositionSide) -> Result<(), DbError> {
            self.positions.lock().unwrap().retain(|p| !(p.symbol == symbol && p.owner == owner && p.side == side));
            Ok(())
        }
        async fn load_all_positions(&self) -> Result<Vec<Position>, DbError> {
            Ok(self.positions.lock().unwrap().clone())
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
        async fn set_portfolio_snapshot(&self, snapshot: &Portfolio) -> Result<(), DbError> {
            *self.snapshot.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }
        async fn get_portfolio_snapshot(&self) -> Result<Option<Portfolio>, DbError> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
        async fn set_circuit_state(&self, state: &core_types::CircuitState) -> Result<(), DbError> {
            *self.circuit.lock().unwrap() = Some(state.clone());
            Ok(())
        }
        async fn get_circuit_state(&self) -> Result<Option<core_types::CircuitState>, DbError> {
            Ok(self.circuit.lock().unwrap().clone())
        }
        async fn set_strategy_meta(&self, owner: EngineOwner, symbol: &str, key: &str, value: &str) -> Result<(), DbError> {
            self.meta.lock().unwrap().insert((owner, symbol.to_string(), key.to_string()), value.to_string());
            Ok(())
        }
        async fn get_strategy_meta(
            &self,
            owner: EngineOwner,
            symbol: &str,
            key: &str,
        ) -> Result<Option<core_types::StrategyMeta>, DbError> {
            Ok(self
                .meta
                .lock()
                .unwrap()
                .get(&(owner, symbol.to_string(), key.to_string()))
                .map(|value| core_types::StrategyMeta {
                    owner,
                    symbol: symbol.to_string(),
                    key: key.to_string(),
                    value: value.clone(),
                    updated_at: Utc::now(),
                }))
        }
    }

    fn position_response(symbol: &str, amt: Decimal, mark: Decimal, entry: Decimal) -> PositionResponse {
        PositionResponse {
            entry_price: entry,
            leverage: "1".into(),
            max_notional_value: "0".into(),
            liquidation_price: Decimal::ZERO,
            mark_price: mark,
            position_amt: amt,
            symbol: symbol.into(),
            un_realized_profit: Decimal::ZERO,
        }
    }

    fn balance(asset: &str, available: Decimal) -> BalanceResponse {
        BalanceResponse {
            account_alias: "test".into(),
            asset: asset.into(),
            balance: available,
            cross_wallet_balance: available,
            cross_un_pnl: Decimal::ZERO,
            available_balance: available,
            max_withdraw_amount: available,
        }
    }

    fn test_config() -> configuration::Config {
        use configuration::*;
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
                circuit: CircuitThresholds {
                    l1_caution: dec!(0.10),
                    l2_warning: dec!(0.15),
                    l3_alert: dec!(0.20),
                    l4_emergency: dec!(0.25),
                },
            },
            venue: VenueConfig { rest_base_url: "https://example.invalid".into(), ws_base_url: "wss://example.invalid".into() },
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
                    symbols: vec!["BTC/USDT".into()],
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

    async fn build_reconciler(
        config: &configuration::Config,
        venue: FakeVenue,
        store: Arc<FakeStore>,
        symbol_owners: HashMap<String, EngineOwner>,
    ) -> Reconciler {
        let (tx, _rx) = broadcast::channel(16);
        let venue: Arc<dyn Venue> = Arc::new(venue);
        let store_dyn: Arc<dyn StateStore> = store.clone();
        let executor: Arc<dyn Executor> =
            Arc::new(executor::VenueExecutor::new(venue.clone(), store_dyn.clone(), tx.clone()));
        let arbiter = Arc::new(RiskArbiter::new(config.clone(), store_dyn.clone(), tx.clone()).await.unwrap());
        Reconciler::new(venue, store_dyn, executor, arbiter, tx, symbol_owners, config.dust_threshold_usd)
    }

    #[tokio::test]
    async fn dust_position_is_never_imported() {
        let config = test_config();
        let mut owners = HashMap::new();
        owners.insert("ETH/USDT".to_string(), EngineOwner::CoreHodl);

        let venue = FakeVenue {
            positions: vec![position_response("ETH/USDT", dec!(0.00002), dec!(2000), dec!(2000))],
            balances: vec![balance("USDT", dec!(10000))],
            open_orders: vec![],
        };
        let store = Arc::new(FakeStore::default());
        let reconciler = build_reconciler(&config, venue, store.clone(), owners).await;

        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary.imported_positions, 0);
        assert!(store.positions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_dust_position_is_imported_with_inferred_owner() {
        let config = test_config();
        let mut owners = HashMap::new();
        owners.insert("BTC/USDT".to_string(), EngineOwner::CoreHodl);

        let venue = FakeVenue {
            positions: vec![position_response("BTC/USDT", dec!(0.5), dec!(40000), dec!(38000))],
            balances: vec![balance("USDT", dec!(10000))],
            open_orders: vec![],
        };
        let store = Arc::new(FakeStore::default());
        let reconciler = build_reconciler(&config, venue, store.clone(), owners).await;

        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary.imported_positions, 1);
        let stored = store.positions.lock().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].owner, EngineOwner::CoreHodl);

        // Seeding `last_action_at` must suppress an immediate duplicate entry.
        let meta = store.meta.lock().unwrap();
        assert!(meta.contains_key(&(EngineOwner::CoreHodl, "BTC/USDT".to_string(), "last_action_at".to_string())));
    }

    #[tokio::test]
    async fn large_stale_position_deletion_halts_with_reconcile_mismatch() {
        let config = test_config();
        let owners = HashMap::new();

        // Stored short position worth $20,000 (scenario F's $200,000 scaled
        // down), venue reports nothing for it, and the only remaining
        // equity (cash) is small — the deleted notional is far over 1%.
        let store = Arc::new(FakeStore::default());
        store.positions.lock().unwrap().push(Position {
            symbol: "ETH/USDT".into(),
            side: PositionSide::Short,
            owner: EngineOwner::Trend,
            size: dec!(10),
            avg_entry_price: dec!(2000),
            unrealized_pnl: Decimal::ZERO,
            last_updated: Utc::now(),
        });

        let venue = FakeVenue {
            positions: vec![],
            balances: vec![balance("USDT", dec!(500))],
            open_orders: vec![],
        };
        let reconciler = build_reconciler(&config, venue, store.clone(), owners).await;

        let err = reconciler.reconcile().await.unwrap_err();
        assert!(matches!(err, EngineError::ReconcileMismatch(_)));
        // The position is still deleted even though the overall reconciliation halts.
        assert!(store.positions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_stale_position_deletion_is_a_non_fatal_warning() {
        let config = test_config();
        let owners = HashMap::new();

        let store = Arc::new(FakeStore::default());
        store.positions.lock().unwrap().push(Position {
            symbol: "ETH/USDT".into(),
            side: PositionSide::Short,
            owner: EngineOwner::Trend,
            size: dec!(0.001),
            avg_entry_price: dec!(2000),
            unrealized_pnl: Decimal::ZERO,
            last_updated: Utc::now(),
        });

        let venue = FakeVenue {
            positions: vec![],
            balances: vec![balance("USDT", dec!(500000))],
            open_orders: vec![],
        };
        let reconciler = build_reconciler(&config, venue, store.clone(), owners).await;

        let summary = reconciler.reconcile().await.unwrap();
        assert_eq!(summary.deleted_positions, 1);
    }
}
