use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use configuration::FundingParams;
use core_types::{EngineOwner, Fill, OrderSide, OrderType, PositionSide, ProposedAction};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::StrategyError;
use crate::{Cadence, Ctx, Strategy};

/// Delta-neutral funding-rate capture: long spot + short perp of equal
/// notional, entered and exited as a single atomic action group (spec.md
/// §4.6 #3). Supersedes the teacher's `FundingRateArb` scaffold, which
/// could not evaluate — `Ctx` now carries the funding rate and mark/index
/// snapshot the teacher's `Strategy::evaluate(&Kline)` signature had no room
/// for.
pub struct Funding {
    params: FundingParams,
    /// The Arbiter's per-position sizing cap (`risk.max_position_pct`),
    /// mirrored here so a leg is never sized above what `gate_sizing`
    /// (`risk/src/arbiter.rs`) will accept — sizing off the raw allocation
    /// weight alone let a single-symbol configuration size each leg at the
    /// full 15% allocation, which always exceeds the default 5% per-position
    /// cap and got every entry rejected with `SizingExceeded`.
    max_position_pct: Decimal,
}

impl Funding {
    pub fn new(params: FundingParams, max_position_pct: Decimal) -> Result<Self, StrategyError> {
        Ok(Self { params, max_position_pct })
    }
}

/// The perp leg's symbol, distinct from the spot leg's (spec.md §3 models
/// `{spot, linear-perp}` as separate symbols). Keeping the two legs on the
/// same symbol string made them indistinguishable to both position lookups
/// and the Arbiter's per-(owner, symbol) idempotency gate: approving the
/// spot leg first would poison the perp leg's `gate_idempotency` check and
/// the whole atomic group would always be rejected.
fn perp_symbol(symbol: &str) -> String {
    format!("{symbol}-PERP")
}

#[async_trait]
impl Strategy for Funding {
    fn name(&self) -> &'static str {
        "funding"
    }

    fn owner(&self) -> EngineOwner {
        EngineOwner::Funding
    }

    fn cadence(&self) -> Cadence {
        Cadence::Interval(ChronoDuration::hours(1))
    }

    fn allocation_weight(&self) -> Decimal {
        Decimal::new(15, 2)
    }

    async fn on_tick(&mut self, ctx: &Ctx) -> Result<Vec<ProposedAction>, StrategyError> {
        let mut actions = Vec::new();
        if self.params.symbols.is_empty() {
            return Ok(actions);
        }
        let allocation_notional =
            ctx.portfolio.equity_usd * self.allocation_weight() / Decimal::from(self.params.symbols.len());
        let risk_cap = self.max_position_pct * ctx.portfolio.equity_usd;
        // Each leg is its own `ProposedAction` and is checked against
        // `gate_sizing` independently, so the per-symbol notional must stay
        // within the per-position cap, not just within the engine's overall
        // allocation share.
        let per_symbol_notional = allocation_notional.min(risk_cap);

        for symbol in &self.params.symbols {
            let perp = perp_symbol(symbol);
            let snapshot = ctx.market_snapshot(symbol).await?;
            let funding = ctx.funding(symbol).await?;
            let basis = if snapshot.index.is_zero() {
                Decimal::ZERO
            } else {
                (snapshot.mark - snapshot.index).abs() / snapshot.index
            };

            let positions = ctx.positions().await?;
            let spot_leg = positions.iter().find(|p| p.symbol == *symbol && p.side == PositionSide::Long);
            let perp_leg = positions.iter().find(|p| p.symbol == perp && p.side == PositionSide::Short);
            let in_position = spot_leg.is_some() || perp_leg.is_some();

            if in_position {
                let should_exit = funding.rate <= Decimal::ZERO || basis > self.params.basis_safety_threshold;
                if !should_exit {
                    continue;
                }
                let group_id = Some(Uuid::new_v4());
                if let Some(spot) = spot_leg {
                    let mut action = ProposedAction::new(
                        EngineOwner::Funding,
                        symbol.clone(),
                        OrderSide::Sell,
                        spot.size,
                        OrderType::Market,
                    );
                    action.reduce_only = true;
                    action.group_id = group_id;
                    actions.push(action);
                }
                if let Some(perp_position) = perp_leg {
                    let mut action = ProposedAction::new(
                        EngineOwner::Funding,
                        perp.clone(),
                        OrderSide::Buy,
                        perp_position.size,
                        OrderType::Market,
                    );
                    action.reduce_only = true;
                    action.group_id = group_id;
                    actions.push(action);
                }
                continue;
            }

            let entry_viable = funding.rate > self.params.target_rate_threshold
                && basis <= self.params.basis_safety_threshold;
            if !entry_viable {
                continue;
            }
            let qty = per_symbol_notional / snapshot.mark;
            if qty <= Decimal::ZERO {
                continue;
            }
            let group_id = Some(Uuid::new_v4());

            let mut spot_action = ProposedAction::new(
                EngineOwner::Funding,
                symbol.clone(),
                OrderSide::Buy,
                qty,
                OrderType::Market,
            );
            spot_action.group_id = group_id;
            actions.push(spot_action);

            let mut perp_action = ProposedAction::new(
                EngineOwner::Funding,
                perp.clone(),
                OrderSide::Sell,
                qty,
                OrderType::Market,
            );
            perp_action.group_id = group_id;
            actions.push(perp_action);
        }

        Ok(actions)
    }

    async fn on_fill(&mut self, _ctx: &Ctx, _fill: &Fill) -> Result<(), StrategyError> {
        Ok(())
    }

    fn min_reaction_interval(&self, _symbol: &str) -> ChronoDuration {
        ChronoDuration::minutes(30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn params() -> FundingParams {
        FundingParams {
            symbols: vec!["BTC/USDT".into()],
            target_rate_threshold: dec!(0.0001),
            basis_safety_threshold: dec!(0.005),
        }
    }

    #[test]
    fn constructs_with_empty_symbols_without_error() {
        let mut p = params();
        p.symbols.clear();
        assert!(Funding::new(p, dec!(0.05)).is_ok());
    }

    #[test]
    fn allocation_weight_matches_configured_share() {
        let funding = Funding::new(params(), dec!(0.05)).unwrap();
        assert_eq!(funding.allocation_weight(), dec!(0.15));
    }

    #[test]
    fn perp_symbol_is_distinct_from_spot_symbol() {
        assert_ne!(perp_symbol("BTC/USDT"), "BTC/USDT");
        assert_eq!(perp_symbol("BTC/USDT"), "BTC/USDT-PERP");
    }

    #[tokio::test]
    async fn entry_legs_stay_within_the_per_position_sizing_cap() {
        use crate::MarketView;
        use api_client::responses::{FundingInfo, MarketSnapshot};
        use chrono::Utc;
        use core_types::CircuitLevel;
        use database::StateStore;
        use std::sync::Arc;

        struct FakeStore;
        #[async_trait::async_trait]
        impl StateStore for FakeStore {
            async fn upsert_position(&self, _: &core_types::Position) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn delete_position(
                &self,
                _: &str,
                _: EngineOwner,
                _: PositionSide,
            ) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn load_all_positions(&self) -> Result<Vec<core_types::Position>, database::DbError> {
                Ok(vec![])
            }
            async fn record_order(&self, _: &core_types::Order) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn update_order_status(
                &self,
                _: Uuid,
                _: core_types::OrderStatus,
                _: Decimal,
                _: Option<Decimal>,
                _: Option<String>,
            ) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn load_open_orders(&self) -> Result<Vec<core_types::Order>, database::DbError> {
                Ok(vec![])
            }
            async fn record_fill(&self, _: &core_types::Fill) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn record_fill_and_position(
                &self,
                _: &core_types::Fill,
                _: Option<&core_types::Position>,
                _: EngineOwner,
                _: PositionSide,
            ) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn set_portfolio_snapshot(&self, _: &core_types::Portfolio) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn get_portfolio_snapshot(&self) -> Result<Option<core_types::Portfolio>, database::DbError> {
                Ok(None)
            }
            async fn set_circuit_state(&self, _: &core_types::CircuitState) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn get_circuit_state(&self) -> Result<Option<core_types::CircuitState>, database::DbError> {
                Ok(None)
            }
            async fn set_strategy_meta(&self, _: EngineOwner, _: &str, _: &str, _: &str) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn get_strategy_meta(
                &self,
                _: EngineOwner,
                _: &str,
                _: &str,
            ) -> Result<Option<core_types::StrategyMeta>, database::DbError> {
                Ok(None)
            }
        }

        struct FakeMarket;
        #[async_trait::async_trait]
        impl MarketView for FakeMarket {
            async fn snapshot(&self, _symbol: &str) -> Result<MarketSnapshot, StrategyError> {
                Ok(MarketSnapshot {
                    last: dec!(25000),
                    mark: dec!(25000),
                    index: dec!(25000),
                    bid: dec!(24999),
                    ask: dec!(25001),
                    ts: Utc::now(),
                })
            }
            async fn funding(&self, _symbol: &str) -> Result<FundingInfo, StrategyError> {
                Ok(FundingInfo { rate: dec!(0.0005), next_funding_ts: Utc::now() })
            }
            async fn klines(
                &self,
                _symbol: &str,
                _interval: &str,
                _start: chrono::DateTime<Utc>,
                _end: chrono::DateTime<Utc>,
            ) -> Result<Vec<core_types::Kline>, StrategyError> {
                Ok(vec![])
            }
        }

        // 15% allocation over a single symbol would size each leg at
        // 0.15 * equity; the 5% per-position cap must win instead.
        let mut funding = Funding::new(params(), dec!(0.05)).unwrap();
        let portfolio = core_types::Portfolio {
            equity_usd: dec!(100000),
            available_usd: dec!(100000),
            used_margin_usd: Decimal::ZERO,
            peak_equity_usd: dec!(100000),
            realized_pnl_today: Decimal::ZERO,
            snapshot_at: Utc::now(),
        };
        let ctx = Ctx::new(
            Utc::now(),
            EngineOwner::Funding,
            portfolio,
            CircuitLevel::Normal,
            Arc::new(FakeStore) as Arc<dyn StateStore>,
            Arc::new(FakeMarket) as Arc<dyn MarketView>,
        );

        let actions = funding.on_tick(&ctx).await.unwrap();
        assert_eq!(actions.len(), 2);

        let spot = actions.iter().find(|a| a.symbol == "BTC/USDT").unwrap();
        let perp = actions.iter().find(|a| a.symbol == "BTC/USDT-PERP").unwrap();
        assert_ne!(spot.symbol, perp.symbol);
        assert_eq!(spot.group_id, perp.group_id);

        let cap = dec!(0.05) * dec!(100000);
        assert!(spot.qty * dec!(25000) <= cap);
        assert!(perp.qty * dec!(25000) <= cap);
    }

    /// Drives a full FUNDING entry group through the real `RiskArbiter`,
    /// reproducing the bug where the spot leg's `gate_idempotency` write
    /// poisoned the perp leg's check because both legs shared one symbol,
    /// and where sizing off the raw 15% allocation always tripped
    /// `gate_sizing`'s 5% per-position cap.
    #[tokio::test]
    async fn entry_group_legs_clear_the_arbiter() {
        use chrono::Utc;
        use configuration::{
            CircuitThresholds, CoreHodlParams, Config, EngineConfig, EnginesConfig, FundingParams as CfgFundingParams,
            RiskConfig, StrategyParams, TacticalParams, TrendParams, VenueConfig,
        };
        use risk::RiskArbiter;
        use std::collections::HashMap;
        use std::sync::Arc;
        use tokio::sync::broadcast;

        #[derive(Default)]
        struct FakeStore {
            meta: tokio::sync::Mutex<HashMap<(EngineOwner, String, String), String>>,
        }
        #[async_trait::async_trait]
        impl database::StateStore for FakeStore {
            async fn upsert_position(&self, _: &core_types::Position) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn delete_position(
                &self,
                _: &str,
                _: EngineOwner,
                _: PositionSide,
            ) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn load_all_positions(&self) -> Result<Vec<core_types::Position>, database::DbError> {
                Ok(vec![])
            }
            async fn record_order(&self, _: &core_types::Order) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn update_order_status(
                &self,
                _: Uuid,
                _: core_types::OrderStatus,
                _: Decimal,
                _: Option<Decimal>,
                _: Option<String>,
            ) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn load_open_orders(&self) -> Result<Vec<core_types::Order>, database::DbError> {
                Ok(vec![])
            }
            async fn record_fill(&self, _: &core_types::Fill) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn record_fill_and_position(
                &self,
                _: &core_types::Fill,
                _: Option<&core_types::Position>,
                _: EngineOwner,
                _: PositionSide,
            ) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn set_portfolio_snapshot(&self, _: &core_types::Portfolio) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn get_portfolio_snapshot(&self) -> Result<Option<core_types::Portfolio>, database::DbError> {
                Ok(None)
            }
            async fn set_circuit_state(&self, _: &core_types::CircuitState) -> Result<(), database::DbError> {
                Ok(())
            }
            async fn get_circuit_state(&self) -> Result<Option<core_types::CircuitState>, database::DbError> {
                Ok(None)
            }
            async fn set_strategy_meta(
                &self,
                owner: EngineOwner,
                symbol: &str,
                key: &str,
                value: &str,
            ) -> Result<(), database::DbError> {
                self.meta
                    .lock()
                    .await
                    .insert((owner, symbol.to_string(), key.to_string()), value.to_string());
                Ok(())
            }
            async fn get_strategy_meta(
                &self,
                owner: EngineOwner,
                symbol: &str,
                key: &str,
            ) -> Result<Option<core_types::StrategyMeta>, database::DbError> {
                Ok(self
                    .meta
                    .lock()
                    .await
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

        fn test_config() -> Config {
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
                venue: VenueConfig {
                    rest_base_url: "https://example.invalid".into(),
                    ws_base_url: "wss://example.invalid".into(),
                },
                symbol_owners: HashMap::new(),
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
                    funding: CfgFundingParams {
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

        let equity = dec!(100000);
        let mark = dec!(25000);
        let cap = dec!(0.05) * equity;
        let qty = cap / mark;

        let mut spot_action =
            ProposedAction::new(EngineOwner::Funding, "BTC/USDT", OrderSide::Buy, qty, OrderType::Market);
        spot_action.group_id = Some(Uuid::new_v4());
        let mut perp_action = ProposedAction::new(
            EngineOwner::Funding,
            perp_symbol("BTC/USDT"),
            OrderSide::Sell,
            qty,
            OrderType::Market,
        );
        perp_action.group_id = spot_action.group_id;

        let config = test_config();
        let (events_tx, _events_rx) = broadcast::channel(16);
        let store: Arc<dyn database::StateStore> = Arc::new(FakeStore::default());
        let arbiter = RiskArbiter::new(config.clone(), store, events_tx).await.unwrap();
        let engine_config = &config.engines.funding;
        let portfolio = core_types::Portfolio {
            equity_usd: equity,
            available_usd: equity,
            used_margin_usd: Decimal::ZERO,
            peak_equity_usd: equity,
            realized_pnl_today: Decimal::ZERO,
            snapshot_at: Utc::now(),
        };

        let spot_approved = arbiter
            .approve(spot_action, engine_config, &portfolio, mark, ChronoDuration::minutes(30))
            .await;
        assert!(spot_approved.is_ok(), "spot leg should clear every gate: {spot_approved:?}");

        let perp_approved = arbiter
            .approve(perp_action, engine_config, &portfolio, mark, ChronoDuration::minutes(30))
            .await;
        assert!(
            perp_approved.is_ok(),
            "perp leg must not collide with the spot leg's idempotency write: {perp_approved:?}"
        );
    }
}
