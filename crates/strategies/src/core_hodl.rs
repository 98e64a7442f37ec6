use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use configuration::CoreHodlParams;
use core_types::{EngineOwner, Fill, OrderSide, OrderType, ProposedAction};
use rust_decimal::Decimal;

use crate::error::StrategyError;
use crate::{Cadence, Ctx, Strategy};

const LAST_PURCHASE_KEY: &str = "last_purchase_at";
const ATH_KEY: &str = "ath_price";

/// Maintains a target split between the configured "core" spot assets via
/// periodic fixed-notional DCA buys and drift-triggered rebalancing
/// (spec.md §4.6 #1). The only strategy with a daily rather than
/// sub-daily cadence, and the only one trading spot rather than perps.
pub struct CoreHodl {
    params: CoreHodlParams,
}

impl CoreHodl {
    pub fn new(params: CoreHodlParams) -> Result<Self, StrategyError> {
        if params.core_assets.len() < 2 {
            return Err(StrategyError::InvalidParameters(
                "core_hodl requires at least two core_assets".into(),
            ));
        }
        Ok(Self { params })
    }

    fn symbol_for(&self, asset: &str) -> String {
        format!("{asset}/USDT")
    }

    /// `true` once the asset has fallen 70%+ from its recorded all-time high
    /// — the "MUST NOT emit sells" guard of spec.md §4.6 #1.
    async fn ath_guard_blocks_sell(&self, ctx: &Ctx, symbol: &str, price: Decimal) -> Result<bool, StrategyError> {
        let recorded_ath = ctx
            .get_meta(symbol, ATH_KEY)
            .await?
            .and_then(|v| v.parse::<Decimal>().ok())
            .unwrap_or(price);
        let ath = recorded_ath.max(price);
        if ath != recorded_ath {
            ctx.set_meta(symbol, ATH_KEY, &ath.to_string()).await?;
        }
        if ath.is_zero() {
            return Ok(false);
        }
        let drawdown = Decimal::ONE - (price / ath);
        Ok(drawdown >= self.params.ath_drawdown_sell_guard_pct)
    }

    async fn due_for_dca(&self, ctx: &Ctx, symbol: &str) -> Result<bool, StrategyError> {
        let Some(raw) = ctx.get_meta(symbol, LAST_PURCHASE_KEY).await? else {
            return Ok(true);
        };
        let Ok(last) = chrono::DateTime::parse_from_rfc3339(&raw) else {
            return Ok(true);
        };
        let interval = ChronoDuration::days(self.params.dca_interval_days);
        Ok(ctx.now - last.with_timezone(&chrono::Utc) >= interval)
    }
}

#[async_trait]
impl Strategy for CoreHodl {
    fn name(&self) -> &'static str {
        "core-hodl"
    }

    fn owner(&self) -> EngineOwner {
        EngineOwner::CoreHodl
    }

    fn cadence(&self) -> Cadence {
        Cadence::Interval(ChronoDuration::hours(24))
    }

    fn allocation_weight(&self) -> Decimal {
        Decimal::new(60, 2)
    }

    async fn on_tick(&mut self, ctx: &Ctx) -> Result<Vec<ProposedAction>, StrategyError> {
        let mut actions = Vec::new();
        let per_asset_notional = self.params.dca_notional_usd / Decimal::from(self.params.core_assets.len());

        let mut values = Vec::with_capacity(self.params.core_assets.len());
        for asset in &self.params.core_assets {
            let symbol = self.symbol_for(asset);
            let snapshot = ctx.market_snapshot(&symbol).await?;

            if self.due_for_dca(ctx, &symbol).await? {
                let qty = per_asset_notional / snapshot.mark;
                if qty > Decimal::ZERO {
                    actions.push(ProposedAction::new(
                        EngineOwner::CoreHodl,
                        symbol.clone(),
                        OrderSide::Buy,
                        qty,
                        OrderType::Market,
                    ));
                    ctx.set_meta(&symbol, LAST_PURCHASE_KEY, &ctx.now.to_rfc3339()).await?;
                }
            }

            let position_value = ctx
                .positions()
                .await?
                .into_iter()
                .find(|p| p.symbol == symbol)
                .map(|p| p.notional(snapshot.mark))
                .unwrap_or(Decimal::ZERO);
            values.push((symbol, snapshot.mark, position_value));
        }

        let total: Decimal = values.iter().map(|(_, _, v)| *v).sum();
        if total.is_zero() {
            return Ok(actions);
        }
        let target = total / Decimal::from(values.len());

        for (symbol, mark, value) in &values {
            let drift = (*value - target).abs() / total;
            if drift <= self.params.rebalance_drift_pct {
                continue;
            }
            if *value > target {
                // Overweight: sell the excess down to target, unless the ATH guard blocks it.
                if self.ath_guard_blocks_sell(ctx, symbol, *mark).await? {
                    continue;
                }
                let excess_notional = *value - target;
                let qty = excess_notional / mark;
                if qty > Decimal::ZERO {
                    actions.push(ProposedAction::new(
                        EngineOwner::CoreHodl,
                        symbol.clone(),
                        OrderSide::Sell,
                        qty,
                        OrderType::Market,
                    ));
                }
            } else {
                let deficit_notional = target - *value;
                let qty = deficit_notional / mark;
                if qty > Decimal::ZERO {
                    actions.push(ProposedAction::new(
                        EngineOwner::CoreHodl,
                        symbol.clone(),
                        OrderSide::Buy,
                        qty,
                        OrderType::Market,
                    ));
                }
            }
        }

        Ok(actions)
    }

    async fn on_fill(&mut self, _ctx: &Ctx, _fill: &Fill) -> Result<(), StrategyError> {
        Ok(())
    }

    fn min_reaction_interval(&self, _symbol: &str) -> ChronoDuration {
        ChronoDuration::hours(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> CoreHodlParams {
        CoreHodlParams {
            core_assets: vec!["BTC".into(), "ETH".into()],
            dca_notional_usd: Decimal::new(100, 0),
            dca_interval_days: 7,
            rebalance_drift_pct: Decimal::new(10, 2),
            ath_drawdown_sell_guard_pct: Decimal::new(70, 2),
        }
    }

    #[test]
    fn rejects_fewer_than_two_core_assets() {
        let mut p = params();
        p.core_assets = vec!["BTC".into()];
        assert!(CoreHodl::new(p).is_err());
    }

    #[test]
    fn symbol_for_appends_usdt_quote() {
        let hodl = CoreHodl::new(params()).unwrap();
        assert_eq!(hodl.symbol_for("BTC"), "BTC/USDT");
    }
}
