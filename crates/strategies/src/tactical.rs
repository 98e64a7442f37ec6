use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use configuration::TacticalParams;
use core_types::{CircuitLevel, EngineOwner, Fill, OrderSide, OrderType, ProposedAction};
use rust_decimal::Decimal;

use crate::error::StrategyError;
use crate::{Cadence, Ctx, Strategy};

const LAST_DEPLOYMENT_KEY: &str = "last_deployment_at";

/// A fear/greed-style market sentiment reading in `0..=100` (0 = extreme
/// fear). TACTICAL's real feed (spec.md §9) is out of scope for this core;
/// this trait is the seam a follow-on integration wires a live source
/// through — the same "architectural skeleton, not yet wired" posture the
/// teacher used for `FundingRateArb`.
#[async_trait]
pub trait FearIndexSource: Send + Sync {
    async fn current_index(&self) -> Result<u8, StrategyError>;
}

/// A constant-reading fixture: deterministic, so tests never flake on an
/// external feed that does not exist yet in this build.
pub struct FixedFearIndex(pub u8);

#[async_trait]
impl FearIndexSource for FixedFearIndex {
    async fn current_index(&self) -> Result<u8, StrategyError> {
        Ok(self.0)
    }
}

/// Deploys the earmarked cash reserve in increments on extreme-fear
/// drawdown-from-ATH events (spec.md §4.6 #4). Goes quiet at circuit levels
/// Alert/Emergency and respects a 30-day minimum interval between
/// deployments, tracked the same way CORE-HODL tracks its DCA cadence.
pub struct Tactical {
    params: TacticalParams,
    fear_index: Box<dyn FearIndexSource>,
}

impl Tactical {
    pub fn new(params: TacticalParams, fear_index: Box<dyn FearIndexSource>) -> Result<Self, StrategyError> {
        Ok(Self { params, fear_index })
    }

    async fn due_for_deployment(&self, ctx: &Ctx) -> Result<bool, StrategyError> {
        let Some(raw) = ctx.get_meta(&self.params.reserve_asset, LAST_DEPLOYMENT_KEY).await? else {
            return Ok(true);
        };
        let Ok(last) = chrono::DateTime::parse_from_rfc3339(&raw) else {
            return Ok(true);
        };
        let interval = ChronoDuration::days(self.params.min_interval_days);
        Ok(ctx.now - last.with_timezone(&chrono::Utc) >= interval)
    }
}

#[async_trait]
impl Strategy for Tactical {
    fn name(&self) -> &'static str {
        "tactical"
    }

    fn owner(&self) -> EngineOwner {
        EngineOwner::Tactical
    }

    fn cadence(&self) -> Cadence {
        Cadence::EventTriggered
    }

    fn allocation_weight(&self) -> Decimal {
        Decimal::new(5, 2)
    }

    async fn on_tick(&mut self, ctx: &Ctx) -> Result<Vec<ProposedAction>, StrategyError> {
        if matches!(ctx.circuit_level, CircuitLevel::Alert | CircuitLevel::Emergency) {
            return Ok(Vec::new());
        }

        let drawdown = ctx.portfolio.drawdown();
        let fear = self.fear_index.current_index().await?;
        let triggered = drawdown > Decimal::ZERO && fear <= self.params.fear_index_entry_threshold;
        if !triggered {
            return Ok(Vec::new());
        }
        if !self.due_for_deployment(ctx).await? {
            return Ok(Vec::new());
        }

        let symbol = format!("BTC/{}", self.params.reserve_asset);
        let snapshot = ctx.market_snapshot(&symbol).await?;
        let qty = self.params.deployment_notional_usd / snapshot.mark;
        if qty <= Decimal::ZERO {
            return Ok(Vec::new());
        }

        ctx.set_meta(&self.params.reserve_asset, LAST_DEPLOYMENT_KEY, &ctx.now.to_rfc3339())
            .await?;

        Ok(vec![ProposedAction::new(
            EngineOwner::Tactical,
            symbol,
            OrderSide::Buy,
            qty,
            OrderType::Market,
        )])
    }

    async fn on_fill(&mut self, _ctx: &Ctx, _fill: &Fill) -> Result<(), StrategyError> {
        Ok(())
    }

    fn min_reaction_interval(&self, _symbol: &str) -> ChronoDuration {
        ChronoDuration::days(self.params.min_interval_days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> TacticalParams {
        TacticalParams {
            reserve_asset: "USDT".into(),
            deployment_notional_usd: Decimal::new(500, 0),
            min_interval_days: 30,
            fear_index_entry_threshold: 20,
        }
    }

    #[tokio::test]
    async fn fixed_fear_index_returns_configured_reading() {
        let source = FixedFearIndex(15);
        assert_eq!(source.current_index().await.unwrap(), 15);
    }

    #[test]
    fn constructs_with_valid_params() {
        let tactical = Tactical::new(params(), Box::new(FixedFearIndex(50)));
        assert!(tactical.is_ok());
    }
}
