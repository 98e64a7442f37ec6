use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use configuration::TrendParams;
use core_types::{EngineOwner, Fill, OrderSide, OrderType, PositionSide, ProposedAction};
use rust_decimal::prelude::*;
use ta::indicators::AverageTrueRange;
use ta::Next as _;

use crate::error::StrategyError;
use crate::{Cadence, Ctx, Strategy};

const TRAILING_STOP_KEY: &str = "trailing_stop";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum BandTrend {
    Up,
    Down,
}

/// Evaluates perpetual-futures symbols for ATR-band trend flips, opens with
/// a required stop on a flip, and trails the stop while in position
/// (spec.md §4.6 #2). Holds at most one position per symbol — doubling up is
/// the Arbiter idempotency gate's job to reject, not this strategy's.
///
/// Same ATR-band/flip-detection core as a classic SuperTrend strategy, but
/// driven off `Kline` history fetched through `Ctx` each tick (rather than
/// one bar streamed in) and producing `ProposedAction`s with a mandatory
/// stop instead of a bare signal.
pub struct Trend {
    params: TrendParams,
}

impl Trend {
    pub fn new(params: TrendParams) -> Result<Self, StrategyError> {
        if params.atr_period == 0 {
            return Err(StrategyError::InvalidParameters(
                "trend.atr_period must be non-zero".into(),
            ));
        }
        Ok(Self { params })
    }

    /// Replays recent closed bars through a fresh ATR/band calculator and
    /// returns `(last_close, atr, trend)`. Recomputing from scratch each
    /// tick avoids carrying indicator state across restarts — this engine
    /// must survive unattended restarts without a durable indicator cache.
    fn bands(&self, klines: &[core_types::Kline]) -> Option<(Decimal, f64, BandTrend)> {
        if klines.len() < self.params.atr_period + 2 {
            return None;
        }
        let mut atr = AverageTrueRange::new(self.params.atr_period).ok()?;
        let multiplier = self.params.atr_multiplier.to_f64().unwrap_or(3.0);
        let mut upper = 0.0_f64;
        let mut lower = 0.0_f64;
        let mut trend = BandTrend::Up;
        let mut last_atr = 0.0_f64;

        for bar in klines {
            let high = bar.high.to_f64()?;
            let low = bar.low.to_f64()?;
            let close = bar.close.to_f64()?;
            let current_atr = atr.next(close);
            let hl2 = (high + low) / 2.0;
            let basic_upper = hl2 + multiplier * current_atr;
            let basic_lower = hl2 - multiplier * current_atr;

            let (new_upper, new_lower, new_trend) = match trend {
                BandTrend::Up if close > lower => (basic_upper, basic_lower.max(lower), BandTrend::Up),
                BandTrend::Up => (basic_upper, basic_lower, BandTrend::Down),
                BandTrend::Down if close < upper => (basic_upper.min(upper), basic_lower, BandTrend::Down),
                BandTrend::Down => (basic_upper, basic_lower, BandTrend::Up),
            };
            upper = new_upper;
            lower = new_lower;
            trend = new_trend;
            last_atr = current_atr;
        }

        let last_close = klines.last().unwrap().close;
        Some((last_close, last_atr, trend))
    }
}

#[async_trait]
impl Strategy for Trend {
    fn name(&self) -> &'static str {
        "trend"
    }

    fn owner(&self) -> EngineOwner {
        EngineOwner::Trend
    }

    fn cadence(&self) -> Cadence {
        Cadence::Interval(ChronoDuration::hours(4))
    }

    fn allocation_weight(&self) -> Decimal {
        Decimal::new(20, 2)
    }

    async fn on_tick(&mut self, ctx: &Ctx) -> Result<Vec<ProposedAction>, StrategyError> {
        let mut actions = Vec::new();
        let window_start = ctx.now - ChronoDuration::hours(4 * (self.params.atr_period as i64 + 10));

        for symbol in &self.params.symbols {
            let klines = ctx.klines(symbol, "4h", window_start, ctx.now).await?;
            let Some((close, atr, trend)) = self.bands(&klines) else {
                continue;
            };
            let atr_decimal = Decimal::from_f64(atr).unwrap_or(Decimal::ZERO);

            let existing = ctx.positions().await?.into_iter().find(|p| p.symbol == *symbol);

            match existing {
                None => {
                    let (side, stop) = match trend {
                        BandTrend::Up => (OrderSide::Buy, close - self.params.atr_multiplier * atr_decimal),
                        BandTrend::Down => (OrderSide::Sell, close + self.params.atr_multiplier * atr_decimal),
                    };
                    let mut action = ProposedAction::new(
                        EngineOwner::Trend,
                        symbol.clone(),
                        side,
                        Decimal::ONE,
                        OrderType::Market,
                    );
                    action.stop_price = Some(stop);
                    action.limit_price = Some(close);
                    actions.push(action);
                    ctx.set_meta(symbol, TRAILING_STOP_KEY, &stop.to_string()).await?;
                }
                Some(position) => {
                    let trail_distance = self.params.trail_atr_multiplier * atr_decimal;
                    let candidate_stop = match position.side {
                        PositionSide::Long => close - trail_distance,
                        PositionSide::Short => close + trail_distance,
                    };
                    let prior_stop = ctx
                        .get_meta(symbol, TRAILING_STOP_KEY)
                        .await?
                        .and_then(|v| v.parse::<Decimal>().ok())
                        .unwrap_or(candidate_stop);
                    let new_stop = match position.side {
                        PositionSide::Long => candidate_stop.max(prior_stop),
                        PositionSide::Short => candidate_stop.min(prior_stop),
                    };
                    if new_stop != prior_stop {
                        ctx.set_meta(symbol, TRAILING_STOP_KEY, &new_stop.to_string()).await?;
                    }

                    let stopped_out = match position.side {
                        PositionSide::Long => close <= new_stop,
                        PositionSide::Short => close >= new_stop,
                    };
                    let reversed = match (position.side, trend) {
                        (PositionSide::Long, BandTrend::Down) => true,
                        (PositionSide::Short, BandTrend::Up) => true,
                        _ => false,
                    };

                    if stopped_out || reversed {
                        let closing_side = match position.side {
                            PositionSide::Long => OrderSide::Sell,
                            PositionSide::Short => OrderSide::Buy,
                        };
                        let mut action = ProposedAction::new(
                            EngineOwner::Trend,
                            symbol.clone(),
                            closing_side,
                            position.size,
                            OrderType::Market,
                        );
                        action.reduce_only = true;
                        actions.push(action);
                    }
                }
            }
        }

        Ok(actions)
    }

    async fn on_fill(&mut self, _ctx: &Ctx, _fill: &Fill) -> Result<(), StrategyError> {
        Ok(())
    }

    fn min_reaction_interval(&self, _symbol: &str) -> ChronoDuration {
        ChronoDuration::hours(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn params() -> TrendParams {
        TrendParams {
            symbols: vec!["BTC/USDT".into()],
            atr_period: 3,
            atr_multiplier: dec!(3.0),
            trail_atr_multiplier: dec!(1.5),
        }
    }

    fn bar(i: i64, close: Decimal) -> core_types::Kline {
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + ChronoDuration::hours(4 * i);
        core_types::Kline {
            symbol: "BTC/USDT".into(),
            open_time: t,
            open: close,
            high: close + dec!(10),
            low: close - dec!(10),
            close,
            volume: dec!(1),
            close_time: t + ChronoDuration::hours(4),
            interval: "4h".into(),
        }
    }

    #[test]
    fn rejects_zero_atr_period() {
        let mut p = params();
        p.atr_period = 0;
        assert!(Trend::new(p).is_err());
    }

    #[test]
    fn bands_need_enough_history() {
        let trend = Trend::new(params()).unwrap();
        let klines: Vec<_> = (0..2).map(|i| bar(i, dec!(20000))).collect();
        assert!(trend.bands(&klines).is_none());
    }

    #[test]
    fn bands_resolve_with_enough_history() {
        let trend = Trend::new(params()).unwrap();
        let klines: Vec<_> = (0..10).map(|i| bar(i, dec!(20000) + Decimal::from(i * 50))).collect();
        assert!(trend.bands(&klines).is_some());
    }
}
