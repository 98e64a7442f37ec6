use configuration::Config;

use crate::error::StrategyError;
use crate::tactical::FixedFearIndex;
use crate::{CoreHodl, Funding, Strategy, Tactical, TrendStrategy};

/// Builds the fixed roster of four hosted strategies from the loaded
/// config. Unlike the teacher's `create_strategy`, which picked one
/// strategy by `StrategyId` for one symbol, this system always builds all
/// four — the roster is closed (spec.md §4.6) and each strategy owns its
/// own symbol list internally.
///
/// `fear_index` is a caller-supplied `FearIndexSource` for TACTICAL; pass
/// `None` to fall back to the deterministic `FixedFearIndex` fixture when no
/// live feed is wired in this deployment.
pub fn create_strategies(
    config: &Config,
    fear_index: Option<Box<dyn crate::tactical::FearIndexSource>>,
) -> Result<Vec<Box<dyn Strategy>>, StrategyError> {
    let fear_index = fear_index.unwrap_or_else(|| Box::new(FixedFearIndex(50)));

    let strategies: Vec<Box<dyn Strategy>> = vec![
        Box::new(CoreHodl::new(config.strategies.core_hodl.clone())?),
        Box::new(TrendStrategy::new(config.strategies.trend.clone())?),
        Box::new(Funding::new(config.strategies.funding.clone(), config.risk.max_position_pct)?),
        Box::new(Tactical::new(config.strategies.tactical.clone(), fear_index)?),
    ];

    Ok(strategies)
}
