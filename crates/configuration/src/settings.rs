use std::collections::HashMap;

use chrono::NaiveTime;
use core_types::EngineOwner;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

use crate::error::ConfigError;

/// The root configuration structure for the entire application. Loaded once
/// at startup from `config.toml`; invalid combinations refuse to start
/// (`ConfigError::ValidationError`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub engines: EnginesConfig,
    pub risk: RiskConfig,
    pub venue: VenueConfig,
    /// Static `symbol → owner` map used during startup reconciliation to
    /// assign an owner to a venue position not present in the StateStore.
    /// Ambiguous symbols (absent from this map) fail loudly rather than
    /// guessing.
    pub symbol_owners: HashMap<String, EngineOwner>,
    #[serde(default = "default_daily_reset_utc")]
    pub daily_reset_utc: NaiveTime,
    #[serde(default = "default_dust_threshold")]
    pub dust_threshold_usd: Decimal,
    pub strategies: StrategyParams,
    #[serde(default)]
    pub alerting: AlertingConfig,
}

/// The abstract observability sink's concrete transport (spec.md §6
/// "alerting transport... invoked only at boundaries"). Telegram is the one
/// implementor carried from the teacher's `alerter` crate; an empty token
/// disables alerting gracefully rather than failing to start.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertingConfig {
    #[serde(default)]
    pub telegram_token: String,
    #[serde(default)]
    pub telegram_chat_id: String,
}

fn default_daily_reset_utc() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is always a valid time")
}

fn default_dust_threshold() -> Decimal {
    dec!(1.00)
}

/// Per-engine allocation weight, enabled flag, and leverage cap.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub target_allocation: Decimal,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub max_leverage: Decimal,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnginesConfig {
    pub core_hodl: EngineConfig,
    pub trend: EngineConfig,
    pub funding: EngineConfig,
    pub tactical: EngineConfig,
}

impl EnginesConfig {
    pub fn get(&self, owner: EngineOwner) -> &EngineConfig {
        match owner {
            EngineOwner::CoreHodl => &self.core_hodl,
            EngineOwner::Trend => &self.trend,
            EngineOwner::Funding => &self.funding,
            EngineOwner::Tactical => &self.tactical,
        }
    }

    pub fn allocation_sum(&self) -> Decimal {
        self.core_hodl.target_allocation
            + self.trend.target_allocation
            + self.funding.target_allocation
            + self.tactical.target_allocation
    }
}

/// Pre-trade gate defaults and circuit-breaker thresholds. All fields are
/// decimal fractions (`0.02 == 2%`) per the spec's resolution of the
/// ambiguous-threshold-units open question.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: Decimal,
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade_pct: Decimal,
    #[serde(default = "default_correlation_threshold")]
    pub correlation_threshold: Decimal,
    #[serde(default = "default_max_correlated_positions")]
    pub max_correlated_positions: u32,
    #[serde(default = "default_daily_loss_cap")]
    pub daily_loss_cap_pct: Decimal,
    pub circuit: CircuitThresholds,
}

fn default_max_position_pct() -> Decimal {
    dec!(0.05)
}
fn default_risk_per_trade() -> Decimal {
    dec!(0.01)
}
fn default_correlation_threshold() -> Decimal {
    dec!(0.70)
}
fn default_max_correlated_positions() -> u32 {
    3
}
fn default_daily_loss_cap() -> Decimal {
    dec!(0.02)
}

/// Drawdown thresholds for `Caution`/`Warning`/`Alert`/`Emergency`. Must
/// satisfy `l1 < l2 < l3 < l4`.
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitThresholds {
    #[serde(default = "default_l1")]
    pub l1_caution: Decimal,
    #[serde(default = "default_l2")]
    pub l2_warning: Decimal,
    #[serde(default = "default_l3")]
    pub l3_alert: Decimal,
    #[serde(default = "default_l4")]
    pub l4_emergency: Decimal,
}

fn default_l1() -> Decimal {
    dec!(0.10)
}
fn default_l2() -> Decimal {
    dec!(0.15)
}
fn default_l3() -> Decimal {
    dec!(0.20)
}
fn default_l4() -> Decimal {
    dec!(0.25)
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueConfig {
    pub rest_base_url: String,
    pub ws_base_url: String,
}

/// Parameters for the four hosted strategies. Named after the engines they
/// belong to rather than after the generic technical-indicator families the
/// teacher's config used.
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyParams {
    pub core_hodl: CoreHodlParams,
    pub trend: TrendParams,
    pub funding: FundingParams,
    pub tactical: TacticalParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreHodlParams {
    pub core_assets: Vec<String>,
    pub dca_notional_usd: Decimal,
    pub dca_interval_days: i64,
    pub rebalance_drift_pct: Decimal,
    pub ath_drawdown_sell_guard_pct: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrendParams {
    pub symbols: Vec<String>,
    pub atr_period: usize,
    pub atr_multiplier: Decimal,
    pub trail_atr_multiplier: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FundingParams {
    pub symbols: Vec<String>,
    pub target_rate_threshold: Decimal,
    pub basis_safety_threshold: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TacticalParams {
    pub reserve_asset: String,
    pub deployment_notional_usd: Decimal,
    pub min_interval_days: i64,
    pub fear_index_entry_threshold: u8,
}

impl Config {
    /// Validates cross-field invariants the `Deserialize` impl can't
    /// express: allocation weights summing to 1 ± 0.001 and circuit
    /// thresholds strictly ordered L1 < L2 < L3 < L4. Refuses to start on
    /// violation (exit code 2 at the CLI boundary).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let sum = self.engines.allocation_sum();
        let tolerance = dec!(0.001);
        if (sum - Decimal::ONE).abs() > tolerance {
            return Err(ConfigError::validation(format!(
                "engine target_allocation values must sum to 1 ± 0.001, got {sum}"
            )));
        }

        let c = &self.risk.circuit;
        if !(c.l1_caution < c.l2_warning && c.l2_warning < c.l3_alert && c.l3_alert < c.l4_emergency)
        {
            return Err(ConfigError::validation(format!(
                "circuit thresholds must be strictly increasing, got l1={}, l2={}, l3={}, l4={}",
                c.l1_caution, c.l2_warning, c.l3_alert, c.l4_emergency
            )));
        }

        for (field, value) in [
            ("max_position_pct", self.risk.max_position_pct),
            ("risk_per_trade_pct", self.risk.risk_per_trade_pct),
            ("correlation_threshold", self.risk.correlation_threshold),
            ("daily_loss_cap_pct", self.risk.daily_loss_cap_pct),
        ] {
            if value > Decimal::ONE || value < Decimal::ZERO {
                return Err(ConfigError::validation(format!(
                    "`{field}` must be a fraction in [0, 1], got {value} \
                     (config risk thresholds are decimal fractions, e.g. 0.02 == 2%)"
                )));
            }
        }

        Ok(())
    }
}
