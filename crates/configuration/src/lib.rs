use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::error::ConfigError;
use crate::settings::Config;

pub mod error;
pub mod settings;

pub use settings::{
    AlertingConfig, CircuitThresholds, Config, Config as AegisConfig, CoreHodlParams,
    EngineConfig, EnginesConfig, FundingParams, RiskConfig, StrategyParams, TacticalParams,
    TrendParams, VenueConfig,
};

/// Loads and validates the application configuration from `config.toml`
/// (optionally overridden by `CONFIG_PATH`). Refuses to start (returns
/// `ConfigError::ValidationError`) on an invalid combination of fields.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or("config.toml");
    let builder = config::Config::builder()
        .add_source(config::File::with_name(path))
        .add_source(config::Environment::with_prefix("AEGIS").separator("__"))
        .build()?;

    let config = builder.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}

/// Initializes the global `tracing` subscriber from `RUST_LOG`, defaulting to
/// `info` when unset. Called once at process startup before anything else
/// logs.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set, skipping re-initialization");
    }
}
