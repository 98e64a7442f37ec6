use thiserror::Error;

/// The top-level error type the runtime surfaces at the CLI boundary.
/// Wraps every lower-layer error via `#[from]`, following the teacher's
/// existing one-enum-per-crate convention (SPEC_FULL.md §7), plus the
/// engine-specific failure modes spec.md §7 names that no lower crate owns:
/// reconciliation mismatches and the kill flag refusing a start.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] configuration::ConfigError),

    #[error("venue error: {0}")]
    Venue(#[from] api_client::error::ApiError),

    #[error("state store error: {0}")]
    Store(#[from] database::DbError),

    #[error("strategy error: {0}")]
    Strategy(#[from] strategies::StrategyError),

    #[error("risk arbiter error: {0}")]
    Risk(#[from] risk::RiskError),

    #[error("executor error: {0}")]
    Executor(#[from] executor::ExecutorError),

    #[error("startup reconciliation found an unresolvable mismatch: {0}")]
    ReconcileMismatch(String),

    #[error("the L4 kill flag is set; refusing to start strategies")]
    KillFlagSet,

    #[error("the state store is unavailable: {0}")]
    StateStoreUnavailable(String),
}
