use core_types::CircuitLevel;
use database::DbError;
use rust_decimal::Decimal;
use thiserror::Error;

/// The rejection/halt taxonomy of spec.md §4.3 and §7. Each pre-trade gate
/// returns exactly one of these on failure; none of them themselves mutate
/// circuit state (only `RiskArbiter::evaluate_drawdown` and
/// `check_daily_loss_cap` do).
#[derive(Error, Debug)]
pub enum RiskError {
    #[error("risk parameters from configuration are invalid: {0}")]
    InvalidParameters(String),

    #[error("engine slot is disabled or paused")]
    OwnerDisabled,

    #[error("notional {notional} exceeds max_position_pct cap {cap}")]
    SizingExceeded { notional: Decimal, cap: Decimal },

    #[error("per-trade risk {risk} exceeds risk_per_trade_pct cap {cap}")]
    PerTradeRiskExceeded { risk: Decimal, cap: Decimal },

    #[error("projected leverage {projected} exceeds engine cap {cap}")]
    LeverageExceeded { projected: Decimal, cap: Decimal },

    #[error("opening this position would bring {count} correlated positions above the configured limit")]
    CorrelationBreach { count: usize },

    #[error("circuit breaker at {0:?} blocks this action")]
    CircuitTripped(CircuitLevel),

    #[error("duplicate action suppressed: within the minimum reaction interval")]
    DuplicateSuppressed,

    #[error("recovery condition not yet met for the current circuit level")]
    RecoveryConditionNotMet,

    #[error("state store error: {0}")]
    Store(#[from] DbError),
}
