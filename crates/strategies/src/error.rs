use database::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("strategy received invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("indicator calculation failed: {0}")]
    IndicatorError(String),

    #[error("market data error: {0}")]
    Market(#[from] api_client::error::ApiError),

    #[error("state store error: {0}")]
    Store(#[from] DbError),
}
