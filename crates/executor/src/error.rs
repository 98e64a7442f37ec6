use api_client::error::ApiError;
use core_types::{EngineOwner, PositionSide};
use database::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("position not found for {symbol} ({owner}, {side:?})")]
    PositionNotFound {
        symbol: String,
        owner: EngineOwner,
        side: PositionSide,
    },

    #[error("fill quantity {requested} exceeds open position size {available}")]
    InvalidClosingQuantity { requested: String, available: String },

    #[error("venue error: {0}")]
    Venue(#[from] ApiError),

    #[error("state store error: {0}")]
    Store(#[from] DbError),

    #[error("leg {0} of an atomic action group failed to submit: {1}")]
    GroupLegFailed(usize, String),
}
