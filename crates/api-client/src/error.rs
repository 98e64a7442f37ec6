use thiserror::Error;

/// Classification every `Venue` failure must carry, driving the runtime's
/// retry policy (exponential backoff with jitter for `Retryable`/
/// `RateLimited`, zero retries otherwise).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    FatalAuth,
    BadRequest,
    InsufficientFunds,
    RateLimited,
    NotFound,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to build the HTTP request: {0}")]
    RequestBuild(#[from] reqwest::Error),

    #[error("Failed to send request through retry middleware: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    #[error("The API request returned an error ({code}): {msg}")]
    BinanceError { code: i16, msg: String },

    #[error("Failed to deserialize the API response: {0}")]
    Deserialization(String),

    #[error("Invalid data format from API: {0}")]
    InvalidData(String),

    #[error("venue-level circuit breaker is open, rejecting calls until {retry_after_secs}s pass")]
    CircuitOpen { retry_after_secs: u64 },
}

impl ApiError {
    /// Classifies a Binance numeric error code into the retry taxonomy
    /// required of any `Venue` implementor.
    pub fn classify_binance_code(code: i16) -> ErrorKind {
        match code {
            -1021 | -1003 | -1006 | -1007 => ErrorKind::Retryable, // timestamp skew, rate weight, timeouts
            -1015 | -1016 => ErrorKind::RateLimited,
            -2014 | -2015 => ErrorKind::FatalAuth, // bad api key / signature
            -2010 | -2019 => ErrorKind::InsufficientFunds,
            -1121 | -2013 => ErrorKind::NotFound, // unknown symbol / order
            _ => ErrorKind::BadRequest,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::BinanceError { code, .. } => Self::classify_binance_code(*code),
            ApiError::RequestBuild(e) if e.is_timeout() || e.is_connect() => ErrorKind::Retryable,
            ApiError::RequestBuild(_) => ErrorKind::BadRequest,
            ApiError::Middleware(_) => ErrorKind::Retryable,
            ApiError::CircuitOpen { .. } => ErrorKind::Retryable,
            ApiError::Deserialization(_) | ApiError::InvalidData(_) => ErrorKind::BadRequest,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable | ErrorKind::RateLimited)
    }
}
