use thiserror::Error;

/// Programmer-facing errors out of the money model and domain-struct
/// constructors. These surface rather than retry.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid input for {0}: {1}")]
    InvalidInput(String, String),

    #[error("Calculation error: {0}")]
    Calculation(String),

    #[error("failed to parse `{0}` as a decimal: {1}")]
    BadDecimal(String, String),

    #[error("asset tag mismatch: `{0}` vs `{1}`")]
    UnitMismatch(String, String),

    #[error("arithmetic domain error: {0}")]
    ArithDomain(String),
}
