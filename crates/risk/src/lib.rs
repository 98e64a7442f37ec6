//! # Aegis Risk Crate
//!
//! The portfolio risk arbiter: the single seven-gate pre-trade checkpoint and
//! the owner of the four-level circuit breaker (spec.md §2, §4.3). No
//! strategy submits an action directly to the `Executor` — every proposal
//! passes through `RiskArbiter::approve` first.
//!
//! Combines fixed-fractional position sizing against a single stop-loss with
//! a global drawdown halt into the full gate chain and tiered
//! circuit-breaker matrix.

pub mod arbiter;
pub mod correlation;
pub mod error;

pub use arbiter::RiskArbiter;
pub use correlation::PriceHistory;
pub use error::RiskError;
