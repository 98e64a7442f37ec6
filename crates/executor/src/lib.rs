//! # Aegis Executor Crate
//!
//! The Position/Order state machine: the layer between the Risk Arbiter's
//! approval and the `Venue`. Every approved action is submitted here exactly
//! once; every venue fill is applied here exactly once.
//!
//! ## Architectural Principles
//!
//! - **State vs. submission decoupling:** `PositionBook` is a pure in-memory
//!   calculator over fills (average-entry-price recompute, open/close
//!   detection); `VenueExecutor` is the only thing that talks to the network
//!   and to `StateStore`, and is the only writer of `PositionBook`.
//! - **Atomic leg groups:** FUNDING's long-spot/short-perp pair submits
//!   through `submit_group`, which unwinds already-placed legs if a later
//!   leg fails.
//!
//! ## Public API
//!
//! - `Executor`: the submission/fill-application trait.
//! - `VenueExecutor`: its sole implementor, backed by a live `Venue` + `StateStore`.
//! - `PositionBook`: the in-memory position cache `Executor` maintains.
//! - `ExecutorError`: the specific error types returned from this crate.

pub mod error;
pub mod exchange;
pub mod portfolio;

pub use error::ExecutorError;
pub use exchange::{Executor, VenueExecutor};
pub use portfolio::{FillOutcome, PositionBook};
