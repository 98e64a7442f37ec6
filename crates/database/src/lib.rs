//! # Aegis Database Crate
//!
//! This crate acts as a high-level, application-specific interface to the
//! PostgreSQL database. It is the system's permanent archive.
//!
//! ## Architectural Principles
//!
//! - **Layer 3 Adapter:** encapsulates all database-specific logic and
//!   exposes the `StateStore` port to the rest of the application.
//! - **Asynchronous & Pooled:** all operations are asynchronous, using a
//!   connection pool (`PgPool`) for concurrent database access.
//! - Queries use the runtime-checked `sqlx::query_as` function rather than
//!   the `query_as!` macro, since no live database is available at build
//!   time to generate the compile-time schema cache the macro needs.
//!
//! ## Public API
//!
//! - `connect` / `run_migrations`: establish the pool and apply migrations.
//! - `StateStore`: the port trait; `PostgresStateStore` is its Postgres
//!   implementor.
//! - `DbError`: the specific error types returned from this crate.

pub mod connection;
pub mod error;
pub mod repository;

pub use connection::{connect, run_migrations};
pub use error::DbError;
pub use repository::{PostgresStateStore, StateStore};
