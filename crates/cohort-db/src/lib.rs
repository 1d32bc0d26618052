//! Cohort DB: SurrealDB-backed transactional store for the group graph.
//!
//! This crate provides:
//! - Connection management and configuration ([`connect`], [`DbConfig`])
//! - Schema migrations ([`run_migrations`])
//! - The shared store handle and its configuration ([`GraphStore`], [`StoreConfig`])
//! - Transactions with ascending-order row locks ([`SurrealTransaction`])
//! - Repository implementations for the `cohort-core` traits ([`repository`])
//! - Error types ([`DbError`])

mod connection;
mod error;
mod graph;
mod record;
mod schema;
mod store;
mod transaction;

pub mod repository;

pub use connection::{DbConfig, connect};
pub use error::DbError;
pub use schema::run_migrations;
pub use store::{GraphStore, StoreConfig};
pub use transaction::SurrealTransaction;
