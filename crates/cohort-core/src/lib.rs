//! Cohort Core: domain models, error taxonomy and repository traits
//! shared by the store and service crates.

pub mod error;
pub mod models;
pub mod repository;
