//! Domain models for Cohort.
//!
//! These are the core types shared across all crates.

pub mod group;
pub mod setting;
pub mod user;
