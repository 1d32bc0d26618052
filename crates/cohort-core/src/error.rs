//! Error types for the Cohort group graph.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CohortError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("User group {supergroup_id} is already a subgroup of one of the passed subgroups")]
    Cycle { supergroup_id: Uuid },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Lock wait exhausted. Safe to retry the whole operation.
    #[error("Lock contention on {resource}")]
    Contention { resource: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CohortError {
    pub fn not_found(entity: &str, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the failed operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

pub type CohortResult<T> = Result<T, CohortError>;
