//! Database-specific error types and conversions.

use cohort_core::error::CohortError;
use uuid::Uuid;

/// Store-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("SurrealDB error: {0}")]
    Surreal(#[from] surrealdb::Error),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Malformed record: {0}")]
    Decode(String),

    #[error("Record not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Duplicate or missing edge: {0}")]
    Conflict(String),

    #[error("Subgroup edge would make group {supergroup_id} its own subgroup")]
    Cycle { supergroup_id: Uuid },

    #[error("Lock wait timeout on group {id}")]
    LockTimeout { id: Uuid },
}

impl DbError {
    pub(crate) fn group_not_found(id: impl ToString) -> Self {
        DbError::NotFound {
            entity: "group".into(),
            id: id.to_string(),
        }
    }

    pub(crate) fn user_not_found(id: Uuid) -> Self {
        DbError::NotFound {
            entity: "user".into(),
            id: id.to_string(),
        }
    }
}

impl From<DbError> for CohortError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { entity, id } => CohortError::NotFound { entity, id },
            DbError::Constraint(message) => CohortError::Validation { message },
            DbError::Conflict(message) => CohortError::Conflict { message },
            DbError::Cycle { supergroup_id } => CohortError::Cycle { supergroup_id },
            DbError::LockTimeout { id } => CohortError::Contention {
                resource: format!("group:{id}"),
            },
            other => CohortError::Database(other.to_string()),
        }
    }
}
