//! SurrealDB user directory.

use cohort_core::error::CohortResult;
use cohort_core::models::user::{CreateUser, User, UserStatus};
use cohort_core::repository::UserRepository;
use surrealdb::{Connection, Surreal};
use tracing::info;
use uuid::Uuid;

use crate::error::DbError;
use crate::record::{USER_TABLE, UserRow, record_list, status_to_str};

/// User lookups for realm scoping, kept separate from the group graph.
pub struct SurrealUserRepository<C: Connection> {
    db: Surreal<C>,
}

impl<C: Connection> Clone for SurrealUserRepository<C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
        }
    }
}

impl<C: Connection> SurrealUserRepository<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self { db }
    }

    pub async fn create(&self, input: CreateUser) -> CohortResult<User> {
        let id = Uuid::new_v4();

        let mut result = self
            .db
            .query(
                "CREATE type::record('user', $id) SET \
                 realm_id = $realm_id, full_name = $full_name, \
                 is_bot = $is_bot, status = $status; \
                 SELECT meta::id(id) AS record_id, * FROM type::record('user', $id);",
            )
            .bind(("id", id.to_string()))
            .bind(("realm_id", input.realm_id.to_string()))
            .bind(("full_name", input.full_name))
            .bind(("is_bot", input.is_bot))
            .bind(("status", status_to_str(UserStatus::Active)))
            .await
            .map_err(DbError::from)?
            .check()
            .map_err(|e| DbError::Query(e.to_string()))?;

        let rows: Vec<UserRow> = result.take(1).map_err(DbError::from)?;
        let user = rows
            .into_iter()
            .next()
            .ok_or_else(|| DbError::user_not_found(id))?
            .try_into_user()?;

        info!(realm_id = %user.realm_id, user_id = %user.id, "User created");
        Ok(user)
    }

    pub async fn set_status(
        &self,
        realm_id: Uuid,
        id: Uuid,
        status: UserStatus,
    ) -> CohortResult<User> {
        let mut result = self
            .db
            .query(
                "UPDATE type::record('user', $id) SET status = $status \
                 WHERE realm_id = $realm_id; \
                 SELECT meta::id(id) AS record_id, * FROM type::record('user', $id) \
                 WHERE realm_id = $realm_id;",
            )
            .bind(("id", id.to_string()))
            .bind(("realm_id", realm_id.to_string()))
            .bind(("status", status_to_str(status)))
            .await
            .map_err(DbError::from)?
            .check()
            .map_err(|e| DbError::Query(e.to_string()))?;

        let rows: Vec<UserRow> = result.take(1).map_err(DbError::from)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| DbError::user_not_found(id))?;
        Ok(row.try_into_user()?)
    }
}

impl<C: Connection> UserRepository for SurrealUserRepository<C> {
    async fn get_by_id(&self, realm_id: Uuid, id: Uuid) -> CohortResult<User> {
        let mut users = self.get_many(realm_id, &[id]).await?;
        users.pop().ok_or_else(|| DbError::user_not_found(id).into())
    }

    async fn get_many(&self, realm_id: Uuid, ids: &[Uuid]) -> CohortResult<Vec<User>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let query = format!(
            "SELECT meta::id(id) AS record_id, * FROM {USER_TABLE} \
             WHERE realm_id = $realm_id AND id IN {}",
            record_list(USER_TABLE, ids.iter().copied())
        );
        let mut result = self
            .db
            .query(query)
            .bind(("realm_id", realm_id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<UserRow> = result.take(0).map_err(DbError::from)?;
        let found = rows
            .into_iter()
            .map(|row| row.try_into_user())
            .collect::<Result<Vec<_>, DbError>>()?;

        ids.iter()
            .map(|id| {
                found
                    .iter()
                    .find(|user| user.id == *id)
                    .cloned()
                    .ok_or_else(|| DbError::user_not_found(*id).into())
            })
            .collect()
    }
}
