//! SurrealDB implementation of [`GroupRepository`].

use std::collections::BTreeSet;

use cohort_core::error::CohortResult;
use cohort_core::models::group::{CreateGroup, Group, UpdateGroup};
use cohort_core::models::setting::GroupSetting;
use cohort_core::repository::{GroupRepository, GroupTransaction, PaginatedResult, Pagination};
use surrealdb::{Connection, Surreal};
use tracing::info;
use uuid::Uuid;

use crate::error::DbError;
use crate::record::{CountRow, EdgeRow, GROUP_TABLE, GroupRow, USER_TABLE, record, record_list};
use crate::store::GraphStore;
use crate::transaction::SurrealTransaction;

/// Group repository backed by a [`GraphStore`].
///
/// Mutating methods run as single-change transactions; callers that need
/// several changes to land together use [`GroupRepository::begin`].
pub struct SurrealGroupRepository<C: Connection> {
    store: GraphStore<C>,
}

impl<C: Connection> Clone for SurrealGroupRepository<C> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<C: Connection> SurrealGroupRepository<C> {
    pub fn new(store: GraphStore<C>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &GraphStore<C> {
        &self.store
    }

    fn db(&self) -> &Surreal<C> {
        self.store.db()
    }

    /// Direct edges into `group_ids` from `table`, as (source, target).
    async fn edges_into(
        &self,
        table: &str,
        group_ids: &BTreeSet<Uuid>,
    ) -> Result<Vec<(Uuid, Uuid)>, DbError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT meta::id(in) AS source, meta::id(out) AS target FROM {table} \
             WHERE out IN {}",
            record_list(GROUP_TABLE, group_ids.iter().copied())
        );
        let mut result = self.db().query(query).await?;
        let rows: Vec<EdgeRow> = result.take(0)?;
        rows.iter().map(EdgeRow::ids).collect()
    }

    /// Every group below `group_id`, walked one level per query.
    async fn subgroup_closure(&self, group_id: Uuid) -> Result<BTreeSet<Uuid>, DbError> {
        let mut seen = BTreeSet::new();
        let mut frontier = BTreeSet::from([group_id]);
        while !frontier.is_empty() {
            let edges = self.edges_into("subgroup_of", &frontier).await?;
            frontier = edges
                .into_iter()
                .map(|(subgroup_id, _)| subgroup_id)
                .filter(|id| *id != group_id && seen.insert(*id))
                .collect();
        }
        Ok(seen)
    }
}

impl<C: Connection> GroupRepository for SurrealGroupRepository<C> {
    type Transaction = SurrealTransaction<C>;

    fn begin(&self) -> SurrealTransaction<C> {
        self.store.begin()
    }

    async fn create(&self, input: CreateGroup) -> CohortResult<Group> {
        let mut tx = self.begin();
        let group = tx.insert_group(input);
        tx.commit().await?;

        info!(
            realm_id = %group.realm_id,
            group_id = %group.id,
            kind = ?group.kind,
            "Group created"
        );
        Ok(group)
    }

    async fn get_by_id(&self, realm_id: Uuid, id: Uuid) -> CohortResult<Group> {
        let mut result = self
            .db()
            .query(
                "SELECT meta::id(id) AS record_id, * FROM user_group \
                 WHERE id = type::record('user_group', $id) \
                 AND realm_id = $realm_id",
            )
            .bind(("id", id.to_string()))
            .bind(("realm_id", realm_id.to_string()))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<GroupRow> = result.take(0).map_err(DbError::from)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| DbError::group_not_found(id))?;
        Ok(row.try_into_group()?)
    }

    async fn get_by_name(&self, realm_id: Uuid, name: &str) -> CohortResult<Group> {
        let mut result = self
            .db()
            .query(
                "SELECT meta::id(id) AS record_id, * FROM user_group \
                 WHERE realm_id = $realm_id AND name = $name \
                 AND kind != 'anonymous' LIMIT 1",
            )
            .bind(("realm_id", realm_id.to_string()))
            .bind(("name", name.to_string()))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<GroupRow> = result.take(0).map_err(DbError::from)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| DbError::group_not_found(name))?;
        Ok(row.try_into_group()?)
    }

    async fn update(&self, realm_id: Uuid, id: Uuid, input: UpdateGroup) -> CohortResult<Group> {
        let mut tx = self.begin();
        tx.update_group(realm_id, id, input);
        tx.commit().await?;
        self.get_by_id(realm_id, id).await
    }

    async fn delete(&self, realm_id: Uuid, id: Uuid) -> CohortResult<()> {
        let mut tx = self.begin();
        tx.delete_group(realm_id, id);
        tx.commit().await?;
        self.store.prune_row_locks([id]);

        info!(realm_id = %realm_id, group_id = %id, "Group deleted");
        Ok(())
    }

    async fn list(
        &self,
        realm_id: Uuid,
        pagination: Pagination,
    ) -> CohortResult<PaginatedResult<Group>> {
        let realm_id_str = realm_id.to_string();

        let mut count_result = self
            .db()
            .query(
                "SELECT count() AS total FROM user_group \
                 WHERE realm_id = $realm_id AND kind != 'anonymous' GROUP ALL",
            )
            .bind(("realm_id", realm_id_str.clone()))
            .await
            .map_err(DbError::from)?;
        let count_rows: Vec<CountRow> = count_result.take(0).map_err(DbError::from)?;
        let total = count_rows.first().map(|r| r.total).unwrap_or(0);

        let mut result = self
            .db()
            .query(
                "SELECT meta::id(id) AS record_id, * FROM user_group \
                 WHERE realm_id = $realm_id AND kind != 'anonymous' \
                 ORDER BY created_at ASC, record_id ASC \
                 LIMIT $limit START $offset",
            )
            .bind(("realm_id", realm_id_str))
            .bind(("limit", pagination.limit))
            .bind(("offset", pagination.offset))
            .await
            .map_err(DbError::from)?;

        let rows: Vec<GroupRow> = result.take(0).map_err(DbError::from)?;
        let items = rows
            .into_iter()
            .map(|row| row.try_into_group())
            .collect::<Result<Vec<_>, DbError>>()?;

        Ok(PaginatedResult {
            items,
            total,
            offset: pagination.offset,
            limit: pagination.limit,
        })
    }

    async fn add_members(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> CohortResult<()> {
        let mut tx = self.begin();
        tx.add_members(realm_id, group_id, user_ids.to_vec());
        tx.commit().await
    }

    async fn remove_members(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> CohortResult<()> {
        let mut tx = self.begin();
        tx.remove_members(realm_id, group_id, user_ids.to_vec());
        tx.commit().await
    }

    async fn add_subgroups(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        subgroup_ids: &[Uuid],
    ) -> CohortResult<()> {
        let mut tx = self.begin();
        tx.add_subgroups(realm_id, group_id, subgroup_ids.to_vec());
        tx.commit().await
    }

    async fn remove_subgroups(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        subgroup_ids: &[Uuid],
    ) -> CohortResult<()> {
        let mut tx = self.begin();
        tx.remove_subgroups(realm_id, group_id, subgroup_ids.to_vec());
        tx.commit().await
    }

    async fn direct_member_ids(&self, realm_id: Uuid, group_id: Uuid) -> CohortResult<Vec<Uuid>> {
        self.get_by_id(realm_id, group_id).await?;
        let edges = self
            .edges_into("member_of", &BTreeSet::from([group_id]))
            .await?;
        let members: BTreeSet<Uuid> = edges.into_iter().map(|(user_id, _)| user_id).collect();
        Ok(members.into_iter().collect())
    }

    async fn direct_subgroup_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> CohortResult<Vec<Uuid>> {
        self.get_by_id(realm_id, group_id).await?;
        let edges = self
            .edges_into("subgroup_of", &BTreeSet::from([group_id]))
            .await?;
        let subgroups: BTreeSet<Uuid> = edges.into_iter().map(|(id, _)| id).collect();
        Ok(subgroups.into_iter().collect())
    }

    async fn recursive_subgroup_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> CohortResult<Vec<Uuid>> {
        self.get_by_id(realm_id, group_id).await?;
        Ok(self.subgroup_closure(group_id).await?.into_iter().collect())
    }

    async fn recursive_member_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> CohortResult<Vec<Uuid>> {
        self.get_by_id(realm_id, group_id).await?;
        let mut groups = self.subgroup_closure(group_id).await?;
        groups.insert(group_id);

        let edges = self.edges_into("member_of", &groups).await?;
        let members: BTreeSet<Uuid> = edges.into_iter().map(|(user_id, _)| user_id).collect();
        Ok(members.into_iter().collect())
    }

    async fn is_member(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        user_id: Uuid,
        direct_only: bool,
    ) -> CohortResult<bool> {
        if !direct_only {
            let members = self.recursive_member_ids(realm_id, group_id).await?;
            return Ok(members.binary_search(&user_id).is_ok());
        }

        self.get_by_id(realm_id, group_id).await?;
        let query = format!(
            "SELECT count() AS total FROM member_of \
             WHERE in = {} AND out = {} GROUP ALL",
            record(USER_TABLE, user_id),
            record(GROUP_TABLE, group_id)
        );
        let mut result = self.db().query(query).await.map_err(DbError::from)?;
        let rows: Vec<CountRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.first().map(|r| r.total).unwrap_or(0) > 0)
    }

    async fn referencing_groups(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> CohortResult<Vec<(Group, GroupSetting)>> {
        self.get_by_id(realm_id, group_id).await?;

        let filters: Vec<String> = GroupSetting::ALL
            .iter()
            .map(|setting| format!("settings.{} = $group_id", setting.as_str()))
            .collect();
        let query = format!(
            "SELECT meta::id(id) AS record_id, * FROM user_group \
             WHERE realm_id = $realm_id AND id != {} AND ({})",
            record(GROUP_TABLE, group_id),
            filters.join(" OR ")
        );
        let mut result = self
            .db()
            .query(query)
            .bind(("realm_id", realm_id.to_string()))
            .bind(("group_id", group_id.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<GroupRow> = result.take(0).map_err(DbError::from)?;

        let mut referencing = Vec::new();
        for row in rows {
            let group = row.try_into_group()?;
            for (setting, value) in &group.settings {
                if *value == group_id {
                    referencing.push((group.clone(), *setting));
                }
            }
        }
        referencing.sort_by_key(|(group, setting)| (group.id, *setting));
        Ok(referencing)
    }
}
