//! Staged transactions with row locks.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use cohort_core::error::CohortResult;
use cohort_core::models::group::{CreateGroup, Group, UpdateGroup};
use cohort_core::models::setting::GroupSetting;
use cohort_core::repository::GroupTransaction;
use surrealdb::Connection;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::DbError;
use crate::graph::{Change, GraphState};
use crate::record::{
    GROUP_TABLE, USER_TABLE, fetch_groups, kind_to_str, record, settings_to_value,
};
use crate::store::GraphStore;

/// A transaction against a [`GraphStore`].
///
/// Changes are staged in memory and written by [`GroupTransaction::commit`]
/// as one SurrealDB transaction. Row locks live in `locks` and are released
/// when the transaction is committed or dropped, whichever comes first.
pub struct SurrealTransaction<C: Connection> {
    store: GraphStore<C>,
    changes: Vec<Change>,
    locks: BTreeMap<Uuid, OwnedMutexGuard<()>>,
}

impl<C: Connection> SurrealTransaction<C> {
    pub(crate) fn new(store: GraphStore<C>) -> Self {
        Self {
            store,
            changes: Vec::new(),
            locks: BTreeMap::new(),
        }
    }

    /// Ids of the rows currently locked by this transaction, ascending.
    pub fn locked_ids(&self) -> Vec<Uuid> {
        self.locks.keys().copied().collect()
    }

    pub fn staged_changes(&self) -> usize {
        self.changes.len()
    }

    fn release_locks(&mut self) {
        let held = std::mem::take(&mut self.locks);
        let ids: Vec<Uuid> = held.keys().copied().collect();
        drop(held);
        self.store.prune_row_locks(ids);
    }
}

impl<C: Connection> Drop for SurrealTransaction<C> {
    fn drop(&mut self) {
        self.release_locks();
    }
}

impl<C: Connection> GroupTransaction for SurrealTransaction<C> {
    async fn lock_for_update(
        &mut self,
        realm_id: Uuid,
        ids: &BTreeSet<Uuid>,
    ) -> CohortResult<Vec<Group>> {
        let timeout = self.store.config().lock_wait_timeout();

        for id in ids {
            if self.locks.contains_key(id) {
                continue;
            }
            let lock = self.store.row_lock(*id);
            match tokio::time::timeout(timeout, lock.lock_owned()).await {
                Ok(guard) => {
                    self.locks.insert(*id, guard);
                }
                Err(_) => {
                    warn!(
                        group_id = %id,
                        held = self.locks.len(),
                        "Lock wait timeout, releasing held row locks"
                    );
                    self.release_locks();
                    self.store.prune_row_locks([*id]);
                    return Err(DbError::LockTimeout { id: *id }.into());
                }
            }
        }

        debug!(realm_id = %realm_id, rows = ids.len(), "Row locks acquired");
        Ok(fetch_groups(self.store.db(), realm_id, ids).await?)
    }

    fn insert_group(&mut self, input: CreateGroup) -> Group {
        let now = Utc::now();
        let group = Group {
            id: Uuid::new_v4(),
            realm_id: input.realm_id,
            name: input.name,
            description: input.description,
            kind: input.kind,
            settings: input.settings,
            created_at: now,
            updated_at: now,
        };
        self.changes.push(Change::InsertGroup(group.clone()));
        group
    }

    fn update_group(&mut self, realm_id: Uuid, id: Uuid, input: UpdateGroup) {
        self.changes.push(Change::UpdateGroup {
            realm_id,
            id,
            name: input.name,
            description: input.description,
            at: Utc::now(),
        });
    }

    fn set_setting(&mut self, realm_id: Uuid, id: Uuid, setting: GroupSetting, value: Uuid) {
        self.changes.push(Change::SetSetting {
            realm_id,
            id,
            setting,
            value,
            at: Utc::now(),
        });
    }

    fn add_members(&mut self, realm_id: Uuid, group_id: Uuid, user_ids: Vec<Uuid>) {
        self.changes.push(Change::AddMembers {
            realm_id,
            group_id,
            user_ids,
        });
    }

    fn remove_members(&mut self, realm_id: Uuid, group_id: Uuid, user_ids: Vec<Uuid>) {
        self.changes.push(Change::RemoveMembers {
            realm_id,
            group_id,
            user_ids,
        });
    }

    fn add_subgroups(&mut self, realm_id: Uuid, group_id: Uuid, subgroup_ids: Vec<Uuid>) {
        self.changes.push(Change::AddSubgroups {
            realm_id,
            group_id,
            subgroup_ids,
        });
    }

    fn remove_subgroups(&mut self, realm_id: Uuid, group_id: Uuid, subgroup_ids: Vec<Uuid>) {
        self.changes.push(Change::RemoveSubgroups {
            realm_id,
            group_id,
            subgroup_ids,
        });
    }

    fn delete_group(&mut self, realm_id: Uuid, id: Uuid) {
        self.changes.push(Change::DeleteGroup { realm_id, id });
    }

    async fn commit(mut self) -> CohortResult<()> {
        let changes = std::mem::take(&mut self.changes);
        if changes.is_empty() {
            return Ok(());
        }
        let staged = changes.len();
        let realm_ids: BTreeSet<Uuid> = changes.iter().map(Change::realm_id).collect();

        let _commit = self.store.commit_guard().await;
        let mut view = GraphState::load(self.store.db(), &realm_ids).await?;
        let mut batch = Batch::default();
        for change in &changes {
            if let Err(err) = view.apply(change) {
                debug!(staged, error = %err, "Transaction rejected");
                return Err(err.into());
            }
            batch.write(change)?;
        }

        let mut query = self.store.db().query(batch.sql());
        for (name, value) in batch.params {
            query = query.bind((name, value));
        }
        query
            .await
            .map_err(DbError::from)?
            .check()
            .map_err(|e| DbError::Query(e.to_string()))?;

        debug!(staged, rows_locked = self.locks.len(), "Transaction committed");
        Ok(())
    }
}

/// SurrealQL for one commit, run as a single database transaction.
/// User input only ever travels as bound parameters.
#[derive(Default)]
struct Batch {
    statements: Vec<String>,
    params: Vec<(String, serde_json::Value)>,
}

impl Batch {
    fn param(&mut self, value: impl Into<serde_json::Value>) -> String {
        let name = format!("p{}", self.params.len());
        let placeholder = format!("${name}");
        self.params.push((name, value.into()));
        placeholder
    }

    fn timestamp(&mut self, at: &DateTime<Utc>) -> String {
        let param = self.param(at.to_rfc3339());
        format!("<datetime>{param}")
    }

    fn sql(&self) -> String {
        format!(
            "BEGIN TRANSACTION;\n{}\nCOMMIT TRANSACTION;",
            self.statements.join("\n")
        )
    }

    fn write(&mut self, change: &Change) -> Result<(), DbError> {
        match change {
            Change::InsertGroup(group) => {
                let realm = self.param(group.realm_id.to_string());
                let name = self.param(group.name.clone());
                let description = self.param(group.description.clone());
                let kind = self.param(kind_to_str(group.kind));
                let settings = self.param(settings_to_value(&group.settings)?);
                let created_at = self.timestamp(&group.created_at);
                let updated_at = self.timestamp(&group.updated_at);
                self.statements.push(format!(
                    "CREATE {} SET realm_id = {realm}, name = {name}, \
                     description = {description}, kind = {kind}, \
                     settings = {settings}, created_at = {created_at}, \
                     updated_at = {updated_at};",
                    record(GROUP_TABLE, group.id)
                ));
            }
            Change::UpdateGroup {
                id,
                name,
                description,
                at,
                ..
            } => {
                let mut sets = Vec::new();
                if let Some(name) = name {
                    sets.push(format!("name = {}", self.param(name.clone())));
                }
                if let Some(description) = description {
                    sets.push(format!("description = {}", self.param(description.clone())));
                }
                sets.push(format!("updated_at = {}", self.timestamp(at)));
                self.statements.push(format!(
                    "UPDATE {} SET {};",
                    record(GROUP_TABLE, *id),
                    sets.join(", ")
                ));
            }
            Change::SetSetting {
                id,
                setting,
                value,
                at,
                ..
            } => {
                let value = self.param(value.to_string());
                let updated_at = self.timestamp(at);
                self.statements.push(format!(
                    "UPDATE {} SET settings.{} = {value}, updated_at = {updated_at};",
                    record(GROUP_TABLE, *id),
                    setting.as_str()
                ));
            }
            Change::AddMembers {
                realm_id,
                group_id,
                user_ids,
            } => {
                let realm = self.param(realm_id.to_string());
                for user_id in user_ids {
                    self.statements.push(format!(
                        "RELATE {}->member_of->{} SET realm_id = {realm};",
                        record(USER_TABLE, *user_id),
                        record(GROUP_TABLE, *group_id)
                    ));
                }
            }
            Change::RemoveMembers {
                group_id, user_ids, ..
            } => {
                for user_id in user_ids {
                    self.statements.push(format!(
                        "DELETE member_of WHERE in = {} AND out = {};",
                        record(USER_TABLE, *user_id),
                        record(GROUP_TABLE, *group_id)
                    ));
                }
            }
            Change::AddSubgroups {
                realm_id,
                group_id,
                subgroup_ids,
            } => {
                let realm = self.param(realm_id.to_string());
                for subgroup_id in subgroup_ids {
                    self.statements.push(format!(
                        "RELATE {}->subgroup_of->{} SET realm_id = {realm};",
                        record(GROUP_TABLE, *subgroup_id),
                        record(GROUP_TABLE, *group_id)
                    ));
                }
            }
            Change::RemoveSubgroups {
                group_id,
                subgroup_ids,
                ..
            } => {
                for subgroup_id in subgroup_ids {
                    self.statements.push(format!(
                        "DELETE subgroup_of WHERE in = {} AND out = {};",
                        record(GROUP_TABLE, *subgroup_id),
                        record(GROUP_TABLE, *group_id)
                    ));
                }
            }
            Change::DeleteGroup { id, .. } => {
                let group = record(GROUP_TABLE, *id);
                self.statements.push(format!(
                    "DELETE member_of WHERE out = {group}; \
                     DELETE subgroup_of WHERE in = {group} OR out = {group}; \
                     DELETE {group};"
                ));
            }
        }
        Ok(())
    }
}
