//! Commit-time view of the group graph and the constraint checks run
//! against it before anything is written.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use cohort_core::models::group::Group;
use cohort_core::models::setting::GroupSetting;
use surrealdb::{Connection, Surreal};
use uuid::Uuid;

use crate::error::DbError;
use crate::record::{EdgeRow, GROUP_TABLE, GroupRow};

/// A staged mutation, validated and written at commit time.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    InsertGroup(Group),
    UpdateGroup {
        realm_id: Uuid,
        id: Uuid,
        name: Option<String>,
        description: Option<String>,
        at: DateTime<Utc>,
    },
    SetSetting {
        realm_id: Uuid,
        id: Uuid,
        setting: GroupSetting,
        value: Uuid,
        at: DateTime<Utc>,
    },
    AddMembers {
        realm_id: Uuid,
        group_id: Uuid,
        user_ids: Vec<Uuid>,
    },
    RemoveMembers {
        realm_id: Uuid,
        group_id: Uuid,
        user_ids: Vec<Uuid>,
    },
    AddSubgroups {
        realm_id: Uuid,
        group_id: Uuid,
        subgroup_ids: Vec<Uuid>,
    },
    RemoveSubgroups {
        realm_id: Uuid,
        group_id: Uuid,
        subgroup_ids: Vec<Uuid>,
    },
    DeleteGroup {
        realm_id: Uuid,
        id: Uuid,
    },
}

impl Change {
    pub(crate) fn realm_id(&self) -> Uuid {
        match self {
            Change::InsertGroup(group) => group.realm_id,
            Change::UpdateGroup { realm_id, .. }
            | Change::SetSetting { realm_id, .. }
            | Change::AddMembers { realm_id, .. }
            | Change::RemoveMembers { realm_id, .. }
            | Change::AddSubgroups { realm_id, .. }
            | Change::RemoveSubgroups { realm_id, .. }
            | Change::DeleteGroup { realm_id, .. } => *realm_id,
        }
    }
}

/// Groups and direct edges of the realms a commit touches, as committed.
#[derive(Debug, Default)]
pub(crate) struct GraphState {
    groups: HashMap<Uuid, Group>,
    members: HashMap<Uuid, BTreeSet<Uuid>>,
    subgroups: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl GraphState {
    /// Read every group and edge of `realm_ids`. Runs under the store's
    /// commit lock, so nothing changes between this read and the write.
    pub(crate) async fn load<C: Connection>(
        db: &Surreal<C>,
        realm_ids: &BTreeSet<Uuid>,
    ) -> Result<Self, DbError> {
        let mut state = Self::default();

        for realm_id in realm_ids {
            let mut result = db
                .query(format!(
                    "SELECT meta::id(id) AS record_id, * FROM {GROUP_TABLE} \
                     WHERE realm_id = $realm_id; \
                     SELECT meta::id(in) AS source, meta::id(out) AS target \
                     FROM member_of WHERE realm_id = $realm_id; \
                     SELECT meta::id(in) AS source, meta::id(out) AS target \
                     FROM subgroup_of WHERE realm_id = $realm_id;"
                ))
                .bind(("realm_id", realm_id.to_string()))
                .await?;

            let groups: Vec<GroupRow> = result.take(0)?;
            let members: Vec<EdgeRow> = result.take(1)?;
            let subgroups: Vec<EdgeRow> = result.take(2)?;

            for row in groups {
                let group = row.try_into_group()?;
                state.groups.insert(group.id, group);
            }
            for edge in &members {
                let (user_id, group_id) = edge.ids()?;
                state.members.entry(group_id).or_default().insert(user_id);
            }
            for edge in &subgroups {
                let (subgroup_id, group_id) = edge.ids()?;
                state
                    .subgroups
                    .entry(group_id)
                    .or_default()
                    .insert(subgroup_id);
            }
        }

        Ok(state)
    }

    /// Realm-scoped lookup; groups of other realms do not exist here.
    fn group(&self, realm_id: Uuid, id: Uuid) -> Result<&Group, DbError> {
        self.groups
            .get(&id)
            .filter(|group| group.realm_id == realm_id)
            .ok_or_else(|| DbError::group_not_found(id))
    }

    fn direct_members(&self, id: Uuid) -> BTreeSet<Uuid> {
        self.members.get(&id).cloned().unwrap_or_default()
    }

    fn direct_subgroups(&self, id: Uuid) -> BTreeSet<Uuid> {
        self.subgroups.get(&id).cloned().unwrap_or_default()
    }

    /// All groups reachable from `roots` through subgroup edges, roots
    /// included.
    fn closure(&self, roots: impl IntoIterator<Item = Uuid>) -> BTreeSet<Uuid> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<Uuid> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(children) = self.subgroups.get(&id) {
                stack.extend(children.iter().filter(|child| !seen.contains(*child)));
            }
        }
        seen
    }

    /// First group other than `id` whose settings point at it.
    fn first_referrer(&self, id: Uuid) -> Option<(Uuid, GroupSetting)> {
        self.groups
            .values()
            .filter(|group| group.id != id)
            .flat_map(|group| {
                group
                    .settings
                    .iter()
                    .filter(move |(_, value)| **value == id)
                    .map(move |(setting, _)| (group.id, *setting))
            })
            .min()
    }

    fn check_unique_name(&self, group: &Group, name: &str) -> Result<(), DbError> {
        if group.is_anonymous() {
            return Ok(());
        }
        let taken = self.groups.values().any(|other| {
            other.id != group.id
                && other.realm_id == group.realm_id
                && !other.is_anonymous()
                && other.name == name
        });
        if taken {
            return Err(DbError::Constraint(format!(
                "User group '{name}' already exists."
            )));
        }
        Ok(())
    }

    fn check_setting_targets(&self, group: &Group) -> Result<(), DbError> {
        for target in group.settings.values() {
            self.group(group.realm_id, *target)?;
        }
        Ok(())
    }

    /// Check one change against the view and apply it there, so later
    /// changes of the same commit see its effect.
    pub(crate) fn apply(&mut self, change: &Change) -> Result<(), DbError> {
        match change {
            Change::InsertGroup(group) => {
                if self.groups.contains_key(&group.id) {
                    return Err(DbError::Constraint(format!(
                        "group id {} is already taken",
                        group.id
                    )));
                }
                self.check_unique_name(group, &group.name)?;
                self.check_setting_targets(group)?;
                self.groups.insert(group.id, group.clone());
            }
            Change::UpdateGroup {
                realm_id,
                id,
                name,
                description,
                at,
            } => {
                let mut updated = self.group(*realm_id, *id)?.clone();
                if let Some(name) = name {
                    self.check_unique_name(&updated, name)?;
                    updated.name = name.clone();
                }
                if let Some(description) = description {
                    updated.description = description.clone();
                }
                updated.updated_at = *at;
                self.groups.insert(*id, updated);
            }
            Change::SetSetting {
                realm_id,
                id,
                setting,
                value,
                at,
            } => {
                let mut updated = self.group(*realm_id, *id)?.clone();
                self.group(*realm_id, *value)?;
                updated.settings.insert(*setting, *value);
                updated.updated_at = *at;
                self.groups.insert(*id, updated);
            }
            Change::AddMembers {
                realm_id,
                group_id,
                user_ids,
            } => {
                self.group(*realm_id, *group_id)?;
                let current = self.direct_members(*group_id);
                let mut seen = BTreeSet::new();
                for user_id in user_ids {
                    if current.contains(user_id) || !seen.insert(*user_id) {
                        return Err(DbError::Conflict(format!(
                            "User {user_id} is already a member of this group"
                        )));
                    }
                }
                self.members.entry(*group_id).or_default().extend(seen);
            }
            Change::RemoveMembers {
                realm_id,
                group_id,
                user_ids,
            } => {
                self.group(*realm_id, *group_id)?;
                let current = self.direct_members(*group_id);
                let mut seen = BTreeSet::new();
                for user_id in user_ids {
                    if !current.contains(user_id) || !seen.insert(*user_id) {
                        return Err(DbError::Conflict(format!(
                            "There is no member '{user_id}' in this user group"
                        )));
                    }
                }
                if let Some(members) = self.members.get_mut(group_id) {
                    members.retain(|user_id| !seen.contains(user_id));
                }
            }
            Change::AddSubgroups {
                realm_id,
                group_id,
                subgroup_ids,
            } => {
                self.group(*realm_id, *group_id)?;
                let current = self.direct_subgroups(*group_id);
                let mut seen = BTreeSet::new();
                for subgroup_id in subgroup_ids {
                    self.group(*realm_id, *subgroup_id)?;
                    if current.contains(subgroup_id) || !seen.insert(*subgroup_id) {
                        return Err(DbError::Conflict(format!(
                            "User group {subgroup_id} is already a subgroup of this group."
                        )));
                    }
                }
                if self.closure(seen.iter().copied()).contains(group_id) {
                    return Err(DbError::Cycle {
                        supergroup_id: *group_id,
                    });
                }
                self.subgroups.entry(*group_id).or_default().extend(seen);
            }
            Change::RemoveSubgroups {
                realm_id,
                group_id,
                subgroup_ids,
            } => {
                self.group(*realm_id, *group_id)?;
                let current = self.direct_subgroups(*group_id);
                let mut seen = BTreeSet::new();
                for subgroup_id in subgroup_ids {
                    if !current.contains(subgroup_id) || !seen.insert(*subgroup_id) {
                        return Err(DbError::Conflict(format!(
                            "User group {subgroup_id} is not a subgroup of this group."
                        )));
                    }
                }
                if let Some(subgroups) = self.subgroups.get_mut(group_id) {
                    subgroups.retain(|subgroup_id| !seen.contains(subgroup_id));
                }
            }
            Change::DeleteGroup { realm_id, id } => {
                self.group(*realm_id, *id)?;
                if let Some((referrer, setting)) = self.first_referrer(*id) {
                    return Err(DbError::Constraint(format!(
                        "User group {id} is used by setting '{setting}' of group {referrer}"
                    )));
                }
                self.groups.remove(id);
                self.members.remove(id);
                self.subgroups.remove(id);
                for children in self.subgroups.values_mut() {
                    children.remove(id);
                }
            }
        }
        Ok(())
    }
}
