//! Group mutation service: business rules over the group graph.

use std::collections::{BTreeMap, BTreeSet};

use cohort_core::error::{CohortError, CohortResult};
use cohort_core::models::group::{
    CreateGroup, Group, GroupKind, GroupSummary, SystemGroup, UpdateGroup,
};
use cohort_core::models::setting::{GroupSetting, SettingValue};
use cohort_core::models::user::User;
use cohort_core::repository::{GroupRepository, GroupTransaction, Pagination, UserRepository};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::access::{access_group, access_group_for_write};
use crate::config::ServiceConfig;
use crate::error::RuleViolation;
use crate::lock::RecursiveLockCoordinator;
use crate::notify::{MembershipChange, MembershipNotification, Notifier};
use crate::resolver::SettingValueResolver;

/// Input for creating a named group.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub members: Vec<Uuid>,
    /// Settings left out fall back to their configured system group.
    #[serde(default)]
    pub settings: BTreeMap<GroupSetting, SettingValue>,
}

/// Partial update of a named group. Omitted fields are left alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateGroupRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub settings: BTreeMap<GroupSetting, SettingValue>,
}

impl UpdateGroupRequest {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.settings.is_empty()
    }
}

/// User-group management.
///
/// Generic over repository implementations so the business rules do not
/// depend on the storage crate. Every mutation runs in one transaction;
/// structural changes additionally hold a [`RecursiveLockCoordinator`] lock.
pub struct GroupService<G: GroupRepository, U: UserRepository, N: Notifier> {
    groups: G,
    users: U,
    notifier: N,
    config: ServiceConfig,
}

impl<G: GroupRepository, U: UserRepository, N: Notifier> GroupService<G, U, N> {
    pub fn new(groups: G, users: U, notifier: N, config: ServiceConfig) -> Self {
        Self {
            groups,
            users,
            notifier,
            config,
        }
    }

    fn resolver(&self) -> SettingValueResolver<'_, G, U> {
        SettingValueResolver::new(&self.groups, &self.users)
    }

    fn coordinator(&self) -> RecursiveLockCoordinator<'_, G> {
        RecursiveLockCoordinator::new(&self.groups, self.config.max_lock_rounds)
    }

    // -----------------------------------------------------------------------
    // Realm bootstrap
    // -----------------------------------------------------------------------

    /// Create the role groups of a realm and chain them from narrowest to
    /// widest. Groups that already exist are kept, so running this twice is
    /// harmless.
    pub async fn create_system_groups(&self, realm_id: Uuid) -> CohortResult<Vec<Group>> {
        let mut tx = self.groups.begin();
        let mut roles = Vec::with_capacity(SystemGroup::ALL.len());
        let mut created = BTreeSet::new();

        for role in SystemGroup::ALL {
            let group = match self.groups.get_by_name(realm_id, role.name()).await {
                Ok(group) => group,
                Err(CohortError::NotFound { .. }) => {
                    let group = tx.insert_group(CreateGroup {
                        realm_id,
                        name: role.name().into(),
                        description: role.description().into(),
                        kind: GroupKind::System,
                        settings: BTreeMap::new(),
                    });
                    created.insert(group.id);
                    group
                }
                Err(e) => return Err(e),
            };
            roles.push((role, group));
        }

        for (role, group) in &roles {
            let Some(parent) = role.parent() else {
                continue;
            };
            let Some((_, parent_group)) = roles.iter().find(|(r, _)| *r == parent) else {
                continue;
            };
            if created.contains(&group.id) || created.contains(&parent_group.id) {
                tx.add_subgroups(realm_id, parent_group.id, vec![group.id]);
            }
        }

        tx.commit().await?;
        if !created.is_empty() {
            info!(realm_id = %realm_id, created = created.len(), "System groups created");
        }
        Ok(roles.into_iter().map(|(_, group)| group).collect())
    }

    // -----------------------------------------------------------------------
    // Group lifecycle
    // -----------------------------------------------------------------------

    pub async fn create_group(
        &self,
        acting_user: &User,
        request: CreateGroupRequest,
    ) -> CohortResult<Group> {
        let realm_id = acting_user.realm_id;
        let name = self.check_name(realm_id, &request.name, None).await?;
        self.check_description(&request.description)?;

        let members = dedup(&request.members);
        self.users.get_many(realm_id, &members).await?;

        let resolver = self.resolver();
        let mut tx = self.groups.begin();
        let mut settings = BTreeMap::new();
        for setting in GroupSetting::ALL {
            let value = match request.settings.get(&setting) {
                Some(value) => {
                    resolver
                        .resolve(&mut tx, acting_user, setting, value.clone())
                        .await?
                }
                None => {
                    let default = setting.config().default_group;
                    self.groups.get_by_name(realm_id, default.name()).await?.id
                }
            };
            settings.insert(setting, value);
        }

        let group = tx.insert_group(CreateGroup {
            realm_id,
            name,
            description: request.description,
            kind: GroupKind::Named,
            settings,
        });
        if !members.is_empty() {
            tx.add_members(realm_id, group.id, members.clone());
        }
        tx.commit().await?;

        info!(
            realm_id = %realm_id,
            group_id = %group.id,
            acting_user_id = %acting_user.id,
            members = members.len(),
            "User group created"
        );
        Ok(group)
    }

    /// Apply the supplied fields. Name and description are only written
    /// when they differ, and a setting only when its value changes.
    pub async fn update_group(
        &self,
        acting_user: &User,
        group_id: Uuid,
        request: UpdateGroupRequest,
    ) -> CohortResult<Group> {
        if request.is_empty() {
            return Err(RuleViolation::NoNewData.into());
        }
        let realm_id = acting_user.realm_id;
        access_group_for_write(&self.groups, realm_id, group_id).await?;

        let mut tx = self.groups.begin();
        let group = lock_group(&mut tx, realm_id, group_id).await?;

        let mut update = UpdateGroup::default();
        if let Some(name) = request.name.filter(|name| *name != group.name) {
            update.name = Some(self.check_name(realm_id, &name, Some(group.id)).await?);
        }
        if let Some(description) = request.description.filter(|d| *d != group.description) {
            self.check_description(&description)?;
            update.description = Some(description);
        }
        if !update.is_empty() {
            tx.update_group(realm_id, group.id, update);
        }

        let resolver = self.resolver();
        let mut replaced = Vec::new();
        for (setting, value) in request.settings {
            let current = group.settings.get(&setting).copied();
            if let Some(current) = current {
                if !resolver.setting_changed(realm_id, current, &value).await? {
                    continue;
                }
            }
            let resolved = resolver.resolve(&mut tx, acting_user, setting, value).await?;
            tx.set_setting(realm_id, group.id, setting, resolved);
            replaced.extend(current);
        }

        // Anonymous groups belong to the setting that pointed at them.
        for id in replaced {
            if self.groups.get_by_id(realm_id, id).await?.is_anonymous() {
                tx.delete_group(realm_id, id);
            }
        }

        tx.commit().await?;
        info!(
            realm_id = %realm_id,
            group_id = %group.id,
            acting_user_id = %acting_user.id,
            "User group updated"
        );
        self.groups.get_by_id(realm_id, group.id).await
    }

    /// Delete a named group together with the anonymous groups backing its
    /// settings. The group and its recursive subgroups stay locked until
    /// the delete commits.
    pub async fn delete_group(&self, acting_user: &User, group_id: Uuid) -> CohortResult<()> {
        let realm_id = acting_user.realm_id;
        access_group_for_write(&self.groups, realm_id, group_id).await?;

        let mut locked = self
            .coordinator()
            .lock_subgraph(realm_id, &[group_id], group_id)
            .await?;

        let referencing = self.groups.referencing_groups(realm_id, group_id).await?;
        if let Some((referrer, setting)) = referencing.into_iter().next() {
            return Err(RuleViolation::GroupInUse {
                group_id,
                setting,
                referenced_by: referrer.id,
            }
            .into());
        }

        let mut owned = Vec::new();
        for id in locked.supergroup.settings.values() {
            if self.groups.get_by_id(realm_id, *id).await?.is_anonymous() {
                owned.push(*id);
            }
        }

        let tx = locked.transaction();
        tx.delete_group(realm_id, group_id);
        for id in &owned {
            tx.delete_group(realm_id, *id);
        }
        locked.commit().await?;

        info!(
            realm_id = %realm_id,
            group_id = %group_id,
            acting_user_id = %acting_user.id,
            anonymous_groups = owned.len(),
            "User group deleted"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    pub async fn add_members(
        &self,
        acting_user: &User,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> CohortResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.change_members(acting_user, group_id, user_ids, &[]).await
    }

    pub async fn remove_members(
        &self,
        acting_user: &User,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> CohortResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        self.change_members(acting_user, group_id, &[], user_ids).await
    }

    /// Add and remove members in one transaction.
    pub async fn update_members(
        &self,
        acting_user: &User,
        group_id: Uuid,
        add: &[Uuid],
        delete: &[Uuid],
    ) -> CohortResult<()> {
        if add.is_empty() && delete.is_empty() {
            return Err(RuleViolation::NothingToDo.into());
        }
        self.change_members(acting_user, group_id, add, delete).await
    }

    async fn change_members(
        &self,
        acting_user: &User,
        group_id: Uuid,
        add: &[Uuid],
        delete: &[Uuid],
    ) -> CohortResult<()> {
        let realm_id = acting_user.realm_id;
        access_group_for_write(&self.groups, realm_id, group_id).await?;

        let add = dedup(add);
        let delete = dedup(delete);
        let added_users = self.users.get_many(realm_id, &add).await?;
        let removed_users = self.users.get_many(realm_id, &delete).await?;

        // Membership edges never change the subgroup graph, so the group
        // row is the only lock needed.
        let mut tx = self.groups.begin();
        let group = lock_group(&mut tx, realm_id, group_id).await?;
        let current: BTreeSet<Uuid> = self
            .groups
            .direct_member_ids(realm_id, group_id)
            .await?
            .into_iter()
            .collect();

        if let Some(user_id) = add.iter().find(|id| current.contains(*id)) {
            return Err(RuleViolation::AlreadyMember { user_id: *user_id }.into());
        }
        if let Some(user_id) = delete.iter().find(|id| !current.contains(*id)) {
            return Err(RuleViolation::NotAMember { user_id: *user_id }.into());
        }

        if !add.is_empty() {
            tx.add_members(realm_id, group_id, add.clone());
        }
        if !delete.is_empty() {
            tx.remove_members(realm_id, group_id, delete.clone());
        }
        tx.commit().await?;

        info!(
            realm_id = %realm_id,
            group_id = %group_id,
            acting_user_id = %acting_user.id,
            added = add.len(),
            removed = delete.len(),
            "User group membership updated"
        );

        self.notify_members(acting_user, &group, &added_users, MembershipChange::Added);
        self.notify_members(acting_user, &group, &removed_users, MembershipChange::Removed);
        Ok(())
    }

    /// Tell affected users about the change. The acting user, bots and
    /// deactivated users are skipped.
    fn notify_members(
        &self,
        acting_user: &User,
        group: &Group,
        users: &[User],
        change: MembershipChange,
    ) {
        let recipients = users
            .iter()
            .filter(|user| user.id != acting_user.id && !user.is_bot && user.is_active());
        for recipient in recipients {
            self.notifier.notify(MembershipNotification {
                realm_id: group.realm_id,
                group_id: group.id,
                group_name: group.name.clone(),
                acting_user_id: acting_user.id,
                acting_user_name: acting_user.full_name.clone(),
                recipient_id: recipient.id,
                change,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Subgroups
    // -----------------------------------------------------------------------

    pub async fn add_subgroups(
        &self,
        acting_user: &User,
        group_id: Uuid,
        subgroup_ids: &[Uuid],
    ) -> CohortResult<()> {
        if subgroup_ids.is_empty() {
            return Ok(());
        }
        self.change_subgroups(acting_user, group_id, subgroup_ids, &[]).await
    }

    /// Removing still locks the recursive closure of the removed groups so
    /// it orders against concurrent additions over the same region.
    pub async fn remove_subgroups(
        &self,
        acting_user: &User,
        group_id: Uuid,
        subgroup_ids: &[Uuid],
    ) -> CohortResult<()> {
        if subgroup_ids.is_empty() {
            return Ok(());
        }
        self.change_subgroups(acting_user, group_id, &[], subgroup_ids).await
    }

    /// Add and remove subgroups under a single subgraph lock.
    pub async fn update_subgroups(
        &self,
        acting_user: &User,
        group_id: Uuid,
        add: &[Uuid],
        delete: &[Uuid],
    ) -> CohortResult<()> {
        if add.is_empty() && delete.is_empty() {
            return Err(RuleViolation::NothingToDo.into());
        }
        self.change_subgroups(acting_user, group_id, add, delete).await
    }

    async fn change_subgroups(
        &self,
        acting_user: &User,
        group_id: Uuid,
        add: &[Uuid],
        delete: &[Uuid],
    ) -> CohortResult<()> {
        let realm_id = acting_user.realm_id;
        access_group_for_write(&self.groups, realm_id, group_id).await?;

        let add = dedup(add);
        let delete = dedup(delete);
        let candidates: Vec<Uuid> = add.iter().chain(&delete).copied().collect();

        let mut locked = self
            .coordinator()
            .lock_subgraph(realm_id, &candidates, group_id)
            .await?;

        let existing = locked.supergroup_subgroup_ids();
        if let Some(id) = add.iter().find(|id| existing.contains(*id)) {
            return Err(RuleViolation::AlreadySubgroup { group_id: *id }.into());
        }
        if locked.would_create_cycle(&add) {
            return Err(RuleViolation::WouldCreateCycle { group_id }.into());
        }
        if let Some(id) = delete.iter().find(|id| !existing.contains(*id)) {
            return Err(RuleViolation::NotASubgroup { group_id: *id }.into());
        }

        let tx = locked.transaction();
        if !add.is_empty() {
            tx.add_subgroups(realm_id, group_id, add.clone());
        }
        if !delete.is_empty() {
            tx.remove_subgroups(realm_id, group_id, delete.clone());
        }
        locked.commit().await?;

        info!(
            realm_id = %realm_id,
            group_id = %group_id,
            acting_user_id = %acting_user.id,
            added = add.len(),
            removed = delete.len(),
            "User group subgroups updated"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn is_member(
        &self,
        acting_user: &User,
        group_id: Uuid,
        user_id: Uuid,
        direct_only: bool,
    ) -> CohortResult<bool> {
        let realm_id = acting_user.realm_id;
        access_group(&self.groups, realm_id, group_id).await?;
        self.users.get_by_id(realm_id, user_id).await?;
        self.groups.is_member(realm_id, group_id, user_id, direct_only).await
    }

    pub async fn list_members(
        &self,
        acting_user: &User,
        group_id: Uuid,
        direct_only: bool,
    ) -> CohortResult<Vec<Uuid>> {
        let realm_id = acting_user.realm_id;
        access_group(&self.groups, realm_id, group_id).await?;
        if direct_only {
            self.groups.direct_member_ids(realm_id, group_id).await
        } else {
            self.groups.recursive_member_ids(realm_id, group_id).await
        }
    }

    pub async fn list_subgroups(
        &self,
        acting_user: &User,
        group_id: Uuid,
        direct_only: bool,
    ) -> CohortResult<Vec<Uuid>> {
        let realm_id = acting_user.realm_id;
        access_group(&self.groups, realm_id, group_id).await?;
        if direct_only {
            self.groups.direct_subgroup_ids(realm_id, group_id).await
        } else {
            self.groups.recursive_subgroup_ids(realm_id, group_id).await
        }
    }

    pub async fn get_group(
        &self,
        acting_user: &User,
        group_id: Uuid,
    ) -> CohortResult<GroupSummary> {
        let group = access_group(&self.groups, acting_user.realm_id, group_id).await?;
        self.summarize(group).await
    }

    /// Every named and system group of the acting user's realm, oldest
    /// first, with settings rendered the way API callers send them.
    pub async fn list_groups(&self, acting_user: &User) -> CohortResult<Vec<GroupSummary>> {
        let realm_id = acting_user.realm_id;
        let mut pagination = Pagination::default();
        let mut summaries = Vec::new();

        loop {
            let page = self.groups.list(realm_id, pagination.clone()).await?;
            let fetched = page.items.len() as u64;
            for group in page.items {
                summaries.push(self.summarize(group).await?);
            }
            pagination.offset += fetched;
            if fetched == 0 || pagination.offset >= page.total {
                break;
            }
        }

        Ok(summaries)
    }

    async fn summarize(&self, group: Group) -> CohortResult<GroupSummary> {
        let realm_id = group.realm_id;
        let direct_members = self.groups.direct_member_ids(realm_id, group.id).await?;
        let direct_subgroups = self.groups.direct_subgroup_ids(realm_id, group.id).await?;

        let resolver = self.resolver();
        let mut settings = BTreeMap::new();
        for (setting, value) in &group.settings {
            settings.insert(*setting, resolver.api_value(realm_id, *value).await?);
        }

        Ok(GroupSummary {
            group,
            direct_members,
            direct_subgroups,
            settings,
        })
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Trim and validate a group name. `current` is the group being
    /// renamed, which may keep its own name.
    async fn check_name(
        &self,
        realm_id: Uuid,
        name: &str,
        current: Option<Uuid>,
    ) -> CohortResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RuleViolation::EmptyName.into());
        }
        if name.chars().count() > self.config.max_name_length {
            return Err(RuleViolation::NameTooLong {
                max: self.config.max_name_length,
            }
            .into());
        }
        if name.starts_with(&self.config.reserved_name_prefix) {
            return Err(RuleViolation::ReservedName {
                prefix: self.config.reserved_name_prefix.clone(),
            }
            .into());
        }

        match self.groups.get_by_name(realm_id, name).await {
            Ok(existing) if Some(existing.id) != current => {
                Err(RuleViolation::DuplicateName { name: name.into() }.into())
            }
            Ok(_) | Err(CohortError::NotFound { .. }) => Ok(name.to_string()),
            Err(e) => Err(e),
        }
    }

    fn check_description(&self, description: &str) -> CohortResult<()> {
        if description.chars().count() > self.config.max_description_length {
            return Err(RuleViolation::DescriptionTooLong {
                max: self.config.max_description_length,
            }
            .into());
        }
        Ok(())
    }
}

/// Lock a single group row and return the group as seen under the lock.
async fn lock_group<T: GroupTransaction>(
    tx: &mut T,
    realm_id: Uuid,
    group_id: Uuid,
) -> CohortResult<Group> {
    tx.lock_for_update(realm_id, &BTreeSet::from([group_id]))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| CohortError::not_found("group", group_id))
}

/// Drop repeated ids, keeping first occurrences in order.
fn dedup(ids: &[Uuid]) -> Vec<Uuid> {
    let mut seen = BTreeSet::new();
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}
