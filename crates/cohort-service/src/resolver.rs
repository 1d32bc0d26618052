//! Permission-setting value resolution.

use cohort_core::error::CohortResult;
use cohort_core::models::group::{CreateGroup, Group, SystemGroup};
use cohort_core::models::setting::{
    AnonymousSpec, GroupSetting, PermissionConfig, SettingValue, setting_changed,
};
use cohort_core::models::user::User;
use cohort_core::repository::{GroupRepository, GroupTransaction, UserRepository};
use tracing::debug;
use uuid::Uuid;

use crate::access::access_group;
use crate::error::RuleViolation;

/// Turns API setting values into group references.
pub struct SettingValueResolver<'a, G: GroupRepository, U: UserRepository> {
    groups: &'a G,
    users: &'a U,
}

impl<'a, G: GroupRepository, U: UserRepository> SettingValueResolver<'a, G, U> {
    pub fn new(groups: &'a G, users: &'a U) -> Self {
        Self { groups, users }
    }

    /// Render a stored setting reference the way API callers see it:
    /// anonymous groups as their direct member and subgroup sets, anything
    /// else as its id.
    pub async fn api_value(&self, realm_id: Uuid, group_id: Uuid) -> CohortResult<SettingValue> {
        let group = self.groups.get_by_id(realm_id, group_id).await?;
        if !group.is_anonymous() {
            return Ok(SettingValue::Group(group.id));
        }

        let direct_members = self.groups.direct_member_ids(realm_id, group.id).await?;
        let direct_subgroups = self.groups.direct_subgroup_ids(realm_id, group.id).await?;
        Ok(SettingValue::Anonymous(AnonymousSpec {
            direct_members: direct_members.into_iter().collect(),
            direct_subgroups: direct_subgroups.into_iter().collect(),
        }))
    }

    /// Whether `new` differs from what `current` references. Run before
    /// [`Self::resolve`] so an unchanged set does not produce a fresh
    /// anonymous group.
    pub async fn setting_changed(
        &self,
        realm_id: Uuid,
        current: Uuid,
        new: &SettingValue,
    ) -> CohortResult<bool> {
        let current = self.api_value(realm_id, current).await?;
        Ok(setting_changed(&current, &new.clone().normalize()))
    }

    /// Resolve `value` for `setting` on behalf of `acting_user`, staging an
    /// anonymous group in `tx` when the value is a member/subgroup set.
    pub async fn resolve(
        &self,
        tx: &mut G::Transaction,
        acting_user: &User,
        setting: GroupSetting,
        value: SettingValue,
    ) -> CohortResult<Uuid> {
        let realm_id = acting_user.realm_id;
        let config = setting.config();

        match value.normalize() {
            SettingValue::Group(id) => {
                let group = access_group(self.groups, realm_id, id).await?;
                check_allowed(&config, setting, &group)?;
                Ok(group.id)
            }
            SettingValue::Anonymous(spec) => {
                if config.require_system_group {
                    return Err(RuleViolation::SystemGroupRequired { setting }.into());
                }
                if !config.allow_anonymous_group {
                    return Err(RuleViolation::AnonymousNotAllowed { setting }.into());
                }

                let members: Vec<Uuid> = spec.direct_members.into_iter().collect();
                self.users.get_many(realm_id, &members).await?;

                let subgroups: Vec<Uuid> = spec.direct_subgroups.into_iter().collect();
                for id in &subgroups {
                    access_group(self.groups, realm_id, *id).await?;
                }
                let (member_count, subgroup_count) = (members.len(), subgroups.len());

                let group = tx.insert_group(CreateGroup::anonymous(realm_id));
                if !members.is_empty() {
                    tx.add_members(realm_id, group.id, members);
                }
                if !subgroups.is_empty() {
                    tx.add_subgroups(realm_id, group.id, subgroups);
                }

                debug!(
                    realm_id = %realm_id,
                    group_id = %group.id,
                    setting = %setting,
                    members = member_count,
                    subgroups = subgroup_count,
                    "Staged anonymous setting group"
                );
                Ok(group.id)
            }
        }
    }
}

fn check_allowed(
    config: &PermissionConfig,
    setting: GroupSetting,
    group: &Group,
) -> CohortResult<()> {
    if config.require_system_group && !group.is_system() {
        return Err(RuleViolation::SystemGroupRequired { setting }.into());
    }
    if group.is_system() {
        let allowed = match SystemGroup::from_name(&group.name) {
            Some(SystemGroup::Nobody) => config.allow_nobody_group,
            Some(SystemGroup::Everyone) => config.allow_everyone_group,
            _ => true,
        };
        if !allowed {
            return Err(RuleViolation::GroupNotAllowed {
                setting,
                group: group.name.clone(),
            }
            .into());
        }
    }
    Ok(())
}
