//! Permission settings and their values.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::group::SystemGroup;

/// Group-valued permission settings carried by every named group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupSetting {
    CanMentionGroup,
    CanManageGroup,
}

impl GroupSetting {
    pub const ALL: [GroupSetting; 2] = [
        GroupSetting::CanMentionGroup,
        GroupSetting::CanManageGroup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupSetting::CanMentionGroup => "can_mention_group",
            GroupSetting::CanManageGroup => "can_manage_group",
        }
    }

    /// Which groups this setting may point at.
    pub fn config(&self) -> PermissionConfig {
        match self {
            GroupSetting::CanMentionGroup => PermissionConfig {
                require_system_group: false,
                allow_nobody_group: true,
                allow_everyone_group: true,
                allow_anonymous_group: true,
                default_group: SystemGroup::Everyone,
            },
            GroupSetting::CanManageGroup => PermissionConfig {
                require_system_group: false,
                allow_nobody_group: true,
                allow_everyone_group: false,
                allow_anonymous_group: true,
                default_group: SystemGroup::Nobody,
            },
        }
    }
}

impl fmt::Display for GroupSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rules for the values a single setting accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionConfig {
    pub require_system_group: bool,
    pub allow_nobody_group: bool,
    pub allow_everyone_group: bool,
    pub allow_anonymous_group: bool,
    /// Used when a group is created without a value for the setting.
    pub default_group: SystemGroup,
}

/// Inline member/subgroup set for a setting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnonymousSpec {
    #[serde(default)]
    pub direct_members: BTreeSet<Uuid>,
    #[serde(default)]
    pub direct_subgroups: BTreeSet<Uuid>,
}

/// The value of a permission setting as exchanged with API callers.
///
/// Deserializes from either a bare group id or an object with
/// `direct_members` and `direct_subgroups`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Group(Uuid),
    Anonymous(AnonymousSpec),
}

impl SettingValue {
    pub fn anonymous(
        members: impl IntoIterator<Item = Uuid>,
        subgroups: impl IntoIterator<Item = Uuid>,
    ) -> Self {
        SettingValue::Anonymous(AnonymousSpec {
            direct_members: members.into_iter().collect(),
            direct_subgroups: subgroups.into_iter().collect(),
        })
    }

    /// Collapse a member-less set with exactly one subgroup into a direct
    /// reference to that subgroup.
    pub fn normalize(self) -> Self {
        match self {
            SettingValue::Anonymous(spec)
                if spec.direct_members.is_empty() && spec.direct_subgroups.len() == 1 =>
            {
                match spec.direct_subgroups.into_iter().next() {
                    Some(id) => SettingValue::Group(id),
                    None => SettingValue::Anonymous(AnonymousSpec::default()),
                }
            }
            other => other,
        }
    }
}

/// Whether replacing `current` with `new` changes who holds the permission.
///
/// Group references are equal when they name the same group; anonymous
/// sets are equal when their member and subgroup sets match, regardless of
/// order. A reference and a set are never equal.
pub fn setting_changed(current: &SettingValue, new: &SettingValue) -> bool {
    match (current, new) {
        (SettingValue::Group(a), SettingValue::Group(b)) => a != b,
        (SettingValue::Anonymous(a), SettingValue::Anonymous(b)) => {
            a.direct_members != b.direct_members || a.direct_subgroups != b.direct_subgroups
        }
        _ => true,
    }
}
