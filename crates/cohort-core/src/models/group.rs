//! Group domain model.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::setting::{GroupSetting, SettingValue};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    /// Created and named by users.
    Named,
    /// One of the per-realm role groups (`role:*`).
    System,
    /// Unnamed group backing a single permission setting.
    Anonymous,
}

/// A realm-scoped set of users and subgroups.
///
/// Permission settings reference other groups by id; an anonymous group
/// is created when a setting is given an inline member/subgroup set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: Uuid,
    pub realm_id: Uuid,
    /// Empty for anonymous groups.
    pub name: String,
    pub description: String,
    pub kind: GroupKind,
    pub settings: BTreeMap<GroupSetting, Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Group {
    pub fn is_anonymous(&self) -> bool {
        self.kind == GroupKind::Anonymous
    }

    pub fn is_system(&self) -> bool {
        self.kind == GroupKind::System
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateGroup {
    pub realm_id: Uuid,
    pub name: String,
    pub description: String,
    pub kind: GroupKind,
    pub settings: BTreeMap<GroupSetting, Uuid>,
}

impl CreateGroup {
    pub fn named(realm_id: Uuid, name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            realm_id,
            name: name.into(),
            description: description.into(),
            kind: GroupKind::Named,
            settings: BTreeMap::new(),
        }
    }

    pub fn anonymous(realm_id: Uuid) -> Self {
        Self {
            realm_id,
            name: String::new(),
            description: String::new(),
            kind: GroupKind::Anonymous,
            settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UpdateGroup {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl UpdateGroup {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

/// A group together with its direct edges and API-rendered settings.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: Group,
    pub direct_members: Vec<Uuid>,
    pub direct_subgroups: Vec<Uuid>,
    pub settings: BTreeMap<GroupSetting, SettingValue>,
}

/// Role groups every realm is bootstrapped with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemGroup {
    Nobody,
    Owners,
    Administrators,
    Moderators,
    Members,
    Everyone,
}

impl SystemGroup {
    /// Ordered from narrowest to widest role.
    pub const ALL: [SystemGroup; 6] = [
        SystemGroup::Nobody,
        SystemGroup::Owners,
        SystemGroup::Administrators,
        SystemGroup::Moderators,
        SystemGroup::Members,
        SystemGroup::Everyone,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SystemGroup::Nobody => "role:nobody",
            SystemGroup::Owners => "role:owners",
            SystemGroup::Administrators => "role:administrators",
            SystemGroup::Moderators => "role:moderators",
            SystemGroup::Members => "role:members",
            SystemGroup::Everyone => "role:everyone",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            SystemGroup::Nobody => "Nobody",
            SystemGroup::Owners => "Owners of this organization",
            SystemGroup::Administrators => "Administrators of this organization, including owners",
            SystemGroup::Moderators => "Moderators of this organization, including administrators",
            SystemGroup::Members => "Members of this organization, not including guests",
            SystemGroup::Everyone => "Everyone in this organization, including guests",
        }
    }

    /// The next wider role, which contains this one as a subgroup.
    /// `role:nobody` stands alone.
    pub fn parent(&self) -> Option<SystemGroup> {
        match self {
            SystemGroup::Nobody | SystemGroup::Everyone => None,
            SystemGroup::Owners => Some(SystemGroup::Administrators),
            SystemGroup::Administrators => Some(SystemGroup::Moderators),
            SystemGroup::Moderators => Some(SystemGroup::Members),
            SystemGroup::Members => Some(SystemGroup::Everyone),
        }
    }

    pub fn from_name(name: &str) -> Option<SystemGroup> {
        Self::ALL.into_iter().find(|group| group.name() == name)
    }
}
