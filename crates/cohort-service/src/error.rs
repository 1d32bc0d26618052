//! Business-rule violations raised by the group service.

use cohort_core::error::CohortError;
use cohort_core::models::setting::GroupSetting;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RuleViolation {
    #[error("No new data supplied")]
    NoNewData,

    #[error("Nothing to do. Specify at least one of \"add\" or \"delete\".")]
    NothingToDo,

    #[error("User group name cannot be empty")]
    EmptyName,

    #[error("User group name cannot exceed {max} characters")]
    NameTooLong { max: usize },

    #[error("User group name cannot start with '{prefix}'")]
    ReservedName { prefix: String },

    #[error("User group '{name}' already exists")]
    DuplicateName { name: String },

    #[error("User group description cannot exceed {max} characters")]
    DescriptionTooLong { max: usize },

    #[error("User {user_id} is already a member of this group")]
    AlreadyMember { user_id: Uuid },

    #[error("There is no member '{user_id}' in this user group")]
    NotAMember { user_id: Uuid },

    #[error("User group {group_id} is already a subgroup of this group")]
    AlreadySubgroup { group_id: Uuid },

    #[error("User group {group_id} is not a subgroup of this group")]
    NotASubgroup { group_id: Uuid },

    #[error("User group {group_id} is already a subgroup of one of the passed subgroups")]
    WouldCreateCycle { group_id: Uuid },

    #[error("Insufficient permission: system groups cannot be modified")]
    SystemGroupImmutable,

    #[error("'{setting}' must be set to a system group")]
    SystemGroupRequired { setting: GroupSetting },

    #[error("'{setting}' cannot be set to '{group}'")]
    GroupNotAllowed { setting: GroupSetting, group: String },

    #[error("'{setting}' cannot be set to an anonymous group")]
    AnonymousNotAllowed { setting: GroupSetting },

    #[error("User group {group_id} is used by setting '{setting}' of group {referenced_by}")]
    GroupInUse {
        group_id: Uuid,
        setting: GroupSetting,
        referenced_by: Uuid,
    },
}

impl From<RuleViolation> for CohortError {
    fn from(err: RuleViolation) -> Self {
        match err {
            RuleViolation::NoNewData
            | RuleViolation::NothingToDo
            | RuleViolation::EmptyName
            | RuleViolation::NameTooLong { .. }
            | RuleViolation::ReservedName { .. }
            | RuleViolation::DuplicateName { .. }
            | RuleViolation::DescriptionTooLong { .. }
            | RuleViolation::GroupInUse { .. } => CohortError::Validation {
                message: err.to_string(),
            },
            RuleViolation::AlreadyMember { .. }
            | RuleViolation::NotAMember { .. }
            | RuleViolation::AlreadySubgroup { .. }
            | RuleViolation::NotASubgroup { .. } => CohortError::Conflict {
                message: err.to_string(),
            },
            RuleViolation::WouldCreateCycle { group_id } => CohortError::Cycle {
                supergroup_id: group_id,
            },
            RuleViolation::SystemGroupImmutable
            | RuleViolation::SystemGroupRequired { .. }
            | RuleViolation::GroupNotAllowed { .. }
            | RuleViolation::AnonymousNotAllowed { .. } => CohortError::PermissionDenied {
                reason: err.to_string(),
            },
        }
    }
}
