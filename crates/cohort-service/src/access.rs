use cohort_core::error::{CohortError, CohortResult};
use cohort_core::models::group::Group;
use cohort_core::repository::GroupRepository;
use uuid::Uuid;

use crate::error::RuleViolation;

/// Resolve a group id coming from a caller. Anonymous groups are only
/// reachable through the setting that owns them, so they read as missing.
pub(crate) async fn access_group<G: GroupRepository>(
    groups: &G,
    realm_id: Uuid,
    id: Uuid,
) -> CohortResult<Group> {
    let group = groups.get_by_id(realm_id, id).await?;
    if group.is_anonymous() {
        return Err(CohortError::not_found("group", id));
    }
    Ok(group)
}

/// Like [`access_group`], but also rejects system groups, which are only
/// changed by realm bootstrap.
pub(crate) async fn access_group_for_write<G: GroupRepository>(
    groups: &G,
    realm_id: Uuid,
    id: Uuid,
) -> CohortResult<Group> {
    let group = access_group(groups, realm_id, id).await?;
    if group.is_system() {
        return Err(RuleViolation::SystemGroupImmutable.into());
    }
    Ok(group)
}
