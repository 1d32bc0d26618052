//! Repository trait definitions for data access abstraction.
//!
//! All repository operations are async and realm-scoped: a group or user
//! that exists in another realm is reported as not found.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::error::CohortResult;
use crate::models::group::{CreateGroup, Group, UpdateGroup};
use crate::models::setting::GroupSetting;
use crate::models::user::User;

/// Pagination parameters for list queries.
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A paginated result set.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

// ---------------------------------------------------------------------------
// Users (owned by the realm's user directory)
// ---------------------------------------------------------------------------

pub trait UserRepository: Send + Sync {
    fn get_by_id(
        &self,
        realm_id: Uuid,
        id: Uuid,
    ) -> impl Future<Output = CohortResult<User>> + Send;

    /// Resolve every id, failing on the first one outside the realm.
    /// Results follow the order of `ids`.
    fn get_many(
        &self,
        realm_id: Uuid,
        ids: &[Uuid],
    ) -> impl Future<Output = CohortResult<Vec<User>>> + Send;
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

pub trait GroupRepository: Send + Sync {
    type Transaction: GroupTransaction;

    /// Start a transaction. Nothing is visible to other readers until
    /// [`GroupTransaction::commit`] succeeds.
    fn begin(&self) -> Self::Transaction;

    fn create(&self, input: CreateGroup) -> impl Future<Output = CohortResult<Group>> + Send;
    fn get_by_id(
        &self,
        realm_id: Uuid,
        id: Uuid,
    ) -> impl Future<Output = CohortResult<Group>> + Send;
    /// Look up a named or system group. Anonymous groups have no name.
    fn get_by_name(
        &self,
        realm_id: Uuid,
        name: &str,
    ) -> impl Future<Output = CohortResult<Group>> + Send;
    fn update(
        &self,
        realm_id: Uuid,
        id: Uuid,
        input: UpdateGroup,
    ) -> impl Future<Output = CohortResult<Group>> + Send;
    /// Delete a group and detach every edge touching it.
    fn delete(&self, realm_id: Uuid, id: Uuid) -> impl Future<Output = CohortResult<()>> + Send;
    /// Named and system groups of the realm, oldest first.
    fn list(
        &self,
        realm_id: Uuid,
        pagination: Pagination,
    ) -> impl Future<Output = CohortResult<PaginatedResult<Group>>> + Send;

    fn add_members(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> impl Future<Output = CohortResult<()>> + Send;
    fn remove_members(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        user_ids: &[Uuid],
    ) -> impl Future<Output = CohortResult<()>> + Send;
    fn add_subgroups(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        subgroup_ids: &[Uuid],
    ) -> impl Future<Output = CohortResult<()>> + Send;
    fn remove_subgroups(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        subgroup_ids: &[Uuid],
    ) -> impl Future<Output = CohortResult<()>> + Send;

    fn direct_member_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> impl Future<Output = CohortResult<Vec<Uuid>>> + Send;
    fn direct_subgroup_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> impl Future<Output = CohortResult<Vec<Uuid>>> + Send;
    /// Transitive closure over subgroup edges, excluding the group itself.
    fn recursive_subgroup_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> impl Future<Output = CohortResult<Vec<Uuid>>> + Send;
    /// Direct members of the group and of all its recursive subgroups.
    fn recursive_member_ids(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> impl Future<Output = CohortResult<Vec<Uuid>>> + Send;
    fn is_member(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
        user_id: Uuid,
        direct_only: bool,
    ) -> impl Future<Output = CohortResult<bool>> + Send;

    /// Other groups whose settings point at `group_id`.
    fn referencing_groups(
        &self,
        realm_id: Uuid,
        group_id: Uuid,
    ) -> impl Future<Output = CohortResult<Vec<(Group, GroupSetting)>>> + Send;
}

/// A unit of work against the group graph.
///
/// Mutations are staged and only validated when the transaction commits;
/// the first constraint violation rejects the whole transaction.
/// Dropping an uncommitted transaction discards it. Row locks taken with
/// [`GroupTransaction::lock_for_update`] are held until the transaction ends.
pub trait GroupTransaction: Send {
    /// Lock the rows for `ids` in ascending id order and return the locked
    /// groups in that order. Rows this transaction already holds are not
    /// locked again.
    fn lock_for_update(
        &mut self,
        realm_id: Uuid,
        ids: &BTreeSet<Uuid>,
    ) -> impl Future<Output = CohortResult<Vec<Group>>> + Send;

    /// Stage a new group. The returned record carries its assigned id.
    fn insert_group(&mut self, input: CreateGroup) -> Group;
    fn update_group(&mut self, realm_id: Uuid, id: Uuid, input: UpdateGroup);
    fn set_setting(&mut self, realm_id: Uuid, id: Uuid, setting: GroupSetting, value: Uuid);
    fn add_members(&mut self, realm_id: Uuid, group_id: Uuid, user_ids: Vec<Uuid>);
    fn remove_members(&mut self, realm_id: Uuid, group_id: Uuid, user_ids: Vec<Uuid>);
    fn add_subgroups(&mut self, realm_id: Uuid, group_id: Uuid, subgroup_ids: Vec<Uuid>);
    fn remove_subgroups(&mut self, realm_id: Uuid, group_id: Uuid, subgroup_ids: Vec<Uuid>);
    fn delete_group(&mut self, realm_id: Uuid, id: Uuid);

    fn commit(self) -> impl Future<Output = CohortResult<()>> + Send;
}
