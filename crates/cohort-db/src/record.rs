//! Row structs and record-id helpers shared by the repositories and
//! transactions.
//!
//! UUIDs are stored as strings; record keys are the UUID strings of the
//! domain ids.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use cohort_core::models::group::{Group, GroupKind};
use cohort_core::models::setting::GroupSetting;
use cohort_core::models::user::{User, UserStatus};
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use uuid::Uuid;

use crate::error::DbError;

pub(crate) const GROUP_TABLE: &str = "user_group";
pub(crate) const USER_TABLE: &str = "user";

/// Record literal for a trusted id, e.g. ``user_group:`<uuid>` ``.
pub(crate) fn record(table: &str, id: Uuid) -> String {
    format!("{table}:`{id}`")
}

/// Array literal of record ids.
pub(crate) fn record_list(table: &str, ids: impl IntoIterator<Item = Uuid>) -> String {
    let records: Vec<String> = ids.into_iter().map(|id| record(table, id)).collect();
    format!("[{}]", records.join(", "))
}

pub(crate) fn parse_uuid(value: &str, what: &str) -> Result<Uuid, DbError> {
    Uuid::parse_str(value).map_err(|e| DbError::Decode(format!("invalid {what} UUID: {e}")))
}

pub(crate) fn kind_to_str(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Named => "named",
        GroupKind::System => "system",
        GroupKind::Anonymous => "anonymous",
    }
}

fn parse_kind(s: &str) -> Result<GroupKind, DbError> {
    match s {
        "named" => Ok(GroupKind::Named),
        "system" => Ok(GroupKind::System),
        "anonymous" => Ok(GroupKind::Anonymous),
        other => Err(DbError::Decode(format!("unknown group kind: {other}"))),
    }
}

pub(crate) fn status_to_str(status: UserStatus) -> &'static str {
    match status {
        UserStatus::Active => "Active",
        UserStatus::Deactivated => "Deactivated",
    }
}

fn parse_status(s: &str) -> Result<UserStatus, DbError> {
    match s {
        "Active" => Ok(UserStatus::Active),
        "Deactivated" => Ok(UserStatus::Deactivated),
        other => Err(DbError::Decode(format!("unknown user status: {other}"))),
    }
}

pub(crate) fn settings_to_value(
    settings: &BTreeMap<GroupSetting, Uuid>,
) -> Result<serde_json::Value, DbError> {
    serde_json::to_value(settings).map_err(|e| DbError::Decode(format!("settings: {e}")))
}

/// Group row including the record key via `meta::id(id)`.
#[derive(Debug, SurrealValue)]
pub(crate) struct GroupRow {
    record_id: String,
    realm_id: String,
    name: String,
    description: String,
    kind: String,
    settings: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl GroupRow {
    pub(crate) fn try_into_group(self) -> Result<Group, DbError> {
        let settings = serde_json::from_value(self.settings)
            .map_err(|e| DbError::Decode(format!("settings of group {}: {e}", self.record_id)))?;
        Ok(Group {
            id: parse_uuid(&self.record_id, "group")?,
            realm_id: parse_uuid(&self.realm_id, "realm")?,
            name: self.name,
            description: self.description,
            kind: parse_kind(&self.kind)?,
            settings,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, SurrealValue)]
pub(crate) struct UserRow {
    record_id: String,
    realm_id: String,
    full_name: String,
    is_bot: bool,
    status: String,
    created_at: DateTime<Utc>,
}

impl UserRow {
    pub(crate) fn try_into_user(self) -> Result<User, DbError> {
        Ok(User {
            id: parse_uuid(&self.record_id, "user")?,
            realm_id: parse_uuid(&self.realm_id, "realm")?,
            full_name: self.full_name,
            is_bot: self.is_bot,
            status: parse_status(&self.status)?,
            created_at: self.created_at,
        })
    }
}

/// One `member_of` or `subgroup_of` edge: `source` is `in`, `target` is
/// `out`.
#[derive(Debug, SurrealValue)]
pub(crate) struct EdgeRow {
    source: String,
    target: String,
}

impl EdgeRow {
    pub(crate) fn ids(&self) -> Result<(Uuid, Uuid), DbError> {
        Ok((
            parse_uuid(&self.source, "edge source")?,
            parse_uuid(&self.target, "edge target")?,
        ))
    }
}

/// Row struct for count queries.
#[derive(Debug, SurrealValue)]
pub(crate) struct CountRow {
    pub(crate) total: u64,
}

/// Load `ids` from the realm, ordered like the set. Fails on the first id
/// that is missing or belongs to another realm.
pub(crate) async fn fetch_groups<C: Connection>(
    db: &Surreal<C>,
    realm_id: Uuid,
    ids: &BTreeSet<Uuid>,
) -> Result<Vec<Group>, DbError> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let query = format!(
        "SELECT meta::id(id) AS record_id, * FROM {GROUP_TABLE} \
         WHERE realm_id = $realm_id AND id IN {}",
        record_list(GROUP_TABLE, ids.iter().copied())
    );
    let mut result = db
        .query(query)
        .bind(("realm_id", realm_id.to_string()))
        .await?;
    let rows: Vec<GroupRow> = result.take(0)?;

    let mut by_id = rows
        .into_iter()
        .map(|row| row.try_into_group().map(|group| (group.id, group)))
        .collect::<Result<BTreeMap<_, _>, DbError>>()?;

    ids.iter()
        .map(|id| by_id.remove(id).ok_or_else(|| DbError::group_not_found(id)))
        .collect()
}
