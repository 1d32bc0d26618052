//! Schema definitions and migration runner for SurrealDB.
//!
//! Tables are SCHEMAFULL. UUIDs are stored as strings and double as record
//! keys. Group-name uniqueness is not an index: anonymous groups share the
//! empty name, so the commit path checks it instead.

use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tracing::info;

use crate::error::DbError;

// -----------------------------------------------------------------------
// Migration tracking
// -----------------------------------------------------------------------

const MIGRATION_TABLE_DDL: &str = "\
DEFINE TABLE IF NOT EXISTS _migration SCHEMAFULL;
DEFINE FIELD IF NOT EXISTS version ON TABLE _migration TYPE int;
DEFINE FIELD IF NOT EXISTS name ON TABLE _migration TYPE string;
DEFINE FIELD IF NOT EXISTS applied_at ON TABLE _migration TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX IF NOT EXISTS idx_migration_version ON TABLE _migration \
    COLUMNS version UNIQUE;
";

#[derive(Debug, SurrealValue)]
struct MigrationRecord {
    version: u32,
}

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "group_graph",
    sql: SCHEMA_V1,
}];

// -----------------------------------------------------------------------
// Schema v1
// -----------------------------------------------------------------------

const SCHEMA_V1: &str = "\
-- =======================================================================
-- Users (realm scope, owned by the user directory)
-- =======================================================================
DEFINE TABLE user SCHEMAFULL;
DEFINE FIELD realm_id ON TABLE user TYPE string;
DEFINE FIELD full_name ON TABLE user TYPE string;
DEFINE FIELD is_bot ON TABLE user TYPE bool DEFAULT false;
DEFINE FIELD status ON TABLE user TYPE string \
    ASSERT $value IN ['Active', 'Deactivated'];
DEFINE FIELD created_at ON TABLE user TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_user_realm ON TABLE user COLUMNS realm_id;

-- =======================================================================
-- User groups (realm scope)
-- =======================================================================
DEFINE TABLE user_group SCHEMAFULL;
DEFINE FIELD realm_id ON TABLE user_group TYPE string;
DEFINE FIELD name ON TABLE user_group TYPE string;
DEFINE FIELD description ON TABLE user_group TYPE string;
DEFINE FIELD kind ON TABLE user_group TYPE string \
    ASSERT $value IN ['named', 'system', 'anonymous'];
DEFINE FIELD settings ON TABLE user_group TYPE object FLEXIBLE \
    DEFAULT {};
DEFINE FIELD created_at ON TABLE user_group TYPE datetime \
    DEFAULT time::now();
DEFINE FIELD updated_at ON TABLE user_group TYPE datetime \
    DEFAULT time::now();
DEFINE INDEX idx_user_group_realm_name ON TABLE user_group \
    COLUMNS realm_id, name;

-- =======================================================================
-- Graph Edge Tables (relations)
-- =======================================================================

-- User -> Group direct membership
DEFINE TABLE member_of TYPE RELATION SCHEMAFULL;
DEFINE FIELD realm_id ON TABLE member_of TYPE string;
DEFINE INDEX idx_member_of_pair ON TABLE member_of COLUMNS in, out UNIQUE;
DEFINE INDEX idx_member_of_realm ON TABLE member_of COLUMNS realm_id;

-- Group -> Group direct subgroup (in is the subgroup, out the supergroup)
DEFINE TABLE subgroup_of TYPE RELATION SCHEMAFULL;
DEFINE FIELD realm_id ON TABLE subgroup_of TYPE string;
DEFINE INDEX idx_subgroup_of_pair ON TABLE subgroup_of COLUMNS in, out UNIQUE;
DEFINE INDEX idx_subgroup_of_realm ON TABLE subgroup_of COLUMNS realm_id;
";

// -----------------------------------------------------------------------
// Public API
// -----------------------------------------------------------------------

/// Run all pending migrations against the given SurrealDB client.
///
/// Creates a `_migration` tracking table on first run, then applies each
/// migration whose version exceeds the current maximum.
pub async fn run_migrations<C: Connection>(db: &Surreal<C>) -> Result<(), DbError> {
    db.query(MIGRATION_TABLE_DDL)
        .await?
        .check()
        .map_err(|e| DbError::Migration(e.to_string()))?;

    let mut result = db
        .query("SELECT version FROM _migration ORDER BY version DESC LIMIT 1")
        .await?;
    let records: Vec<MigrationRecord> = result.take(0)?;
    let current_version = records.first().map(|m| m.version).unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }
        info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        db.query(migration.sql).await?.check().map_err(|e| {
            DbError::Migration(format!(
                "Migration v{} '{}' failed: {}",
                migration.version, migration.name, e,
            ))
        })?;

        db.query("CREATE _migration SET version = $version, name = $name")
            .bind(("version", migration.version))
            .bind(("name", migration.name))
            .await?
            .check()
            .map_err(|e| {
                DbError::Migration(format!(
                    "Failed to record migration v{}: {}",
                    migration.version, e,
                ))
            })?;
    }

    Ok(())
}
