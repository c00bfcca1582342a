use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{Connection, params};
use serde::Serialize;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "revision",
        sql: include_str!("migrations/v001_revision.sql"),
    },
    Migration {
        version: 2,
        name: "updatelog",
        sql: include_str!("migrations/v002_updatelog.sql"),
    },
    Migration {
        version: 3,
        name: "page_timestamp_index",
        sql: include_str!("migrations/v003_page_timestamp_index.sql"),
    },
];

#[derive(Debug, Clone, Serialize)]
pub struct MigrateReport {
    pub applied: Vec<AppliedMigration>,
    pub current_version: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub name: String,
}

/// Bring the `revision`/`updatelog` schema up to date.
pub fn run_migrations(connection: &Connection) -> Result<MigrateReport> {
    ensure_schema_migrations_table(connection)?;
    let current = current_version(connection)?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply_migration(connection, migration).with_context(|| {
            format!(
                "failed to apply migration v{:03}_{}",
                migration.version, migration.name
            )
        })?;
        applied.push(AppliedMigration {
            version: migration.version,
            name: migration.name.to_string(),
        });
    }

    Ok(MigrateReport {
        applied,
        current_version: current_version(connection)?,
    })
}

pub fn pending_migration_count(connection: &Connection) -> Result<usize> {
    ensure_schema_migrations_table(connection)?;
    let current = current_version(connection)?;
    Ok(MIGRATIONS.iter().filter(|m| m.version > current).count())
}

/// Highest applied version, 0 when none.
pub fn current_version(connection: &Connection) -> Result<u32> {
    let version: i64 = connection
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .context("failed to read current migration version")?;
    u32::try_from(version).context("migration version does not fit into u32")
}

fn ensure_schema_migrations_table(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_unix INTEGER NOT NULL
            );",
        )
        .context("failed to create schema_migrations table")
}

fn apply_migration(connection: &Connection, migration: &Migration) -> Result<()> {
    connection
        .execute_batch("SAVEPOINT schema_migration")
        .context("failed to create savepoint")?;

    let outcome = (|| -> Result<()> {
        connection
            .execute_batch(migration.sql)
            .with_context(|| format!("SQL execution failed for v{:03}", migration.version))?;
        let applied_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock error")?
            .as_secs();
        connection
            .execute(
                "INSERT INTO schema_migrations (version, name, applied_at_unix) VALUES (?1, ?2, ?3)",
                params![
                    i64::from(migration.version),
                    migration.name,
                    i64::try_from(applied_at).context("timestamp does not fit into i64")?,
                ],
            )
            .context("failed to record migration")?;
        Ok(())
    })();

    if outcome.is_err() {
        let _ = connection.execute_batch("ROLLBACK TO SAVEPOINT schema_migration");
    }
    connection
        .execute_batch("RELEASE SAVEPOINT schema_migration")
        .context("failed to release savepoint")?;
    outcome
}
