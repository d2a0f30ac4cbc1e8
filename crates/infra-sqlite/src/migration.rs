// Migration Runner

use crate::error::map_sqlx_error;
use conveyor_core::error::Result;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Applied in order; a version is recorded in the same transaction as its DDL
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "jobs",
        sql: include_str!("../migrations/001_jobs.sql"),
    },
    Migration {
        version: 2,
        name: "budget_periods",
        sql: include_str!("../migrations/002_budget_periods.sql"),
    },
];

const VERSION_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
)
"#;

/// Bring the schema up to the latest version
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(VERSION_TABLE_SQL)
        .execute(pool)
        .await
        .map_err(map_sqlx_error)?;

    let current: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(map_sqlx_error)?;

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        debug!(version = current, "Schema up to date");
        return Ok(());
    }

    for migration in pending {
        info!(version = migration.version, name = migration.name, "Applying migration");
        let mut tx = pool.begin().await.map_err(map_sqlx_error)?;
        for statement in statements(migration.sql) {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        record_version(&mut tx, migration.version).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
    }

    info!(version = MIGRATIONS.len(), "Schema migrated");
    Ok(())
}

async fn record_version(tx: &mut Transaction<'_, Sqlite>, version: i64) -> Result<()> {
    let applied_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();

    sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(version)
        .bind(applied_at)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

/// Split a script into statements, dropping `--` comment lines
fn statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|line| !line.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}
