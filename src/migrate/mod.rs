//! Embedded ClickHouse schema for summary buckets.
//!
//! Schema statements are written against a `{table}` placeholder and applied
//! to the configured summary table. Progress lives in `<table>_migrations`,
//! one row per applied version, with a dirty flag set while a version runs.

use anyhow::{bail, Context, Result};
use clickhouse_rs::ClientHandle;
use tracing::info;

/// One forward schema step.
struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

/// Ordered by version.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "resource_summaries",
        sql: include_str!("sql/001_resource_summaries.sql"),
    },
    Migration {
        version: 2,
        name: "resource_summaries_by_time",
        sql: include_str!("sql/002_resource_summaries_by_time.sql"),
    },
];

/// Migrations newer than `current`, in apply order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// Statements of `migration` with the placeholder bound to `table`.
fn statements(migration: &Migration, table: &str) -> Vec<String> {
    migration
        .sql
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.replace("{table}", table))
        .collect()
}

fn tracking_table(table: &str) -> String {
    format!("{table}_migrations")
}

/// Brings `table` up to the newest embedded schema version.
///
/// Returns how many versions were applied. Refuses to run when a previous
/// attempt left its version dirty.
pub async fn apply(handle: &mut ClientHandle, table: &str) -> Result<u32> {
    let tracking = tracking_table(table);

    handle
        .execute(format!(
            "CREATE TABLE IF NOT EXISTS {tracking} (version UInt32, dirty UInt8) ENGINE = TinyLog"
        ))
        .await
        .with_context(|| format!("creating {tracking}"))?;

    let (current, dirty) = recorded_version(handle, &tracking).await?;
    if dirty {
        bail!("{table} schema version {current} is dirty, manual intervention required");
    }

    let mut applied = 0;
    for migration in pending(current) {
        info!(table, version = migration.version, name = migration.name, "applying migration");

        record_version(handle, &tracking, migration.version, true).await?;
        for statement in statements(migration, table) {
            handle.execute(statement.as_str()).await.with_context(|| {
                format!("applying migration {} to {table}", migration.name)
            })?;
        }
        record_version(handle, &tracking, migration.version, false).await?;

        applied += 1;
    }

    info!(table, from = current, applied, "summary schema up to date");

    Ok(applied)
}

async fn recorded_version(handle: &mut ClientHandle, tracking: &str) -> Result<(u32, bool)> {
    let block = handle
        .query(format!("SELECT max(version) AS version, argMax(dirty, version) AS dirty FROM {tracking}"))
        .fetch_all()
        .await
        .with_context(|| format!("reading {tracking}"))?;

    let Some(row) = block.rows().next() else {
        return Ok((0, false));
    };
    let version: u32 = row.get("version").context("reading version")?;
    let dirty: u8 = row.get("dirty").context("reading dirty flag")?;

    Ok((version, dirty != 0))
}

/// Records `version`; a clean row replaces the dirty one left by the same version.
async fn record_version(
    handle: &mut ClientHandle,
    tracking: &str,
    version: u32,
    dirty: bool,
) -> Result<()> {
    if !dirty {
        handle
            .execute(format!("TRUNCATE TABLE {tracking}"))
            .await
            .with_context(|| format!("clearing {tracking}"))?;
    }

    handle
        .execute(format!(
            "INSERT INTO {tracking} (version, dirty) VALUES ({version}, {})",
            u8::from(dirty)
        ))
        .await
        .with_context(|| format!("recording version {version} in {tracking}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_ordered_and_non_empty() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!statements(m, "t").is_empty(), "migration {} is empty", m.name);
        }
        for window in MIGRATIONS.windows(2) {
            assert!(window[0].version < window[1].version);
        }
    }

    #[test]
    fn test_statements_bind_table() {
        let create = statements(&MIGRATIONS[0], "condor.summaries");
        assert_eq!(create.len(), 1);
        assert!(create[0].starts_with("CREATE TABLE IF NOT EXISTS condor.summaries ("));
        assert!(create[0].contains("ReplacingMergeTree(updated_date_time)"));

        let index = statements(&MIGRATIONS[1], "condor.summaries");
        assert!(index[0].starts_with("ALTER TABLE condor.summaries"));
        assert!(MIGRATIONS.iter().all(|m| !statements(m, "x").join(";").contains("{table}")));
    }

    #[test]
    fn test_pending_versions() {
        let versions: Vec<u32> = pending(0).map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(pending(1).count(), 1);
        assert_eq!(pending(2).count(), 0);
    }

    #[test]
    fn test_tracking_table_follows_summary_table() {
        assert_eq!(tracking_table("db.resource_summaries"), "db.resource_summaries_migrations");
    }
}
