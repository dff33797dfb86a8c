//! Schema manager: table definitions and numbered, forward-only migrations.
//!
//! [`ensure_schema`] runs once at startup, before the worker pool accepts any
//! work. It is idempotent:
//!
//! 1. Bootstrap the `schema_version` marker and the `schema_migrations`
//!    history with `IF NOT EXISTS` (version 0 on a fresh database).
//! 2. Compare the stored version with [`TARGET_VERSION`]. A newer stored
//!    version is fatal.
//! 3. Apply every step above the stored version in order. Each step runs in
//!    its own transaction together with the version bump and the history
//!    row, so a failed step leaves the previous version intact.

use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::SchemaError;

/// Schema version this build expects.
pub const TARGET_VERSION: u32 = 3;

/// One numbered migration step.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version the database is at after this step.
    pub version: u32,
    /// Short human-readable description, recorded in `schema_migrations`.
    pub description: &'static str,
    /// Statements executed in order inside the step's transaction.
    pub statements: &'static [&'static str],
}

/// All migration steps, ascending by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create player_records",
        statements: &[r"CREATE TABLE player_records (
                player_id   TEXT PRIMARY KEY NOT NULL,
                player_name TEXT NOT NULL,
                attributes  TEXT NOT NULL,
                stats       TEXT NOT NULL,
                revision    INTEGER NOT NULL CHECK (revision >= 0),
                first_login TEXT NOT NULL,
                last_login  TEXT NOT NULL,
                saved_at    TEXT NOT NULL
            )"],
    },
    Migration {
        version: 2,
        description: "add inventory column",
        statements: &["ALTER TABLE player_records ADD COLUMN inventory TEXT NOT NULL DEFAULT '{}'"],
    },
    Migration {
        version: 3,
        description: "index player_records by last_login",
        statements: &[
            "CREATE INDEX idx_player_records_last_login ON player_records (last_login)",
        ],
    },
];

/// What [`ensure_schema`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    /// Version found before any step ran.
    pub from_version: u32,
    /// Version after all steps ran.
    pub to_version: u32,
    /// Versions applied during this call, ascending.
    pub applied: Vec<u32>,
}

impl SchemaReport {
    /// Whether the schema was already current.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Bring the database to [`TARGET_VERSION`].
///
/// # Errors
///
/// Returns [`SchemaError::TooNew`] if the stored version exceeds the target,
/// [`SchemaError::MigrationFailed`] if a step fails, and
/// [`SchemaError::Bootstrap`] if the version marker cannot be read or
/// created.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<SchemaReport, SchemaError> {
    ensure_schema_with(pool, MIGRATIONS).await
}

/// Same as [`ensure_schema`] but against an explicit step list.
///
/// The target version is the highest version in `steps`.
///
/// # Errors
///
/// See [`ensure_schema`].
pub async fn ensure_schema_with(
    pool: &SqlitePool,
    steps: &[Migration],
) -> Result<SchemaReport, SchemaError> {
    bootstrap(pool).await?;

    let target = steps.iter().map(|m| m.version).max().unwrap_or(0);
    let from_version = current_version(pool).await?;
    if from_version > target {
        return Err(SchemaError::TooNew {
            found: from_version,
            supported: target,
        });
    }

    let mut applied = Vec::new();
    for step in steps.iter().filter(|m| m.version > from_version) {
        apply_step(pool, step)
            .await
            .map_err(|source| SchemaError::MigrationFailed {
                version: step.version,
                description: step.description,
                source,
            })?;
        tracing::info!(
            version = step.version,
            description = step.description,
            "Applied schema migration"
        );
        applied.push(step.version);
    }

    let report = SchemaReport {
        from_version,
        to_version: applied.last().copied().unwrap_or(from_version),
        applied,
    };

    if report.is_noop() {
        tracing::info!(version = report.to_version, "Schema is current");
    } else {
        tracing::info!(
            from = report.from_version,
            to = report.to_version,
            steps = report.applied.len(),
            "Schema migrated"
        );
    }

    Ok(report)
}

/// Read the stored schema version (0 before any step ran).
///
/// # Errors
///
/// Returns [`SchemaError::Bootstrap`] if the marker cannot be read and
/// [`SchemaError::InvalidVersion`] if it holds a negative or oversized value.
pub async fn current_version(pool: &SqlitePool) -> Result<u32, SchemaError> {
    let stored: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    let stored = stored.unwrap_or(0);
    u32::try_from(stored)
        .ok()
        .ok_or(SchemaError::InvalidVersion(stored))
}

async fn bootstrap(pool: &SqlitePool) -> Result<(), SchemaError> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        r"CREATE TABLE IF NOT EXISTS schema_version (
            id      INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO schema_version (id, version) VALUES (1, 0)")
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        r"CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            description TEXT NOT NULL,
            applied_at  TEXT NOT NULL
        )",
    )
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn apply_step(pool: &SqlitePool, step: &Migration) -> Result<(), sqlx::Error> {
    let mut tx: Transaction<'_, Sqlite> = pool.begin().await?;
    for statement in step.statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    sqlx::query("UPDATE schema_version SET version = ? WHERE id = 1")
        .bind(i64::from(step.version))
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO schema_migrations (version, description, applied_at) VALUES (?, ?, ?)")
        .bind(i64::from(step.version))
        .bind(step.description)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    tx.commit().await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn migrations_are_ascending_and_end_at_target() {
        let versions: Vec<u32> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted);
        assert_eq!(versions.last().copied(), Some(TARGET_VERSION));
    }

    #[tokio::test]
    async fn fresh_database_gets_every_step() {
        let pool = memory_pool().await;
        let report = ensure_schema(&pool).await.unwrap();
        assert_eq!(report.from_version, 0);
        assert_eq!(report.to_version, TARGET_VERSION);
        assert_eq!(report.applied, vec![1, 2, 3]);

        let history: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(history, 3);
    }

    #[tokio::test]
    async fn second_run_is_a_noop() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();
        let report = ensure_schema(&pool).await.unwrap();
        assert!(report.is_noop());
        assert_eq!(report.from_version, TARGET_VERSION);
        assert_eq!(current_version(&pool).await.unwrap(), TARGET_VERSION);
    }

    #[tokio::test]
    async fn partial_database_resumes_from_stored_version() {
        let pool = memory_pool().await;
        ensure_schema_with(&pool, &MIGRATIONS[..1]).await.unwrap();
        assert_eq!(current_version(&pool).await.unwrap(), 1);

        let report = ensure_schema(&pool).await.unwrap();
        assert_eq!(report.from_version, 1);
        assert_eq!(report.applied, vec![2, 3]);
    }

    #[tokio::test]
    async fn newer_schema_is_fatal() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.unwrap();
        sqlx::query("UPDATE schema_version SET version = 99 WHERE id = 1")
            .execute(&pool)
            .await
            .unwrap();

        let err = ensure_schema(&pool).await.unwrap_err();
        assert!(matches!(
            err,
            SchemaError::TooNew {
                found: 99,
                supported: TARGET_VERSION
            }
        ));
    }

    #[tokio::test]
    async fn failed_step_keeps_previous_version() {
        let pool = memory_pool().await;
        let broken = [
            MIGRATIONS[0],
            Migration {
                version: 2,
                description: "broken step",
                statements: &["ALTER TABLE no_such_table ADD COLUMN x TEXT"],
            },
        ];

        let err = ensure_schema_with(&pool, &broken).await.unwrap_err();
        assert!(matches!(err, SchemaError::MigrationFailed { version: 2, .. }));
        assert_eq!(current_version(&pool).await.unwrap(), 1);
    }
}
