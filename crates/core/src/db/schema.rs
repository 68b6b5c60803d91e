//! Schema migrations, tracked through SQLite's `user_version` pragma.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// `(version, description, sql)`, ascending.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            repository  TEXT NOT NULL,
            success     INTEGER NOT NULL DEFAULT 1,
            details     TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_repository ON audit_log (repository);

        CREATE TABLE IF NOT EXISTS sync_runs (
            id              TEXT PRIMARY KEY,
            repository      TEXT NOT NULL,
            kind            TEXT NOT NULL CHECK (kind IN ('update', 'push')),
            mode            TEXT NOT NULL,
            from_revision   TEXT,
            to_revision     TEXT,
            status          TEXT NOT NULL DEFAULT 'running',
            details         TEXT,
            started_at      TEXT NOT NULL,
            completed_at    TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_sync_runs_repository ON sync_runs (repository, started_at);
        "#,
    ),
    (
        2,
        "content index",
        r#"
        CREATE TABLE IF NOT EXISTS index_karas (
            repository  TEXT NOT NULL,
            kid         TEXT NOT NULL,
            path        TEXT NOT NULL,
            parents     TEXT NOT NULL DEFAULT '[]',
            tag_ids     TEXT NOT NULL DEFAULT '[]',
            data        TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (repository, kid)
        );

        CREATE TABLE IF NOT EXISTS index_tags (
            repository  TEXT NOT NULL,
            tid         TEXT NOT NULL,
            path        TEXT NOT NULL,
            name        TEXT NOT NULL DEFAULT '',
            data        TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            PRIMARY KEY (repository, tid)
        );

        CREATE TABLE IF NOT EXISTS index_fonts (
            repository  TEXT NOT NULL,
            path        TEXT NOT NULL,
            PRIMARY KEY (repository, path)
        );

        CREATE TABLE IF NOT EXISTS index_kara_tags (
            repository  TEXT NOT NULL,
            kid         TEXT NOT NULL,
            tid         TEXT NOT NULL,
            PRIMARY KEY (repository, kid, tid)
        );
        "#,
    ),
];

/// Latest schema version.
pub fn target_version() -> u32 {
    MIGRATIONS.last().map(|m| m.0).unwrap_or(0)
}

/// Apply every migration newer than the stored `user_version`, each in its
/// own transaction together with the version bump.
pub fn migrate(conn: &mut Connection) -> Result<u32, DatabaseError> {
    let mut version = schema_version(conn)?;
    let pending: Vec<_> = MIGRATIONS.iter().filter(|m| m.0 > version).collect();
    if pending.is_empty() {
        debug!(version, "no pending migration");
        return Ok(version);
    }

    for &(target, description, sql) in pending {
        info!(from = version, to = target, description, "migrating database");
        let fail = |e: rusqlite::Error| DatabaseError::MigrationFailed {
            version: target,
            detail: e.to_string(),
        };
        let tx = conn.transaction().map_err(fail)?;
        tx.execute_batch(sql).map_err(fail)?;
        tx.pragma_update(None, "user_version", target).map_err(fail)?;
        tx.commit().map_err(fail)?;
        version = target;
    }
    Ok(version)
}

fn schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
