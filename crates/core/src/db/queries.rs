//! Typed query helpers for the settings, audit and run-history tables.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::DatabaseError;

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub repository: String,
    pub success: bool,
    pub details: Option<String>,
    pub created_at: String,
}

/// A row from the `sync_runs` table.
#[derive(Debug, Clone)]
pub struct SyncRunEntry {
    pub id: String,
    pub repository: String,
    pub kind: String,
    pub mode: String,
    pub from_revision: Option<String>,
    pub to_revision: Option<String>,
    pub status: String,
    pub details: Option<String>,
    pub started_at: String,
    pub completed_at: Option<String>,
}

const SYNC_RUN_COLUMNS: &str = "id, repository, kind, mode, from_revision, to_revision, \
                                status, details, started_at, completed_at";

fn sync_run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRunEntry> {
    Ok(SyncRunEntry {
        id: row.get(0)?,
        repository: row.get(1)?,
        kind: row.get(2)?,
        mode: row.get(3)?,
        from_revision: row.get(4)?,
        to_revision: row.get(5)?,
        status: row.get(6)?,
        details: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn revision_key(repository: &str) -> String {
    format!("repo_revision:{repository}")
}

impl Database {
    // -- settings ------------------------------------------------------------

    /// Raw settings value.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, value, now],
        )?;
        debug!(key, value, "setting stored");
        Ok(())
    }

    pub fn delete_state(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
        debug!(key, "setting removed");
        Ok(())
    }

    // -- revision pointers --------------------------------------------------

    /// Last revision fully applied to `repository`, if any.
    pub fn get_revision(&self, repository: &str) -> Result<Option<String>, DatabaseError> {
        self.get_state(&revision_key(repository))
    }

    pub fn set_revision(&self, repository: &str, revision: &str) -> Result<(), DatabaseError> {
        self.set_state(&revision_key(repository), revision)
    }

    /// Forget the revision pointer so the next update installs a snapshot.
    pub fn clear_revision(&self, repository: &str) -> Result<(), DatabaseError> {
        self.delete_state(&revision_key(repository))
    }

    // -- audit trail ---------------------------------------------------------

    /// Append to the audit trail; returns the new row id.
    pub fn insert_audit_log(
        &self,
        action: &str,
        repository: &str,
        success: bool,
        details: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, repository, success, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![action, repository, success, details, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action, repository, success, "audit entry recorded");
        Ok(id)
    }

    /// List recent audit-log entries, optionally for one repository.
    pub fn list_audit_log(
        &self,
        repository: Option<&str>,
        limit: u32,
    ) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, repository, success, details, created_at
             FROM audit_log
             WHERE ?1 IS NULL OR repository = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![repository, limit], |row| {
            Ok(AuditLogEntry {
                id: row.get(0)?,
                action: row.get(1)?,
                repository: row.get(2)?,
                success: row.get(3)?,
                details: row.get(4)?,
                created_at: row.get(5)?,
            })
        })?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn count_audit_log(&self) -> Result<i64, DatabaseError> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    // -- sync_runs ----------------------------------------------------------

    /// Record the start of a run.
    pub fn start_sync_run(
        &self,
        id: &str,
        repository: &str,
        kind: &str,
        mode: &str,
        from_revision: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT INTO sync_runs (id, repository, kind, mode, from_revision, status, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
            params![id, repository, kind, mode, from_revision, now],
        )?;
        debug!(id, repository, kind, mode, "started sync run");
        Ok(())
    }

    /// Mark a run as finished.
    pub fn complete_sync_run(
        &self,
        id: &str,
        status: &str,
        to_revision: Option<&str>,
        details: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn().execute(
            "UPDATE sync_runs SET status = ?1, to_revision = ?2, details = ?3, completed_at = ?4
             WHERE id = ?5",
            params![status, to_revision, details, now, id],
        )?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "sync_run".into(),
                id: id.to_string(),
            });
        }
        debug!(id, status, "completed sync run");
        Ok(())
    }

    /// Most recent run of `repository`.
    pub fn get_latest_sync_run(
        &self,
        repository: &str,
    ) -> Result<Option<SyncRunEntry>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .query_row(
                &format!(
                    "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs WHERE repository = ?1
                     ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                params![repository],
                sync_run_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn list_sync_runs(&self, limit: u32) -> Result<Vec<SyncRunEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SYNC_RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], sync_run_from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    #[test]
    fn test_kv_state() {
        let db = setup_db();
        assert_eq!(db.get_state("missing").unwrap(), None);
        db.set_state("key", "v1").unwrap();
        db.set_state("key", "v2").unwrap();
        assert_eq!(db.get_state("key").unwrap().as_deref(), Some("v2"));
        db.delete_state("key").unwrap();
        assert_eq!(db.get_state("key").unwrap(), None);
    }

    #[test]
    fn test_revision_pointer() {
        let db = setup_db();
        db.set_revision("kara.moe", "abc123").unwrap();
        assert_eq!(
            db.get_state("repo_revision:kara.moe").unwrap().as_deref(),
            Some("abc123")
        );
        assert_eq!(db.get_revision("other").unwrap(), None);
        db.clear_revision("kara.moe").unwrap();
        assert_eq!(db.get_revision("kara.moe").unwrap(), None);
    }

    #[test]
    fn test_audit_log() {
        let db = setup_db();
        db.insert_audit_log("update", "a", true, Some("3 changes"))
            .unwrap();
        db.insert_audit_log("update", "b", false, Some("[unreachable] b"))
            .unwrap();

        assert_eq!(db.count_audit_log().unwrap(), 2);
        let all = db.list_audit_log(None, 10).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].repository, "b");

        let only_a = db.list_audit_log(Some("a"), 10).unwrap();
        assert_eq!(only_a.len(), 1);
        assert!(only_a[0].success);
    }

    #[test]
    fn test_sync_runs() {
        let db = setup_db();
        db.start_sync_run("run-1", "a", "update", "archive", Some("r1"))
            .unwrap();
        db.complete_sync_run("run-1", "success", Some("r2"), None)
            .unwrap();

        let latest = db.get_latest_sync_run("a").unwrap().unwrap();
        assert_eq!(latest.status, "success");
        assert_eq!(latest.from_revision.as_deref(), Some("r1"));
        assert_eq!(latest.to_revision.as_deref(), Some("r2"));
        assert!(latest.completed_at.is_some());

        assert!(db.get_latest_sync_run("b").unwrap().is_none());
        assert_eq!(db.list_sync_runs(10).unwrap().len(), 1);
        assert!(db.complete_sync_run("missing", "failed", None, None).is_err());
    }
}
