//! Minimal SQLite-backed [`ContentIndex`].
//!
//! Stores the raw JSON of every song and tag keyed by uid, plus a derived
//! song-to-tag table rebuilt on [`refresh`](ContentIndex::refresh).

use std::sync::Arc;

use chrono::Utc;
use rusqlite::params;
use tracing::debug;

use super::Database;
use crate::applier::ContentIndex;
use crate::errors::{ApplyError, DatabaseError};
use crate::meta::{KaraMetaFile, TagMetaFile};

/// Content index for one repository inside the shared [`Database`].
#[derive(Clone)]
pub struct SqliteIndex {
    db: Arc<Database>,
    repository: String,
}

impl SqliteIndex {
    pub fn new(db: Arc<Database>, repository: impl Into<String>) -> Self {
        Self {
            db,
            repository: repository.into(),
        }
    }

    pub fn count_karas(&self) -> Result<i64, DatabaseError> {
        self.count("SELECT COUNT(*) FROM index_karas WHERE repository = ?1")
    }

    pub fn count_tags(&self) -> Result<i64, DatabaseError> {
        self.count("SELECT COUNT(*) FROM index_tags WHERE repository = ?1")
    }

    pub fn count_fonts(&self) -> Result<i64, DatabaseError> {
        self.count("SELECT COUNT(*) FROM index_fonts WHERE repository = ?1")
    }

    /// Path of the file a song was last integrated from.
    pub fn kara_path(&self, kid: &str) -> Result<Option<String>, DatabaseError> {
        use rusqlite::OptionalExtension;
        let path = self
            .db
            .conn()
            .query_row(
                "SELECT path FROM index_karas WHERE repository = ?1 AND kid = ?2",
                params![self.repository, kid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path)
    }

    /// Song ids linked to `tid` as of the last refresh.
    pub fn karas_with_tag(&self, tid: &str) -> Result<Vec<String>, DatabaseError> {
        let conn = self.db.conn();
        let mut stmt = conn.prepare(
            "SELECT kid FROM index_kara_tags WHERE repository = ?1 AND tid = ?2 ORDER BY kid",
        )?;
        let rows = stmt.query_map(params![self.repository, tid], |row| row.get(0))?;
        let mut kids = Vec::new();
        for row in rows {
            kids.push(row?);
        }
        Ok(kids)
    }

    fn count(&self, sql: &str) -> Result<i64, DatabaseError> {
        let n = self
            .db
            .conn()
            .query_row(sql, params![self.repository], |row| row.get(0))?;
        Ok(n)
    }

    fn remove_by(&self, table_sql: &str, ids: &[String]) -> Result<(), ApplyError> {
        let repository = self.repository.clone();
        self.db.transaction(|conn| {
            let mut stmt = conn.prepare(table_sql)?;
            for id in ids {
                stmt.execute(params![repository, id])?;
            }
            Ok(())
        })?;
        Ok(())
    }
}

impl ContentIndex for SqliteIndex {
    fn integrate_tag(&self, tag: &TagMetaFile) -> Result<(), ApplyError> {
        let data = serde_json::to_string(&tag.raw).map_err(DatabaseError::from)?;
        self.db
            .conn()
            .execute(
                "INSERT INTO index_tags (repository, tid, path, name, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(repository, tid) DO UPDATE SET
                    path = excluded.path, name = excluded.name,
                    data = excluded.data, updated_at = excluded.updated_at",
                params![
                    self.repository,
                    tag.tid,
                    tag.path,
                    tag.name,
                    data,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(DatabaseError::from)?;
        debug!(repository = %self.repository, tid = %tag.tid, "tag integrated");
        Ok(())
    }

    fn integrate_kara(&self, kara: &KaraMetaFile) -> Result<(), ApplyError> {
        let data = serde_json::to_string(&kara.raw).map_err(DatabaseError::from)?;
        let parents = serde_json::to_string(&kara.data.parents).map_err(DatabaseError::from)?;
        let tag_ids = serde_json::to_string(&kara.data.tag_ids).map_err(DatabaseError::from)?;
        self.db
            .conn()
            .execute(
                "INSERT INTO index_karas (repository, kid, path, parents, tag_ids, data, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(repository, kid) DO UPDATE SET
                    path = excluded.path, parents = excluded.parents, tag_ids = excluded.tag_ids,
                    data = excluded.data, updated_at = excluded.updated_at",
                params![
                    self.repository,
                    kara.data.kid,
                    kara.path,
                    parents,
                    tag_ids,
                    data,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(DatabaseError::from)?;
        debug!(repository = %self.repository, kid = %kara.data.kid, "song integrated");
        Ok(())
    }

    fn remove_tags(&self, tids: &[String]) -> Result<(), ApplyError> {
        self.remove_by(
            "DELETE FROM index_tags WHERE repository = ?1 AND tid = ?2",
            tids,
        )
    }

    fn remove_karas(&self, kids: &[String]) -> Result<(), ApplyError> {
        self.remove_by(
            "DELETE FROM index_karas WHERE repository = ?1 AND kid = ?2",
            kids,
        )
    }

    fn add_font(&self, path: &str) -> Result<(), ApplyError> {
        self.db
            .conn()
            .execute(
                "INSERT OR IGNORE INTO index_fonts (repository, path) VALUES (?1, ?2)",
                params![self.repository, path],
            )
            .map_err(DatabaseError::from)?;
        Ok(())
    }

    fn remove_font(&self, path: &str) -> Result<(), ApplyError> {
        self.db
            .conn()
            .execute(
                "DELETE FROM index_fonts WHERE repository = ?1 AND path = ?2",
                params![self.repository, path],
            )
            .map_err(DatabaseError::from)?;
        Ok(())
    }

    fn refresh(&self) -> Result<(), ApplyError> {
        let repository = self.repository.clone();
        self.db.transaction(|conn| {
            conn.execute(
                "DELETE FROM index_kara_tags WHERE repository = ?1",
                params![repository],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO index_kara_tags (repository, kid, tid)
                 SELECT k.repository, k.kid, j.value
                 FROM index_karas k, json_each(k.tag_ids) j
                 WHERE k.repository = ?1",
                params![repository],
            )?;
            Ok(())
        })?;
        debug!(repository = %self.repository, "content index refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::{kara_json, tag_json};

    fn index() -> SqliteIndex {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        SqliteIndex::new(Arc::new(db), "kara.moe")
    }

    #[test]
    fn test_upsert_and_remove() {
        let index = index();
        let json = kara_json("k1", &[], ("a.mp4", 1), &["t1"]);
        let kara = KaraMetaFile::parse("karaokes/a.kara.json", json.as_bytes()).unwrap();
        index.integrate_kara(&kara).unwrap();
        index.integrate_kara(&kara).unwrap();
        assert_eq!(index.count_karas().unwrap(), 1);

        let tag_src = tag_json("t1", "Rock");
        let tag = TagMetaFile::parse("tags/rock.tag.json", tag_src.as_bytes()).unwrap();
        index.integrate_tag(&tag).unwrap();
        index.refresh().unwrap();
        assert_eq!(index.karas_with_tag("t1").unwrap(), vec!["k1"]);

        index.remove_karas(&["k1".to_string()]).unwrap();
        index.remove_tags(&["t1".to_string()]).unwrap();
        index.refresh().unwrap();
        assert_eq!(index.count_karas().unwrap(), 0);
        assert_eq!(index.count_tags().unwrap(), 0);
        assert!(index.karas_with_tag("t1").unwrap().is_empty());
    }

    #[test]
    fn test_fonts() {
        let index = index();
        index.add_font("fonts/a.ttf").unwrap();
        index.add_font("fonts/a.ttf").unwrap();
        assert_eq!(index.count_fonts().unwrap(), 1);
        index.remove_font("fonts/a.ttf").unwrap();
        assert_eq!(index.count_fonts().unwrap(), 0);
    }

    #[test]
    fn test_repositories_are_isolated() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        let db = Arc::new(db);
        let a = SqliteIndex::new(Arc::clone(&db), "a");
        let b = SqliteIndex::new(db, "b");

        let json = kara_json("k1", &[], ("a.mp4", 1), &[]);
        let kara = KaraMetaFile::parse("karaokes/a.kara.json", json.as_bytes()).unwrap();
        a.integrate_kara(&kara).unwrap();
        assert_eq!(a.count_karas().unwrap(), 1);
        assert_eq!(b.count_karas().unwrap(), 0);
        assert_eq!(a.kara_path("k1").unwrap().as_deref(), Some("karaokes/a.kara.json"));
    }
}
