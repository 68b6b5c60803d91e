//! SQLite storage: revision pointers and daemon state, the audit log, the
//! run history, and the tables behind [`SqliteIndex`].

pub mod index;
pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

pub use index::SqliteIndex;

/// File name of the settings database inside `daemon.data_dir`.
pub const DB_FILE_NAME: &str = "karasync.db";

/// Settings, run history and content index storage. One connection behind
/// a mutex, shared through an `Arc`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file at `path`, creating missing parent
    /// directories. Journaling is WAL with a 5s busy timeout.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent)?,
            _ => {}
        }
        let conn = Connection::open(path)?;
        let journal: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        info!(path = %path.display(), journal = %journal, "database opened");
        Ok(Self::wrap(conn))
    }

    /// Open `karasync.db` in `data_dir` and bring its schema up to date.
    pub fn open_in(data_dir: &Path) -> Result<Self, DatabaseError> {
        let db = Self::new(data_dir.join(DB_FILE_NAME))?;
        db.initialize()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        Ok(Self::wrap(Connection::open_in_memory()?))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// Apply pending migrations.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn();
        schema::migrate(&mut conn)?;
        debug!("schema up to date");
        Ok(())
    }

    /// Lock the connection. A poisoned lock is taken over; SQLite keeps
    /// its own consistency.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            warn!("database lock poisoned, taking it over");
            poisoned.into_inner()
        })
    }

    /// Run `f` in a transaction, committed only when `f` succeeds.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}
