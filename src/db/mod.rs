//! SQLite-backed store for the signal log, learned reliability, and the
//! entity graph mirror.
//!
//! The database lives at `~/.dailyos/signals.db` unless configured otherwise.
//! It runs in WAL mode so background workers can open their own connections
//! to the same file and append signals concurrently with the engine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;

pub mod graph;
pub mod types;
pub use types::*;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SignalDb {
    conn: Connection,
    path: PathBuf,
}

impl SignalDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| DbError::Transaction(format!("Failed to begin transaction: {e}")))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(DbError::Transaction(format!("Failed to commit transaction: {e}")).into());
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `~/.dailyos/signals.db` and apply the schema.
    pub fn open() -> Result<Self, DbError> {
        let path = Self::default_path()?;
        Self::open_at(path)
    }

    /// Open a database at an explicit path.
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL lets readers and the append-only writers proceed concurrently
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        Ok(Self { conn, path })
    }

    /// Open a second connection to the same file (for a background worker).
    pub fn reopen(&self) -> Result<Self, DbError> {
        Self::open_at(self.path.clone())
    }

    /// Resolve the default database path: `~/.dailyos/signals.db`.
    pub fn default_path() -> Result<PathBuf, DbError> {
        let home = dirs::home_dir().ok_or(DbError::HomeDirNotFound)?;
        Ok(home.join(".dailyos").join("signals.db"))
    }

    /// Read a named rowid cursor used by background consumers.
    pub fn get_cursor(&self, name: &str) -> Result<i64, DbError> {
        match self.conn.query_row(
            "SELECT position FROM engine_cursors WHERE name = ?1",
            [name],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(pos) => Ok(pos),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(0),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Advance a named cursor. Never moves backwards.
    pub fn set_cursor(&self, name: &str, position: i64) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO engine_cursors (name, position, updated_at)
             VALUES (?1, ?2, datetime('now'))
             ON CONFLICT (name) DO UPDATE SET
                position = MAX(position, excluded.position),
                updated_at = datetime('now')",
            rusqlite::params![name, position],
        )?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_open_creates_tables() {
        let db = test_db();
        let count: i32 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM signal_weights", [], |row| row.get(0))
            .expect("signal_weights should exist");
        assert_eq!(count, 0);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|tx| {
            tx.conn_ref().execute(
                "INSERT INTO engine_cursors (name, position) VALUES ('c', 1)",
                [],
            )?;
            Err(DbError::Transaction("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.get_cursor("c").expect("cursor"), 0);
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let db = test_db();
        db.set_cursor("propagation", 10).expect("set");
        db.set_cursor("propagation", 4).expect("set lower");
        assert_eq!(db.get_cursor("propagation").expect("get"), 10);
    }

    #[test]
    fn test_reopen_shares_file() {
        let db = test_db();
        db.set_cursor("shared", 3).expect("set");
        let second = db.reopen().expect("reopen");
        assert_eq!(second.get_cursor("shared").expect("get"), 3);
    }
}
