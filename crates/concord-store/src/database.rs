//! Opening the SQLite file.
//!
//! A [`Database`] is only handed out after the schema has been brought up to
//! date, so every query in the crate can assume the current layout.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

/// The SQLite implementation of [`crate::ChatStore`]. Not internally
/// synchronized; one owner at a time.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open the database in the platform data directory, creating it on
    /// first use:
    /// - Linux:   `~/.local/share/concord/concord.db`
    /// - macOS:   `~/Library/Application Support/org.concord.concord/concord.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\concord\concord\data\concord.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("org", "concord", "concord").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("concord.db");

        tracing::info!(path = %db_path.display(), "opening default database");
        Self::open_at(&db_path)
    }

    /// Open a database file at `path`. Missing parent directories are
    /// created.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Needed to open a transaction.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Path of the open file; `None` for in-memory connections.
    pub fn path(&self) -> Option<PathBuf> {
        self.conn.path().map(PathBuf::from)
    }
}

#[cfg(test)]
pub(crate) fn open_temp() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_at(&dir.path().join("test.db")).expect("should open");
    (dir, db)
}
