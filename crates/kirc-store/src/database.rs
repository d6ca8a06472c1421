//! Database connection management.
//!
//! [`Database`] owns a [`rusqlite::Connection`] and runs migrations before
//! handing it out. Secrets never reach SQLite in the clear: channel keys are
//! sealed to the local identity before they are stored.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::migrations;

pub const DB_FILE_NAME: &str = "kirc.db";

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the database in the platform data directory:
    /// - Linux:   `~/.local/share/kirc/kirc.db`
    /// - macOS:   `~/Library/Application Support/dev.kirc.kirc/kirc.db`
    pub fn open_default() -> Result<Self> {
        Self::open(&default_data_dir()?)
    }

    /// Open (or create) `kirc.db` inside `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE_NAME);
        tracing::info!(path = %db_path.display(), "opening database");
        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Throwaway database, used by tests and the simulation.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Filesystem path of the open database (`None` when in memory).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }
}

/// Platform data directory for K-IRC
pub fn default_data_dir() -> Result<PathBuf> {
    ProjectDirs::from("dev", "kirc", "kirc")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or(StoreError::NoDataDir)
}

pub(crate) fn column_err<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn parse_timestamp(index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| column_err(index, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_file_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).expect("should open");

        let path = db.path().expect("file-backed database has a path");
        assert!(path.ends_with(DB_FILE_NAME));

        let version: u32 = db
            .conn()
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }

    #[test]
    fn reopen_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        drop(Database::open(dir.path()).unwrap());
        assert!(Database::open(dir.path()).is_ok());
    }

    #[test]
    fn newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        db.conn()
            .pragma_update(None, "user_version", migrations::CURRENT_VERSION + 1)
            .unwrap();
        drop(db);

        let result = Database::open(dir.path());
        assert!(matches!(result, Err(StoreError::NewerSchema { .. })));
    }

    #[test]
    fn in_memory_has_no_path() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.path(), None);
    }
}
