use thiserror::Error;

/// Failures of the SQLite store. Any error returned from a merge means its
/// transaction was rolled back.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Includes rows whose stored ids or timestamps no longer parse.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("No platform data directory to place the database in")]
    NoDataDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The chat a write targeted is not stored.
    #[error("Record not found")]
    NotFound,

    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;
