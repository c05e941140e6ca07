//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// Row lookup by id came up empty.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// A state-machine transition was attempted from an illegal status.
    #[error("Cannot {action} while status is '{status}'")]
    InvalidState { status: String, action: String },

    /// A pending or processing job already exists for the entity.
    ///
    /// Raised by the partial unique index on `fiscal_queue(entity_id)`,
    /// which is what makes the at-most-one-open-job rule race-free.
    #[error("A job is already open for entity {entity_id}")]
    ConcurrentJobExists { entity_id: String },
}
