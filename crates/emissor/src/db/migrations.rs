//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const CREATE_ESTABLISHMENTS_AND_DOCUMENTS: &str = "
CREATE TABLE establishments (
    id TEXT PRIMARY KEY,
    cnpj TEXT NOT NULL,
    razao_social TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    serie_cte INTEGER NOT NULL DEFAULT 1,
    last_cte_number INTEGER NOT NULL DEFAULT 0,
    serie_mdfe INTEGER NOT NULL DEFAULT 1,
    last_mdfe_number INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE documents (
    id TEXT PRIMARY KEY,
    doc_kind TEXT NOT NULL,
    establishment_id TEXT NOT NULL REFERENCES establishments(id),
    status TEXT NOT NULL DEFAULT 'draft',
    numero INTEGER,
    serie INTEGER,
    access_key TEXT,
    protocol TEXT,
    authorized_at TEXT,
    rejection_reason TEXT,
    cancel_protocol TEXT,
    cancelled_at TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX idx_documents_establishment ON documents(establishment_id);
CREATE INDEX idx_documents_status ON documents(status);
";

const CREATE_CERTIFICATES: &str = "
CREATE TABLE certificates (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    storage_path TEXT NOT NULL,
    encrypted_password TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE establishment_certificates (
    establishment_id TEXT PRIMARY KEY REFERENCES establishments(id),
    certificate_id TEXT NOT NULL REFERENCES certificates(id),
    created_at TEXT NOT NULL
);
";

const CREATE_FISCAL_QUEUE: &str = "
CREATE TABLE fiscal_queue (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    entity_id TEXT NOT NULL REFERENCES documents(id),
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    payload TEXT NOT NULL DEFAULT '{}',
    result TEXT,
    error_message TEXT,
    next_retry_at TEXT,
    claimed_by TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

-- At most one open job per document, enforced by the engine rather than
-- checked-then-inserted.
CREATE UNIQUE INDEX idx_queue_open_entity ON fiscal_queue(entity_id)
    WHERE status IN ('pending', 'processing');

CREATE INDEX idx_queue_status_created ON fiscal_queue(status, created_at);
";

const CREATE_FISCAL_LOGS: &str = "
CREATE TABLE fiscal_logs (
    id TEXT PRIMARY KEY,
    entity_kind TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    action TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE INDEX idx_fiscal_logs_entity ON fiscal_logs(entity_id);
";

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_establishments_and_documents",
        sql: CREATE_ESTABLISHMENTS_AND_DOCUMENTS,
    },
    Migration {
        version: 2,
        description: "create_certificates",
        sql: CREATE_CERTIFICATES,
    },
    Migration {
        version: 3,
        description: "create_fiscal_queue",
        sql: CREATE_FISCAL_QUEUE,
    },
    Migration {
        version: 4,
        description: "create_fiscal_logs",
        sql: CREATE_FISCAL_LOGS,
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        conn.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let count: u32 = conn
            .query_row("SELECT COUNT(*) FROM _migrations", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, MIGRATIONS.len() as u32);
    }

    #[test]
    fn test_open_job_uniqueness_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
        run_all(&conn).unwrap();

        conn.execute(
            "INSERT INTO establishments (id, cnpj, razao_social, created_at, updated_at)
             VALUES ('e1', '11222333000181', 'T', '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO documents (id, doc_kind, establishment_id, created_at, updated_at)
             VALUES ('d1', 'cte', 'e1', '2026-01-01', '2026-01-01')",
            [],
        )
        .unwrap();

        conn.execute(
            "INSERT INTO fiscal_queue (id, job_type, entity_id, status, created_at)
             VALUES ('j1', 'emit_cte', 'd1', 'pending', '2026-01-01')",
            [],
        )
        .unwrap();

        // Second open job for the same entity violates the partial index.
        let second = conn.execute(
            "INSERT INTO fiscal_queue (id, job_type, entity_id, status, created_at)
             VALUES ('j2', 'emit_cte', 'd1', 'pending', '2026-01-01')",
            [],
        );
        assert!(second.is_err());

        // A completed job does not block a new one.
        conn.execute(
            "UPDATE fiscal_queue SET status = 'completed' WHERE id = 'j1'",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO fiscal_queue (id, job_type, entity_id, status, created_at)
             VALUES ('j3', 'emit_cte', 'd1', 'pending', '2026-01-01')",
            [],
        )
        .unwrap();
    }
}
