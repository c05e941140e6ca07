//! Audit log repository. Append-only records of fiscal actions.

use rusqlite::{params, Row};

use super::{now_str, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct LogRow {
    pub id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub action: String,
    pub details: String,
    pub created_at: String,
}

impl LogRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            entity_kind: row.get("entity_kind")?,
            entity_id: row.get("entity_id")?,
            action: row.get("action")?,
            details: row.get("details")?,
            created_at: row.get("created_at")?,
        })
    }
}

/// Appends an audit entry. `details` is a JSON text blob; callers must
/// keep secrets and certificate passwords out of it.
pub fn append(
    db: &Database,
    entity_kind: &str,
    entity_id: &str,
    action: &str,
    details: &str,
) -> Result<(), DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_str();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO fiscal_logs (id, entity_kind, entity_id, action, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, entity_kind, entity_id, action, details, now],
        )?;
        Ok(())
    })
}

/// All entries for an entity, oldest first.
pub fn list_for_entity(db: &Database, entity_id: &str) -> Result<Vec<LogRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM fiscal_logs WHERE entity_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![entity_id], LogRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
