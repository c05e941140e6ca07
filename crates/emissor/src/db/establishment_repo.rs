//! Establishment repository — issuing entities and their numbering sequences.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{now_str, Database, DatabaseError};
use crate::document::DocKind;

/// An establishment row (matriz or filial) permitted to issue documents.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EstablishmentRow {
    pub id: String,
    pub cnpj: String,
    pub razao_social: String,
    pub active: bool,
    pub serie_cte: i64,
    pub last_cte_number: i64,
    pub serie_mdfe: i64,
    pub last_mdfe_number: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl EstablishmentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            cnpj: row.get("cnpj")?,
            razao_social: row.get("razao_social")?,
            active: row.get("active")?,
            serie_cte: row.get("serie_cte")?,
            last_cte_number: row.get("last_cte_number")?,
            serie_mdfe: row.get("serie_mdfe")?,
            last_mdfe_number: row.get("last_mdfe_number")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Inserts a new establishment with an empty numbering sequence.
pub fn insert(db: &Database, id: &str, cnpj: &str, razao_social: &str) -> Result<(), DatabaseError> {
    let now = now_str();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO establishments (id, cnpj, razao_social, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, cnpj, razao_social, now],
        )?;
        Ok(())
    })
}

/// Finds an establishment by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<EstablishmentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM establishments WHERE id = ?1",
                params![id],
                EstablishmentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Atomically advances the numbering sequence for one document kind and
/// returns the freshly assigned `(numero, serie)` pair.
///
/// Takes a raw connection so it can run inside the same transaction that
/// marks a document authorized — a number must never be consumed by an
/// authorization that does not commit.
pub fn advance_sequence(
    conn: &Connection,
    establishment_id: &str,
    kind: DocKind,
) -> Result<(i64, i64), DatabaseError> {
    let (number_col, serie_col) = match kind {
        DocKind::Cte => ("last_cte_number", "serie_cte"),
        DocKind::Mdfe => ("last_mdfe_number", "serie_mdfe"),
    };

    let updated = conn.execute(
        &format!(
            "UPDATE establishments SET {n} = {n} + 1, updated_at = ?2 WHERE id = ?1",
            n = number_col
        ),
        params![establishment_id, now_str()],
    )?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "establishment",
            id: establishment_id.to_string(),
        });
    }

    let pair = conn.query_row(
        &format!(
            "SELECT {n}, {s} FROM establishments WHERE id = ?1",
            n = number_col,
            s = serie_col
        ),
        params![establishment_id],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
    )?;
    Ok(pair)
}
