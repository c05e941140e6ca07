//! Document repository — CT-e/MDF-e rows and their lifecycle transitions.
//!
//! Business state lives here; queue rows are only an execution log. Every
//! transition function checks the current status and applies its update in
//! one transaction, refusing illegal moves with `InvalidState`; no other
//! transition can commit between the check and the update.

use rusqlite::{params, OptionalExtension, Row};

use super::{establishment_repo, now_str, Database, DatabaseError};
use crate::document::{DocKind, DocumentStatus};

/// A document row.
///
/// Invariants maintained by the transition functions below:
/// `numero`/`access_key`/`protocol`/`authorized_at` are set exactly on the
/// move into `authorized`, `rejection_reason` exactly on the move into
/// `rejected` (and cleared when an edit returns the document to `draft`),
/// `cancel_protocol`/`cancelled_at` exactly on the move into `cancelled`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DocumentRow {
    pub id: String,
    pub doc_kind: DocKind,
    pub establishment_id: String,
    pub status: DocumentStatus,
    pub numero: Option<i64>,
    pub serie: Option<i64>,
    pub access_key: Option<String>,
    pub protocol: Option<String>,
    pub authorized_at: Option<String>,
    pub rejection_reason: Option<String>,
    pub cancel_protocol: Option<String>,
    pub cancelled_at: Option<String>,
    /// Opaque business payload (parties, cargo, values) as JSON text.
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
}

impl DocumentRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            doc_kind: row.get("doc_kind")?,
            establishment_id: row.get("establishment_id")?,
            status: row.get("status")?,
            numero: row.get("numero")?,
            serie: row.get("serie")?,
            access_key: row.get("access_key")?,
            protocol: row.get("protocol")?,
            authorized_at: row.get("authorized_at")?,
            rejection_reason: row.get("rejection_reason")?,
            cancel_protocol: row.get("cancel_protocol")?,
            cancelled_at: row.get("cancelled_at")?,
            payload: row.get("payload")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Authority proof recorded when a document is authorized.
#[derive(Debug, Clone)]
pub struct AuthorizationProof {
    pub access_key: String,
    pub protocol: String,
    pub authorized_at: String,
}

/// Inserts a new draft document and returns its row.
pub fn insert_draft(
    db: &Database,
    id: &str,
    kind: DocKind,
    establishment_id: &str,
    payload: &str,
) -> Result<DocumentRow, DatabaseError> {
    let now = now_str();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO documents (id, doc_kind, establishment_id, status, payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'draft', ?4, ?5, ?5)",
            params![id, kind, establishment_id, payload, now],
        )?;
        conn.query_row(
            "SELECT * FROM documents WHERE id = ?1",
            params![id],
            DocumentRow::from_row,
        )
        .map_err(Into::into)
    })
}

/// Finds a document by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<DocumentRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM documents WHERE id = ?1",
                params![id],
                DocumentRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Fetches a document inside an open transaction, so a status check and
/// the update it guards see the same row.
fn fetch_in_tx(conn: &rusqlite::Connection, id: &str) -> Result<DocumentRow, DatabaseError> {
    conn.query_row(
        "SELECT * FROM documents WHERE id = ?1",
        params![id],
        DocumentRow::from_row,
    )
    .optional()?
    .ok_or_else(|| DatabaseError::NotFound {
        entity: "document",
        id: id.to_string(),
    })
}

/// Replaces the business payload of an editable document.
///
/// Legal only from `draft` or `rejected`. Editing a rejected document is
/// the edit-then-resubmit flow: it clears the rejection reason and returns
/// the document to `draft`.
pub fn update_draft_payload(
    db: &Database,
    id: &str,
    payload: &str,
) -> Result<DocumentRow, DatabaseError> {
    db.with_tx(|tx| {
        let doc = fetch_in_tx(tx, id)?;
        if !doc.status.is_editable() {
            return Err(DatabaseError::InvalidState {
                status: doc.status.to_string(),
                action: "edit the payload".to_string(),
            });
        }

        tx.execute(
            "UPDATE documents SET payload = ?2, status = 'draft', rejection_reason = NULL,
             updated_at = ?3 WHERE id = ?1 AND status IN ('draft', 'rejected')",
            params![id, payload, now_str()],
        )?;
        fetch_in_tx(tx, id)
    })
}

/// Marks a document authorized, assigning its number from the issuing
/// establishment's sequence and recording the authority proof.
///
/// The sequence advance and the status flip commit in one transaction, so
/// a failed authorization never consumes a number and authorized numbers
/// have no gaps.
pub fn mark_authorized(
    db: &Database,
    id: &str,
    proof: &AuthorizationProof,
) -> Result<DocumentRow, DatabaseError> {
    db.with_tx(|tx| {
        let doc = fetch_in_tx(tx, id)?;
        if doc.status != DocumentStatus::Draft {
            return Err(DatabaseError::InvalidState {
                status: doc.status.to_string(),
                action: "authorize".to_string(),
            });
        }

        let (numero, serie) =
            establishment_repo::advance_sequence(tx, &doc.establishment_id, doc.doc_kind)?;

        tx.execute(
            "UPDATE documents SET status = 'authorized', numero = ?2, serie = ?3,
             access_key = ?4, protocol = ?5, authorized_at = ?6, rejection_reason = NULL,
             updated_at = ?7 WHERE id = ?1",
            params![
                id,
                numero,
                serie,
                proof.access_key,
                proof.protocol,
                proof.authorized_at,
                now_str(),
            ],
        )?;

        fetch_in_tx(tx, id)
    })
}

/// Marks a document rejected with the authority's reason.
pub fn mark_rejected(db: &Database, id: &str, reason: &str) -> Result<DocumentRow, DatabaseError> {
    db.with_tx(|tx| {
        let doc = fetch_in_tx(tx, id)?;
        if doc.status != DocumentStatus::Draft {
            return Err(DatabaseError::InvalidState {
                status: doc.status.to_string(),
                action: "reject".to_string(),
            });
        }

        tx.execute(
            "UPDATE documents SET status = 'rejected', rejection_reason = ?2, updated_at = ?3
             WHERE id = ?1 AND status = 'draft'",
            params![id, reason, now_str()],
        )?;
        fetch_in_tx(tx, id)
    })
}

/// Marks an authorized document cancelled, recording the cancellation proof.
pub fn mark_cancelled(
    db: &Database,
    id: &str,
    cancel_protocol: &str,
    cancelled_at: &str,
) -> Result<DocumentRow, DatabaseError> {
    db.with_tx(|tx| {
        let doc = fetch_in_tx(tx, id)?;
        if !doc.status.can_cancel() {
            return Err(DatabaseError::InvalidState {
                status: doc.status.to_string(),
                action: "cancel".to_string(),
            });
        }

        tx.execute(
            "UPDATE documents SET status = 'cancelled', cancel_protocol = ?2, cancelled_at = ?3,
             updated_at = ?4 WHERE id = ?1 AND status = 'authorized'",
            params![id, cancel_protocol, cancelled_at, now_str()],
        )?;
        fetch_in_tx(tx, id)
    })
}
