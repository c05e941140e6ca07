//! Certificate repository — A1 certificate metadata and bindings.
//!
//! Only the encrypted password ciphertext is stored here; the certificate
//! file itself lives in blob storage, referenced by `storage_path`.

use rusqlite::{params, OptionalExtension, Row};

use super::{now_str, Database, DatabaseError};

/// A stored A1 certificate. `encrypted_password` is ciphertext produced
/// by the secret store; it is never logged or returned to callers in
/// plaintext form.
#[derive(Debug, Clone)]
pub struct CertificateRow {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub storage_path: String,
    pub encrypted_password: String,
    pub created_at: String,
    pub updated_at: String,
}

impl CertificateRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            name: row.get("name")?,
            active: row.get("active")?,
            storage_path: row.get("storage_path")?,
            encrypted_password: row.get("encrypted_password")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

pub fn insert(
    db: &Database,
    id: &str,
    name: &str,
    storage_path: &str,
    encrypted_password: &str,
) -> Result<CertificateRow, DatabaseError> {
    let now = now_str();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO certificates (id, name, storage_path, encrypted_password, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, name, storage_path, encrypted_password, now],
        )?;
        conn.query_row(
            "SELECT * FROM certificates WHERE id = ?1",
            params![id],
            CertificateRow::from_row,
        )
        .map_err(Into::into)
    })
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<CertificateRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM certificates WHERE id = ?1",
                params![id],
                CertificateRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

pub fn list(db: &Database) -> Result<Vec<CertificateRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM certificates ORDER BY created_at")?;
        let rows = stmt
            .query_map([], CertificateRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Toggles whether a certificate may be used for signing. A deactivated
/// certificate keeps its bindings; resolution just refuses it.
pub fn set_active(db: &Database, id: &str, active: bool) -> Result<(), DatabaseError> {
    let now = now_str();
    db.with_conn(|conn| {
        let updated = conn.execute(
            "UPDATE certificates SET active = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, active, now],
        )?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "certificate",
                id: id.to_string(),
            });
        }
        Ok(())
    })
}

pub fn delete(db: &Database, id: &str) -> Result<(), DatabaseError> {
    db.with_tx(|tx| {
        tx.execute(
            "DELETE FROM establishment_certificates WHERE certificate_id = ?1",
            params![id],
        )?;
        let deleted = tx.execute("DELETE FROM certificates WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DatabaseError::NotFound {
                entity: "certificate",
                id: id.to_string(),
            });
        }
        Ok(())
    })
}

/// Binds a certificate to an establishment. An establishment holds at most
/// one binding (its primary key), so binding again replaces the previous
/// one atomically.
pub fn bind(
    db: &Database,
    establishment_id: &str,
    certificate_id: &str,
) -> Result<(), DatabaseError> {
    let now = now_str();
    db.with_tx(|tx| {
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM certificates WHERE id = ?1)",
            params![certificate_id],
            |r| r.get(0),
        )?;
        if !exists {
            return Err(DatabaseError::NotFound {
                entity: "certificate",
                id: certificate_id.to_string(),
            });
        }

        tx.execute(
            "DELETE FROM establishment_certificates WHERE establishment_id = ?1",
            params![establishment_id],
        )?;
        tx.execute(
            "INSERT INTO establishment_certificates (establishment_id, certificate_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![establishment_id, certificate_id, now],
        )?;
        Ok(())
    })
}

pub fn unbind(db: &Database, establishment_id: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM establishment_certificates WHERE establishment_id = ?1",
            params![establishment_id],
        )?;
        Ok(())
    })
}

/// The certificate currently bound to an establishment, if any.
pub fn find_bound(
    db: &Database,
    establishment_id: &str,
) -> Result<Option<CertificateRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT c.* FROM certificates c
                 JOIN establishment_certificates ec ON ec.certificate_id = c.id
                 WHERE ec.establishment_id = ?1",
                params![establishment_id],
                CertificateRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::establishment_repo;

    fn test_db() -> Database {
        let db = Database::open_in_memory().expect("Failed to create test database");
        establishment_repo::insert(&db, "e1", "11222333000181", "Transportes Teste").unwrap();
        establishment_repo::insert(&db, "e2", "99888777000166", "Filial Dois").unwrap();
        db
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        let cert = insert(&db, "c1", "matriz.pfx", "blobs/c1.pfx", "aabbcc").unwrap();
        assert!(cert.active);
        assert_eq!(cert.storage_path, "blobs/c1.pfx");

        let found = find_by_id(&db, "c1").unwrap().unwrap();
        assert_eq!(found.name, "matriz.pfx");
        assert!(find_by_id(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_bind_replaces_previous() {
        let db = test_db();
        insert(&db, "c1", "a.pfx", "blobs/c1.pfx", "xx").unwrap();
        insert(&db, "c2", "b.pfx", "blobs/c2.pfx", "yy").unwrap();

        bind(&db, "e1", "c1").unwrap();
        bind(&db, "e1", "c2").unwrap();

        let bound = find_bound(&db, "e1").unwrap().unwrap();
        assert_eq!(bound.id, "c2");
    }

    #[test]
    fn test_bind_unknown_certificate() {
        let db = test_db();
        let result = bind(&db, "e1", "ghost");
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
        assert!(find_bound(&db, "e1").unwrap().is_none());
    }

    #[test]
    fn test_unbind() {
        let db = test_db();
        insert(&db, "c1", "a.pfx", "blobs/c1.pfx", "xx").unwrap();
        bind(&db, "e1", "c1").unwrap();

        unbind(&db, "e1").unwrap();
        assert!(find_bound(&db, "e1").unwrap().is_none());

        // Unbinding an establishment with no binding is a no-op.
        unbind(&db, "e2").unwrap();
    }

    #[test]
    fn test_set_active() {
        let db = test_db();
        insert(&db, "c1", "a.pfx", "blobs/c1.pfx", "xx").unwrap();

        set_active(&db, "c1", false).unwrap();
        assert!(!find_by_id(&db, "c1").unwrap().unwrap().active);

        let result = set_active(&db, "ghost", true);
        assert!(matches!(result, Err(DatabaseError::NotFound { .. })));
    }

    #[test]
    fn test_delete_removes_bindings() {
        let db = test_db();
        insert(&db, "c1", "a.pfx", "blobs/c1.pfx", "xx").unwrap();
        bind(&db, "e1", "c1").unwrap();

        delete(&db, "c1").unwrap();
        assert!(find_by_id(&db, "c1").unwrap().is_none());
        assert!(find_bound(&db, "e1").unwrap().is_none());
    }
}
