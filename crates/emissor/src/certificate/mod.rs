//! A1 certificate management.
//!
//! Certificate containers (.pfx/.p12) live in blob storage; their
//! passwords are stored only as AES-256-GCM ciphertext in the database.
//! Plaintext passwords exist in memory only as [`SecretString`] and are
//! never logged.

use secrecy::SecretString;

use crate::db::{certificate_repo, certificate_repo::CertificateRow, Database};
use crate::error::CertificateError;
use crate::secrets::SecretStore;
use crate::storage::BlobStorage;

/// Largest accepted certificate container, in bytes (10 MiB).
pub const MAX_CERTIFICATE_SIZE: u64 = 10 * 1024 * 1024;

/// Decrypted material a signing implementation needs: the raw container
/// bytes and its password.
pub struct SigningMaterial {
    pub certificate: CertificateRow,
    pub container: Vec<u8>,
    pub password: SecretString,
}

pub struct CertificateManager {
    db: Database,
    storage: BlobStorage,
    secrets: SecretStore,
}

impl CertificateManager {
    pub fn new(db: Database, storage: BlobStorage, secrets: SecretStore) -> Self {
        Self {
            db,
            storage,
            secrets,
        }
    }

    /// Validates a container before any write happens: extension first,
    /// then size. Rejections here leave no row and no blob behind.
    fn validate_upload(filename: &str, content: &[u8]) -> Result<(), CertificateError> {
        let lower = filename.to_lowercase();
        if !lower.ends_with(".pfx") && !lower.ends_with(".p12") {
            return Err(CertificateError::InvalidExtension {
                filename: filename.to_string(),
            });
        }
        let size = content.len() as u64;
        if size > MAX_CERTIFICATE_SIZE {
            return Err(CertificateError::FileTooLarge {
                size,
                max: MAX_CERTIFICATE_SIZE,
            });
        }
        Ok(())
    }

    /// Uploads a certificate container with its password.
    ///
    /// Order matters for atomicity: validate, encrypt, write the blob,
    /// then insert the row. If the row insert fails, the blob is deleted
    /// so no orphan file remains.
    pub fn upload(
        &self,
        filename: &str,
        content: &[u8],
        password: &str,
    ) -> Result<CertificateRow, CertificateError> {
        Self::validate_upload(filename, content)?;

        let encrypted_password = self.secrets.encrypt(password)?;

        let id = uuid::Uuid::new_v4().to_string();
        let extension = if filename.to_lowercase().ends_with(".p12") {
            "p12"
        } else {
            "pfx"
        };
        let storage_path = format!("certificates/{}.{}", id, extension);

        self.storage.store(&storage_path, content)?;

        match certificate_repo::insert(&self.db, &id, filename, &storage_path, &encrypted_password)
        {
            Ok(row) => {
                log::info!("Certificate {} uploaded ({} bytes)", id, content.len());
                Ok(row)
            }
            Err(db_err) => {
                // Compensate: remove the blob we just wrote.
                if let Err(cleanup_err) = self.storage.delete(&storage_path) {
                    log::warn!(
                        "Failed to clean up blob after insert failure: {}",
                        cleanup_err
                    );
                }
                Err(db_err.into())
            }
        }
    }

    /// Binds a certificate to an establishment, replacing any previous
    /// binding.
    pub fn bind(
        &self,
        establishment_id: &str,
        certificate_id: &str,
    ) -> Result<(), CertificateError> {
        certificate_repo::bind(&self.db, establishment_id, certificate_id)?;
        log::info!(
            "Certificate {} bound to establishment {}",
            certificate_id,
            establishment_id
        );
        Ok(())
    }

    pub fn unbind(&self, establishment_id: &str) -> Result<(), CertificateError> {
        certificate_repo::unbind(&self.db, establishment_id)?;
        Ok(())
    }

    pub fn set_active(&self, certificate_id: &str, active: bool) -> Result<(), CertificateError> {
        certificate_repo::set_active(&self.db, certificate_id, active)?;
        Ok(())
    }

    /// Deletes a certificate: row and bindings first, blob after. A blob
    /// deletion failure is logged, not fatal, since the row is already gone.
    pub fn delete(&self, certificate_id: &str) -> Result<(), CertificateError> {
        let row = certificate_repo::find_by_id(&self.db, certificate_id)?.ok_or_else(|| {
            CertificateError::NotFound {
                id: certificate_id.to_string(),
            }
        })?;

        certificate_repo::delete(&self.db, certificate_id)?;
        if let Err(e) = self.storage.delete(&row.storage_path) {
            log::warn!("Certificate {} blob not removed: {}", certificate_id, e);
        }
        Ok(())
    }

    /// Resolves the active certificate bound to an establishment and
    /// decrypts its password. Fails when nothing is bound or the bound
    /// certificate is deactivated.
    pub fn resolve(
        &self,
        establishment_id: &str,
    ) -> Result<(CertificateRow, SecretString), CertificateError> {
        let row = certificate_repo::find_bound(&self.db, establishment_id)?
            .filter(|c| c.active)
            .ok_or_else(|| CertificateError::NoCertificateBound {
                establishment_id: establishment_id.to_string(),
            })?;

        let password = self.secrets.decrypt(&row.encrypted_password)?;
        Ok((row, password))
    }

    /// Loads everything a signer needs for an establishment: container
    /// bytes plus decrypted password.
    pub fn signing_material(
        &self,
        establishment_id: &str,
    ) -> Result<SigningMaterial, CertificateError> {
        let (certificate, password) = self.resolve(establishment_id)?;
        let container = self.storage.load(&certificate.storage_path)?;
        Ok(SigningMaterial {
            certificate,
            container,
            password,
        })
    }

    /// Verifies that a stored certificate is usable: blob present and
    /// password decryptable with the current master key.
    pub fn validate(&self, certificate_id: &str) -> Result<(), CertificateError> {
        let row = certificate_repo::find_by_id(&self.db, certificate_id)?.ok_or_else(|| {
            CertificateError::NotFound {
                id: certificate_id.to_string(),
            }
        })?;

        if !self.storage.exists(&row.storage_path) {
            return Err(CertificateError::Storage(
                crate::error::StorageError::ReadBlob {
                    path: self.storage.base_directory().join(&row.storage_path),
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "certificate blob missing",
                    ),
                },
            ));
        }

        self.secrets.decrypt(&row.encrypted_password)?;
        Ok(())
    }
}
