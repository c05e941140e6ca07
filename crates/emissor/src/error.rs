use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmissorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write blob '{path}': {source}")]
    WriteBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read blob '{path}': {source}")]
    ReadBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete blob '{path}': {source}")]
    DeleteBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Blob already exists: {0}")]
    BlobExists(PathBuf),
}

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Unsupported certificate file '{filename}': only .pfx or .p12 containers are accepted")]
    InvalidExtension { filename: String },

    #[error("Certificate file is {size} bytes, exceeding the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Certificate {id} not found")]
    NotFound { id: String },

    #[error("No active certificate bound to establishment {establishment_id}")]
    NoCertificateBound { establishment_id: String },

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

/// Errors surfaced by the `FiscalService` facade.
///
/// Validation failures are rejected synchronously, before any job row
/// is created.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document {id} not found")]
    DocumentNotFound { id: String },

    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Document is '{status}', which does not permit {action}")]
    InvalidState { status: String, action: String },

    #[error("A job is already pending or processing for document {entity_id}")]
    ConcurrentJobExists { entity_id: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

pub type Result<T> = std::result::Result<T, EmissorError>;
