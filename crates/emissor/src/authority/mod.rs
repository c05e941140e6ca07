//! Authority client abstraction.
//!
//! The transmission layer (XML assembly, signing, SOAP transport) sits
//! behind [`AuthorityClient`]; the queue and workers only see submission
//! outcomes. Tests plug in a scripted implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::certificate::SigningMaterial;
use crate::db::queue_repo::JobType;

/// Definitive answer from the authority for a submitted operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventOutcome {
    /// The operation was accepted and protocolized.
    Accepted {
        protocol: String,
        processed_at: String,
    },
    /// The authority refused the operation on business grounds. This is a
    /// final answer for the submitted content, not a transport failure.
    Rejected { reason: String },
}

/// Result of one submission call.
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// Access key assigned by the authority, when the operation emits a
    /// document.
    pub access_key: Option<String>,
    pub outcome: EventOutcome,
}

/// What the authority knows about a document, as reported by a status
/// query. Used to salvage calls that failed after the authority had
/// already processed them.
#[derive(Debug, Clone)]
pub enum AuthorityStatus {
    /// No record of the document.
    Unknown,
    Authorized {
        access_key: String,
        protocol: String,
        processed_at: String,
    },
    Rejected {
        reason: String,
    },
    Cancelled {
        protocol: String,
    },
}

#[derive(Error, Debug)]
pub enum AuthorityError {
    /// Transport-level failure. Retryable; the operation may or may not
    /// have reached the authority.
    #[error("Authority unavailable: {0}")]
    Unavailable(String),

    /// The authority answered with something we cannot interpret.
    #[error("Invalid authority response: {0}")]
    InvalidResponse(String),
}

/// One submission request (emission or MDF-e closing), carrying
/// everything the transmission layer needs besides the certificate.
#[derive(Debug, Clone)]
pub struct AuthorityRequest {
    pub job_type: JobType,
    pub document_id: String,
    pub establishment_id: String,
    /// Document payload as JSON text.
    pub document_payload: String,
    /// Operation payload as JSON text.
    pub operation_payload: String,
    /// Fiscal number and series, set for emission operations.
    pub numero: Option<i64>,
    pub serie: Option<i64>,
    /// Access key of the already-authorized document, set for closing.
    pub access_key: Option<String>,
}

/// A cancellation request for an authorized document.
#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub document_id: String,
    pub establishment_id: String,
    pub access_key: String,
    pub justification: String,
}

/// Client for the tax authority's web services.
///
/// Submission and cancellation receive the establishment's
/// [`SigningMaterial`] so the implementation can sign the payload itself;
/// the password stays a `SecretString` end to end.
#[async_trait]
pub trait AuthorityClient: Send + Sync {
    /// Submits an emission or closing. `Err(Unavailable)` means the call
    /// may have been processed anyway; callers must query status before
    /// retrying an emission.
    async fn submit(
        &self,
        request: &AuthorityRequest,
        signing: &SigningMaterial,
    ) -> Result<SubmitOutcome, AuthorityError>;

    /// Requests cancellation of an authorized document.
    async fn cancel(
        &self,
        request: &CancelRequest,
        signing: &SigningMaterial,
    ) -> Result<SubmitOutcome, AuthorityError>;

    /// Asks the authority what it knows about a document.
    async fn query_status(&self, document_id: &str) -> Result<AuthorityStatus, AuthorityError>;
}
