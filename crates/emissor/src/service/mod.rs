//! Client-facing fiscal service.
//!
//! Requests validate synchronously, enqueue a durable job, and either
//! return a handle immediately (async mode) or wait a bounded time for
//! the job's terminal event (sync mode). Both modes ride the same
//! subscription primitive; sync is just a timeout wrapper around it.

use std::time::Duration;

use crate::broadcast::{FiscalBroadcaster, JobSubscription};
use crate::config::QueueConfig;
use crate::db::document_repo::{self, DocumentRow};
use crate::db::queue_repo::{self, JobRow, JobType};
use crate::db::{log_repo, Database, DatabaseError};
use crate::document::{DocKind, DocumentStatus};
use crate::error::ServiceError;

/// Minimum length of a cancellation justification, a SEFAZ rule.
pub const MIN_JUSTIFICATION_LEN: usize = 15;

/// How an emission request should behave once the job is queued.
#[derive(Debug, Clone, Default)]
pub struct EmissionOptions {
    /// `Some(duration)` waits up to that long for the terminal event
    /// (sync mode); `None` returns a handle immediately (async mode).
    pub wait: Option<Duration>,
}

impl EmissionOptions {
    pub fn asynchronous() -> Self {
        Self { wait: None }
    }

    pub fn wait_up_to(duration: Duration) -> Self {
        Self {
            wait: Some(duration),
        }
    }
}

/// Outcome of a request.
pub enum EmissionResponse {
    /// The job reached a terminal status within the wait window.
    Completed { job: JobRow, document: DocumentRow },
    /// The job is queued (or still running after the wait window); the
    /// handle can keep waiting without losing events.
    Accepted(JobHandle),
}

/// A live view of one queued job.
pub struct JobHandle {
    job: JobRow,
    subscription: JobSubscription,
    db: Database,
}

impl JobHandle {
    /// The job as it was when the handle was created.
    pub fn job(&self) -> &JobRow {
        &self.job
    }

    /// Waits for the job's terminal row.
    ///
    /// A database pre-check covers the window between enqueueing and
    /// subscribing: a job that already finished is returned without
    /// touching the event stream. Dropping the handle instead of waiting
    /// never affects the job.
    pub async fn wait(&mut self) -> Result<JobRow, ServiceError> {
        let current =
            queue_repo::find_by_id(&self.db, &self.job.id)?.ok_or(ServiceError::JobNotFound {
                id: self.job.id.clone(),
            })?;
        if current.status.is_terminal() {
            return Ok(current);
        }

        match self.subscription.finished().await {
            Some(row) => Ok(row),
            // Broadcaster gone (shutdown); the database is the truth.
            None => {
                queue_repo::find_by_id(&self.db, &self.job.id)?.ok_or(ServiceError::JobNotFound {
                    id: self.job.id.clone(),
                })
            }
        }
    }
}

#[derive(Clone)]
pub struct FiscalService {
    db: Database,
    broadcaster: FiscalBroadcaster,
    max_attempts: u32,
}

impl FiscalService {
    pub fn new(db: Database, broadcaster: FiscalBroadcaster, queue: &QueueConfig) -> Self {
        Self {
            db,
            broadcaster,
            max_attempts: queue.max_attempts,
        }
    }

    /// Creates a draft document for an establishment.
    pub fn create_draft(
        &self,
        kind: DocKind,
        establishment_id: &str,
        payload: &str,
    ) -> Result<DocumentRow, ServiceError> {
        let id = uuid::Uuid::new_v4().to_string();
        let row = document_repo::insert_draft(&self.db, &id, kind, establishment_id, payload)?;
        Ok(row)
    }

    /// Replaces a draft or rejected document's payload. A rejected
    /// document returns to draft with its rejection reason cleared, ready
    /// to resubmit.
    pub fn update_draft(&self, document_id: &str, payload: &str) -> Result<DocumentRow, ServiceError> {
        document_repo::update_draft_payload(&self.db, document_id, payload)
            .map_err(|e| map_document_error(e, document_id))
    }

    /// Requests emission of a document to the authority.
    ///
    /// Valid only for draft or rejected documents; a document with an
    /// open job refuses a second one.
    pub async fn request_emission(
        &self,
        document_id: &str,
        options: EmissionOptions,
    ) -> Result<EmissionResponse, ServiceError> {
        let document = self.require_document(document_id)?;
        if !document.status.can_submit() {
            return Err(ServiceError::InvalidState {
                status: document.status.to_string(),
                action: "emission".to_string(),
            });
        }

        let job_type = match document.doc_kind {
            DocKind::Cte => JobType::EmitCte,
            DocKind::Mdfe => JobType::EmitMdfe,
        };

        self.dispatch(job_type, &document, "{}", "emission_requested", options)
            .await
    }

    /// Requests cancellation of an authorized document. The justification
    /// is a legal requirement and must carry at least
    /// [`MIN_JUSTIFICATION_LEN`] characters.
    pub async fn request_cancellation(
        &self,
        document_id: &str,
        justification: &str,
        options: EmissionOptions,
    ) -> Result<EmissionResponse, ServiceError> {
        if justification.chars().count() < MIN_JUSTIFICATION_LEN {
            return Err(ServiceError::Validation(format!(
                "Cancellation justification must have at least {} characters",
                MIN_JUSTIFICATION_LEN
            )));
        }

        let document = self.require_document(document_id)?;
        // The cancellation event exists for CT-e only; an MDF-e leaves
        // circulation through closing.
        if document.doc_kind != DocKind::Cte {
            return Err(ServiceError::Validation(
                "Only CT-e documents can be cancelled".to_string(),
            ));
        }
        if !document.status.can_cancel() {
            return Err(ServiceError::InvalidState {
                status: document.status.to_string(),
                action: "cancellation".to_string(),
            });
        }

        let payload = serde_json::json!({ "justification": justification }).to_string();
        self.dispatch(
            JobType::CancelCte,
            &document,
            &payload,
            "cancellation_requested",
            options,
        )
        .await
    }

    /// Requests closing of an authorized MDF-e manifest.
    pub async fn request_closing(
        &self,
        document_id: &str,
        options: EmissionOptions,
    ) -> Result<EmissionResponse, ServiceError> {
        let document = self.require_document(document_id)?;
        if document.doc_kind != DocKind::Mdfe {
            return Err(ServiceError::Validation(
                "Only MDF-e manifests can be closed".to_string(),
            ));
        }
        if document.status != DocumentStatus::Authorized {
            return Err(ServiceError::InvalidState {
                status: document.status.to_string(),
                action: "closing".to_string(),
            });
        }

        self.dispatch(
            JobType::CloseMdfe,
            &document,
            "{}",
            "closing_requested",
            options,
        )
        .await
    }

    pub fn job_status(&self, job_id: &str) -> Result<JobRow, ServiceError> {
        queue_repo::find_by_id(&self.db, job_id)?.ok_or(ServiceError::JobNotFound {
            id: job_id.to_string(),
        })
    }

    pub fn document_status(&self, document_id: &str) -> Result<DocumentRow, ServiceError> {
        self.require_document(document_id)
    }

    /// Follows a document's events with no terminal semantics; the
    /// stream stays open until dropped.
    pub fn watch_document(
        &self,
        document_id: &str,
    ) -> Result<crate::broadcast::EntitySubscription, ServiceError> {
        let document = self.require_document(document_id)?;
        Ok(self.broadcaster.subscribe_entity(&document.id))
    }

    /// Re-attaches to a job already in the queue.
    pub fn watch(&self, job_id: &str) -> Result<JobHandle, ServiceError> {
        let job = self.job_status(job_id)?;
        let subscription = self.broadcaster.subscribe_job(&job.id, &job.entity_id);
        Ok(JobHandle {
            job,
            subscription,
            db: self.db.clone(),
        })
    }

    async fn dispatch(
        &self,
        job_type: JobType,
        document: &DocumentRow,
        payload: &str,
        audit_action: &str,
        options: EmissionOptions,
    ) -> Result<EmissionResponse, ServiceError> {
        let job = queue_repo::enqueue(
            &self.db,
            job_type,
            &document.id,
            payload,
            self.max_attempts,
        )
        .map_err(|e| match e {
            DatabaseError::ConcurrentJobExists { entity_id } => {
                ServiceError::ConcurrentJobExists { entity_id }
            }
            other => other.into(),
        })?;

        log_repo::append(
            &self.db,
            "document",
            &document.id,
            audit_action,
            &serde_json::json!({ "job_id": job.id, "job_type": job.job_type }).to_string(),
        )?;
        self.broadcaster.publish_job(&job);
        log::info!("Job {} queued ({}) for document {}", job.id, job_type, document.id);

        let subscription = self.broadcaster.subscribe_job(&job.id, &job.entity_id);
        let mut handle = JobHandle {
            job,
            subscription,
            db: self.db.clone(),
        };

        let wait = match options.wait {
            Some(wait) => wait,
            None => return Ok(EmissionResponse::Accepted(handle)),
        };

        let waited = tokio::time::timeout(wait, handle.wait()).await;
        match waited {
            Ok(job) => {
                let job = job?;
                let document = self.require_document(&job.entity_id)?;
                Ok(EmissionResponse::Completed { job, document })
            }
            // Wait window elapsed; the job keeps running.
            Err(_) => Ok(EmissionResponse::Accepted(handle)),
        }
    }

    fn require_document(&self, document_id: &str) -> Result<DocumentRow, ServiceError> {
        document_repo::find_by_id(&self.db, document_id)?.ok_or(ServiceError::DocumentNotFound {
            id: document_id.to_string(),
        })
    }
}

fn map_document_error(e: DatabaseError, document_id: &str) -> ServiceError {
    match e {
        DatabaseError::NotFound { .. } => ServiceError::DocumentNotFound {
            id: document_id.to_string(),
        },
        DatabaseError::InvalidState { status, action } => {
            ServiceError::InvalidState { status, action }
        }
        other => other.into(),
    }
}
