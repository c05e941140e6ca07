//! Job execution: one claimed queue job against the authority.
//!
//! Failure classification drives everything here. A business rejection is
//! a *successful* job (the authority answered); only transport failures
//! retry, and an emission never retries before asking the authority
//! whether the lost call actually went through.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use crate::authority::{
    AuthorityClient, AuthorityError, AuthorityRequest, AuthorityStatus, CancelRequest,
    EventOutcome, SubmitOutcome,
};
use crate::broadcast::FiscalBroadcaster;
use crate::certificate::CertificateManager;
use crate::config::QueueConfig;
use crate::db::document_repo::{self, AuthorizationProof, DocumentRow};
use crate::db::queue_repo::{self, JobRow, JobType};
use crate::db::{log_repo, now_str, Database, DatabaseError};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub call_timeout: Duration,
    pub stale_after: Duration,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub max_attempts: u32,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            stale_after: Duration::from_secs(config.stale_after_secs),
            backoff_base_secs: config.backoff_base_secs,
            backoff_cap_secs: config.backoff_cap_secs,
            max_attempts: config.max_attempts,
        }
    }
}

impl WorkerSettings {
    /// Exponential backoff for the next delivery of a job that has made
    /// `attempts` deliveries so far: `min(base * 2^(attempts-1), cap)`.
    pub fn backoff_delay(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let secs = self
            .backoff_base_secs
            .saturating_mul(1u64 << exponent)
            .min(self.backoff_cap_secs);
        chrono::Duration::seconds(secs as i64)
    }
}

/// Everything a worker needs, cheap to clone per task.
#[derive(Clone)]
pub struct WorkerContext {
    pub db: Database,
    pub certificates: Arc<CertificateManager>,
    pub authority: Arc<dyn AuthorityClient>,
    pub broadcaster: FiscalBroadcaster,
    pub settings: WorkerSettings,
}

/// Runs one claimed job to a queue transition (terminal or requeued).
pub async fn process_claimed_job(ctx: &WorkerContext, job: JobRow) -> Result<(), DatabaseError> {
    let span = tracing::info_span!(
        "fiscal_job",
        job_id = %job.id,
        job_type = %job.job_type,
        entity_id = %job.entity_id,
        attempt = job.attempts,
    );
    run_job(ctx, job).instrument(span).await
}

async fn run_job(ctx: &WorkerContext, job: JobRow) -> Result<(), DatabaseError> {
    let document = match document_repo::find_by_id(&ctx.db, &job.entity_id)? {
        Some(doc) => doc,
        None => {
            return fail_permanently(ctx, &job, "Document no longer exists").await;
        }
    };

    // Certificate problems are permanent: retrying cannot fix a missing
    // binding or an undecryptable password.
    let signing = match ctx.certificates.signing_material(&document.establishment_id) {
        Ok(material) => material,
        Err(e) => {
            log::error!("Job {}: certificate unusable: {}", job.id, e);
            return fail_permanently(ctx, &job, &format!("Certificate unusable: {}", e)).await;
        }
    };

    let call = if job.job_type == JobType::CancelCte {
        let request = CancelRequest {
            document_id: document.id.clone(),
            establishment_id: document.establishment_id.clone(),
            access_key: document.access_key.clone().unwrap_or_default(),
            justification: extract_justification(&job.payload),
        };
        tokio::time::timeout(
            ctx.settings.call_timeout,
            ctx.authority.cancel(&request, &signing),
        )
        .await
    } else {
        let request = AuthorityRequest {
            job_type: job.job_type,
            document_id: document.id.clone(),
            establishment_id: document.establishment_id.clone(),
            document_payload: document.payload.clone(),
            operation_payload: job.payload.clone(),
            numero: document.numero,
            serie: document.serie,
            access_key: document.access_key.clone(),
        };
        tokio::time::timeout(
            ctx.settings.call_timeout,
            ctx.authority.submit(&request, &signing),
        )
        .await
    };

    match call {
        Ok(Ok(outcome)) => apply_outcome(ctx, &job, &document, outcome).await,
        Ok(Err(AuthorityError::InvalidResponse(msg))) => {
            log::error!("Job {}: unintelligible authority response: {}", job.id, msg);
            fail_permanently(ctx, &job, &format!("Invalid authority response: {}", msg)).await
        }
        Ok(Err(AuthorityError::Unavailable(msg))) => {
            handle_transport_failure(ctx, &job, &document, &msg, false).await
        }
        Err(_) => {
            let msg = format!(
                "Authority call exceeded {}s deadline",
                ctx.settings.call_timeout.as_secs()
            );
            handle_transport_failure(ctx, &job, &document, &msg, true).await
        }
    }
}

fn extract_justification(payload: &str) -> String {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("justification").and_then(|j| j.as_str()).map(String::from))
        .unwrap_or_default()
}

/// A lost call may have been processed. Before burning a retry (or the
/// whole job), ask the authority what it knows; a definitive answer is
/// applied as if the original call had returned it.
async fn handle_transport_failure(
    ctx: &WorkerContext,
    job: &JobRow,
    document: &DocumentRow,
    error: &str,
    timed_out: bool,
) -> Result<(), DatabaseError> {
    log::warn!("Job {} attempt {} failed: {}", job.id, job.attempts, error);

    let salvage = tokio::time::timeout(
        ctx.settings.call_timeout,
        ctx.authority.query_status(&document.id),
    )
    .await;

    if let Ok(Ok(status)) = salvage {
        match (job.job_type, status) {
            (
                JobType::EmitCte | JobType::EmitMdfe,
                AuthorityStatus::Authorized {
                    access_key,
                    protocol,
                    processed_at,
                },
            ) => {
                log::info!("Job {}: lost call was authorized, salvaging", job.id);
                return apply_outcome(
                    ctx,
                    job,
                    document,
                    SubmitOutcome {
                        access_key: Some(access_key),
                        outcome: EventOutcome::Accepted {
                            protocol,
                            processed_at,
                        },
                    },
                )
                .await;
            }
            (JobType::EmitCte | JobType::EmitMdfe, AuthorityStatus::Rejected { reason }) => {
                return apply_outcome(
                    ctx,
                    job,
                    document,
                    SubmitOutcome {
                        access_key: None,
                        outcome: EventOutcome::Rejected { reason },
                    },
                )
                .await;
            }
            (JobType::CancelCte, AuthorityStatus::Cancelled { protocol }) => {
                log::info!("Job {}: lost call was cancelled, salvaging", job.id);
                return apply_outcome(
                    ctx,
                    job,
                    document,
                    SubmitOutcome {
                        access_key: None,
                        outcome: EventOutcome::Accepted {
                            protocol,
                            processed_at: now_str(),
                        },
                    },
                )
                .await;
            }
            _ => {}
        }
    }

    if job.can_retry() {
        let delay = ctx.settings.backoff_delay(job.attempts);
        let requeued = queue_repo::requeue_with_backoff(&ctx.db, &job.id, error, delay)?;
        ctx.broadcaster.publish_job(&requeued);
        return Ok(());
    }

    // Budget exhausted. Timeout is terminal only when the final delivery
    // actually timed out.
    let terminal = if timed_out {
        queue_repo::mark_timeout(&ctx.db, &job.id, error)?
    } else {
        queue_repo::mark_failed(&ctx.db, &job.id, error)?
    };
    ctx.broadcaster.publish_job(&terminal);
    log_repo::append(
        &ctx.db,
        "document",
        &job.entity_id,
        "emission_exhausted",
        &serde_json::json!({ "job_id": job.id, "error": error }).to_string(),
    )?;
    Ok(())
}

async fn apply_outcome(
    ctx: &WorkerContext,
    job: &JobRow,
    document: &DocumentRow,
    outcome: SubmitOutcome,
) -> Result<(), DatabaseError> {
    match (job.job_type, outcome.outcome) {
        (
            JobType::EmitCte | JobType::EmitMdfe,
            EventOutcome::Accepted {
                protocol,
                processed_at,
            },
        ) => {
            let access_key = match outcome.access_key {
                Some(key) => key,
                None => {
                    return fail_permanently(
                        ctx,
                        job,
                        "Authority accepted an emission without an access key",
                    )
                    .await;
                }
            };

            let proof = AuthorizationProof {
                access_key: access_key.clone(),
                protocol: protocol.clone(),
                authorized_at: processed_at,
            };
            let authorized = document_repo::mark_authorized(&ctx.db, &document.id, &proof)?;
            ctx.broadcaster.publish_document(&authorized);

            let result = serde_json::json!({
                "status": "authorized",
                "access_key": access_key,
                "protocol": protocol,
                "numero": authorized.numero,
                "serie": authorized.serie,
            });
            complete(ctx, job, &result.to_string(), "authorized").await
        }
        (JobType::EmitCte | JobType::EmitMdfe, EventOutcome::Rejected { reason }) => {
            let rejected = document_repo::mark_rejected(&ctx.db, &document.id, &reason)?;
            ctx.broadcaster.publish_document(&rejected);

            let result = serde_json::json!({ "status": "rejected", "reason": reason });
            complete(ctx, job, &result.to_string(), "rejected").await
        }
        (
            JobType::CancelCte,
            EventOutcome::Accepted {
                protocol,
                processed_at,
            },
        ) => {
            let cancelled =
                document_repo::mark_cancelled(&ctx.db, &document.id, &protocol, &processed_at)?;
            ctx.broadcaster.publish_document(&cancelled);

            let result = serde_json::json!({ "status": "cancelled", "protocol": protocol });
            complete(ctx, job, &result.to_string(), "cancelled").await
        }
        (
            JobType::CloseMdfe,
            EventOutcome::Accepted {
                protocol,
                processed_at,
            },
        ) => {
            // Closing records its protocol on the job; the manifest stays
            // authorized.
            let result = serde_json::json!({
                "status": "closed",
                "protocol": protocol,
                "closed_at": processed_at,
            });
            complete(ctx, job, &result.to_string(), "closed").await
        }
        (JobType::CancelCte | JobType::CloseMdfe, EventOutcome::Rejected { reason }) => {
            // The authority refused the operation; the document keeps its
            // current status. Still a completed job: we got an answer.
            let result = serde_json::json!({ "status": "refused", "reason": reason });
            complete(ctx, job, &result.to_string(), "operation_refused").await
        }
    }
}

async fn complete(
    ctx: &WorkerContext,
    job: &JobRow,
    result: &str,
    action: &str,
) -> Result<(), DatabaseError> {
    let completed = queue_repo::mark_completed(&ctx.db, &job.id, result)?;
    ctx.broadcaster.publish_job(&completed);
    log_repo::append(&ctx.db, "document", &job.entity_id, action, result)?;
    log::info!("Job {} completed: {}", job.id, action);
    Ok(())
}

async fn fail_permanently(
    ctx: &WorkerContext,
    job: &JobRow,
    error: &str,
) -> Result<(), DatabaseError> {
    let failed = queue_repo::mark_failed(&ctx.db, &job.id, error)?;
    ctx.broadcaster.publish_job(&failed);
    log_repo::append(
        &ctx.db,
        "document",
        &job.entity_id,
        "job_failed",
        &serde_json::json!({ "job_id": job.id, "error": error }).to_string(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base: u64, cap: u64) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            call_timeout: Duration::from_secs(1),
            stale_after: Duration::from_secs(120),
            backoff_base_secs: base,
            backoff_cap_secs: cap,
            max_attempts: 3,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let s = settings(30, 600);
        assert_eq!(s.backoff_delay(1), chrono::Duration::seconds(30));
        assert_eq!(s.backoff_delay(2), chrono::Duration::seconds(60));
        assert_eq!(s.backoff_delay(3), chrono::Duration::seconds(120));
        assert_eq!(s.backoff_delay(5), chrono::Duration::seconds(480));
        assert_eq!(s.backoff_delay(6), chrono::Duration::seconds(600));
        assert_eq!(s.backoff_delay(60), chrono::Duration::seconds(600));
    }

    #[test]
    fn test_backoff_zero_attempts() {
        let s = settings(30, 600);
        assert_eq!(s.backoff_delay(0), chrono::Duration::seconds(30));
    }
}
