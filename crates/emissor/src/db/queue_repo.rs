//! Emission queue repository — durable jobs mediating between client
//! requests and the external authority.
//!
//! Two rules are enforced by the storage layer itself, not by application
//! checks: at most one open (pending/processing) job per document, via a
//! partial unique index, and exactly one claimant per job, via a single
//! conditional `UPDATE ... RETURNING`.

use rusqlite::{params, OptionalExtension, Row};

use super::{format_instant, now_str, Database, DatabaseError};
use chrono::{Duration, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use serde::{Deserialize, Serialize};

/// Action a job performs against the authority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    EmitCte,
    CancelCte,
    EmitMdfe,
    CloseMdfe,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EmitCte => "emit_cte",
            JobType::CancelCte => "cancel_cte",
            JobType::EmitMdfe => "emit_mdfe",
            JobType::CloseMdfe => "close_mdfe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "emit_cte" => Some(JobType::EmitCte),
            "cancel_cte" => Some(JobType::CancelCte),
            "emit_mdfe" => Some(JobType::EmitMdfe),
            "close_mdfe" => Some(JobType::CloseMdfe),
            _ => None,
        }
    }

    /// Whether this job submits a document for authorization.
    pub fn is_emission(&self) -> bool {
        matches!(self, JobType::EmitCte | JobType::EmitMdfe)
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for JobType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for JobType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown job type '{}'", s).into()))
    }
}

/// Status of a queue job. `pending → processing → {completed|failed|timeout}`,
/// monotonic; a terminal job is never resurrected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "timeout" => Some(JobStatus::Timeout),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s)
            .ok_or_else(|| FromSqlError::Other(format!("unknown job status '{}'", s).into()))
    }
}

/// A queue job row.
#[derive(Debug, Clone, Serialize)]
pub struct JobRow {
    pub id: String,
    pub job_type: JobType,
    pub entity_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Operation payload (e.g. cancellation justification) as JSON text.
    pub payload: String,
    /// Terminal result payload as JSON text.
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            entity_id: row.get("entity_id")?,
            status: row.get("status")?,
            attempts: row.get("attempts")?,
            max_attempts: row.get("max_attempts")?,
            payload: row.get("payload")?,
            result: row.get("result")?,
            error_message: row.get("error_message")?,
            next_retry_at: row.get("next_retry_at")?,
            claimed_by: row.get("claimed_by")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// Attempts still available after the current one.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Enqueues a new pending job for a document.
///
/// Fails with `ConcurrentJobExists` when a pending or processing job
/// already references the entity; the partial unique index closes the
/// check-then-insert race.
pub fn enqueue(
    db: &Database,
    job_type: JobType,
    entity_id: &str,
    payload: &str,
    max_attempts: u32,
) -> Result<JobRow, DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_str();

    db.with_conn(|conn| {
        let inserted = conn.execute(
            "INSERT INTO fiscal_queue (id, job_type, entity_id, status, payload, max_attempts, created_at)
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![id, job_type, entity_id, payload, max_attempts, now],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                return Err(DatabaseError::ConcurrentJobExists {
                    entity_id: entity_id.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        conn.query_row(
            "SELECT * FROM fiscal_queue WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .map_err(Into::into)
    })
}

/// Atomically claims the oldest due pending job for a worker.
///
/// A single conditional `UPDATE ... RETURNING` flips the row to
/// `processing`, stamps `started_at`, and increments `attempts` — exactly
/// one claimant can win a given job even with concurrent workers.
pub fn claim(db: &Database, worker_id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let now = now_str();
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "UPDATE fiscal_queue
                 SET status = 'processing', started_at = ?2, claimed_by = ?3,
                     attempts = attempts + 1
                 WHERE id = (
                     SELECT id FROM fiscal_queue
                     WHERE status = 'pending'
                       AND (next_retry_at IS NULL OR next_retry_at <= ?1)
                     ORDER BY created_at
                     LIMIT 1
                 )
                 RETURNING *",
                params![now, now, worker_id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM fiscal_queue WHERE id = ?1",
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

/// Finds the open (pending or processing) job for an entity, if any.
pub fn find_open_for_entity(
    db: &Database,
    entity_id: &str,
) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row(
                "SELECT * FROM fiscal_queue
                 WHERE entity_id = ?1 AND status IN ('pending', 'processing')",
                params![entity_id],
                JobRow::from_row,
            )
            .optional()?;
        Ok(row)
    })
}

fn transition_from_processing(
    db: &Database,
    id: &str,
    set_clause: &str,
    extra: &[&dyn rusqlite::types::ToSql],
) -> Result<JobRow, DatabaseError> {
    db.with_conn(|conn| {
        let mut all_params: Vec<&dyn rusqlite::types::ToSql> = vec![&id];
        all_params.extend_from_slice(extra);

        let updated = conn.execute(
            &format!(
                "UPDATE fiscal_queue SET {} WHERE id = ?1 AND status = 'processing'",
                set_clause
            ),
            all_params.as_slice(),
        )?;
        if updated == 0 {
            let status = conn
                .query_row(
                    "SELECT status FROM fiscal_queue WHERE id = ?1",
                    params![id],
                    |r| r.get::<_, String>(0),
                )
                .optional()?;
            return Err(match status {
                Some(status) => DatabaseError::InvalidState {
                    status,
                    action: "transition the job".to_string(),
                },
                None => DatabaseError::NotFound {
                    entity: "job",
                    id: id.to_string(),
                },
            });
        }

        conn.query_row(
            "SELECT * FROM fiscal_queue WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .map_err(Into::into)
    })
}

/// Returns a processing job to `pending`, scheduled no earlier than
/// `delay` from now. The attempt count is left as incremented by the
/// claim, so the retry budget keeps counting.
pub fn requeue_with_backoff(
    db: &Database,
    id: &str,
    error: &str,
    delay: Duration,
) -> Result<JobRow, DatabaseError> {
    let retry_at = format_instant(Utc::now() + delay);
    transition_from_processing(
        db,
        id,
        "status = 'pending', error_message = ?2, next_retry_at = ?3,
         started_at = NULL, claimed_by = NULL",
        &[&error, &retry_at],
    )
}

/// Marks a processing job completed with its result payload.
///
/// "Completed" means the authority gave a definitive answer — a business
/// rejection also completes the job; the rejection lives on the document.
pub fn mark_completed(db: &Database, id: &str, result: &str) -> Result<JobRow, DatabaseError> {
    let now = now_str();
    transition_from_processing(
        db,
        id,
        "status = 'completed', result = ?2, completed_at = ?3, error_message = NULL",
        &[&result, &now],
    )
}

/// Marks a processing job failed after its retry budget is exhausted, or
/// immediately for non-retryable failures such as bad secret material.
pub fn mark_failed(db: &Database, id: &str, error: &str) -> Result<JobRow, DatabaseError> {
    let now = now_str();
    transition_from_processing(
        db,
        id,
        "status = 'failed', error_message = ?2, completed_at = ?3",
        &[&error, &now],
    )
}

/// Marks a processing job timed out.
pub fn mark_timeout(db: &Database, id: &str, error: &str) -> Result<JobRow, DatabaseError> {
    let now = now_str();
    transition_from_processing(
        db,
        id,
        "status = 'timeout', error_message = ?2, completed_at = ?3",
        &[&error, &now],
    )
}

/// Reclaims processing jobs whose claim went stale (worker crashed or was
/// killed mid-flight). Jobs with budget left return to `pending`; the rest
/// become `timeout`. Returns every affected row.
pub fn sweep_stale(db: &Database, stale_after: Duration) -> Result<Vec<JobRow>, DatabaseError> {
    let cutoff = format_instant(Utc::now() - stale_after);
    let now = now_str();

    db.with_tx(|tx| {
        let stale: Vec<JobRow> = {
            let mut stmt = tx.prepare(
                "SELECT * FROM fiscal_queue WHERE status = 'processing' AND started_at < ?1",
            )?;
            let rows = stmt
                .query_map(params![cutoff], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut affected = Vec::with_capacity(stale.len());
        for job in stale {
            if job.can_retry() {
                tx.execute(
                    "UPDATE fiscal_queue SET status = 'pending', started_at = NULL,
                     claimed_by = NULL, error_message = ?2 WHERE id = ?1",
                    params![job.id, "Stale claim: worker did not finish in time"],
                )?;
            } else {
                tx.execute(
                    "UPDATE fiscal_queue SET status = 'timeout', completed_at = ?2,
                     error_message = ?3 WHERE id = ?1",
                    params![job.id, now, "Stale claim: retry budget exhausted"],
                )?;
            }
            let fresh = tx.query_row(
                "SELECT * FROM fiscal_queue WHERE id = ?1",
                params![job.id],
                JobRow::from_row,
            )?;
            affected.push(fresh);
        }
        Ok(affected)
    })
}
