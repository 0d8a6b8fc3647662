//! Durable, at-least-once task queue on Postgres.
//!
//! Tasks are keyed by `(function_name, reference_id)` with a partial unique
//! index over not-yet-completed rows, which serializes pipeline stages per
//! document. Workers claim due tasks with a lease (`FOR UPDATE SKIP
//! LOCKED`), so multiple processes can compete safely; a claim that is
//! neither completed nor released expires with its lease and becomes
//! claimable again until the claim budget runs out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Default claim lease.
const DEFAULT_CLAIM_TIME: Duration = Duration::from_secs(5 * 60);

/// Default retry budget per task.
const DEFAULT_MAX_CLAIM_COUNT: i32 = 2;

/// Delay applied when a failed claim is released back to the queue.
const RELEASE_BACKOFF: Duration = Duration::from_secs(30);

/// Errors raised by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A not-yet-completed task with the same function and reference exists.
    #[error("duplicate task for function '{function_name}' and reference '{reference_id}'")]
    Duplicate {
        /// Function of the conflicting insert.
        function_name: String,
        /// Reference of the conflicting insert.
        reference_id: String,
    },
    /// Task metadata could not be serialized.
    #[error("failed to serialize task metadata: {0}")]
    Metadata(#[from] serde_json::Error),
    /// The underlying database failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One row of the pipeline queue.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Task {
    /// Queue-assigned id.
    pub task_id: Uuid,
    /// Registered handler this task runs.
    pub function_name: String,
    /// Per-document key, the `<uuid>` part of the document id.
    pub reference_id: String,
    /// Serialized document record the handler binds.
    pub metadata: serde_json::Value,
    /// Earliest execution time.
    pub scheduled_at: DateTime<Utc>,
    /// Lease deadline of the current claim, if claimed.
    pub claimed_until: Option<DateTime<Utc>>,
    /// Claims taken so far.
    pub claim_count: i32,
    /// Completion time; a completed task is never claimed again.
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Whether this task completed before `now`.
    pub fn completed(&self) -> bool {
        self.completed_at.is_some_and(|at| at <= Utc::now())
    }

    /// Whether this task burned its whole claim budget without completing.
    pub fn exhausted(&self, max_claims: i32) -> bool {
        self.completed_at.is_none()
            && self.claim_count >= max_claims
            && self.claimed_until.is_none_or(|until| until < Utc::now())
    }
}

/// Handle to the pipeline queue.
#[derive(Clone)]
pub struct TaskQueue {
    pool: PgPool,
    claim_time: Duration,
    max_claim_count: i32,
}

impl TaskQueue {
    /// Build a queue over the shared pool with default lease and retries.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            claim_time: DEFAULT_CLAIM_TIME,
            max_claim_count: DEFAULT_MAX_CLAIM_COUNT,
        }
    }

    /// The per-task claim budget.
    pub fn max_claim_count(&self) -> i32 {
        self.max_claim_count
    }

    /// Insert a task. Fails with [`QueueError::Duplicate`] when an
    /// un-completed task with the same function and reference exists.
    pub async fn insert<M: Serialize>(
        &self,
        function_name: &str,
        reference_id: &str,
        metadata: &M,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Task, QueueError> {
        let metadata = serde_json::to_value(metadata)?;
        let result = sqlx::query_as::<_, Task>(
            r#"INSERT INTO "public"."pipeline_task"
               (function_name, reference_id, metadata, scheduled_at)
               VALUES ($1, $2, $3, $4)
               RETURNING *"#,
        )
        .bind(function_name)
        .bind(reference_id)
        .bind(&metadata)
        .bind(scheduled_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(task) => Ok(task),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
                Err(QueueError::Duplicate {
                    function_name: function_name.to_string(),
                    reference_id: reference_id.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// All tasks (completed or not) for a reference id.
    pub async fn find_by_reference_id(&self, reference_id: &str) -> Result<Vec<Task>, QueueError> {
        let tasks = sqlx::query_as::<_, Task>(
            r#"SELECT * FROM "public"."pipeline_task" WHERE reference_id = $1"#,
        )
        .bind(reference_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    /// Delete a task by id.
    pub async fn delete(&self, task_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(r#"DELETE FROM "public"."pipeline_task" WHERE task_id = $1"#)
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim the next due task, if any, taking a lease on it.
    ///
    /// Eligible tasks are un-completed, due, unclaimed (or lease-expired),
    /// and still within their claim budget. `SKIP LOCKED` keeps concurrent
    /// workers from fighting over the same row.
    pub async fn claim_next(&self) -> Result<Option<Task>, QueueError> {
        let task = sqlx::query_as::<_, Task>(
            r#"UPDATE "public"."pipeline_task"
               SET claimed_until = now() + make_interval(secs => $1),
                   claim_count = claim_count + 1
               WHERE task_id = (
                   SELECT task_id FROM "public"."pipeline_task"
                   WHERE completed_at IS NULL
                     AND scheduled_at <= now()
                     AND (claimed_until IS NULL OR claimed_until < now())
                     AND claim_count < $2
                   ORDER BY scheduled_at
                   FOR UPDATE SKIP LOCKED
                   LIMIT 1
               )
               RETURNING *"#,
        )
        .bind(self.claim_time.as_secs_f64())
        .bind(self.max_claim_count)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    /// Mark a claimed task as successfully completed.
    pub async fn complete(&self, task_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            r#"UPDATE "public"."pipeline_task"
               SET completed_at = now(), claimed_until = NULL
               WHERE task_id = $1"#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Release a failed claim back to the queue with a short backoff. Once
    /// the claim budget is exhausted the task stays put as a terminal
    /// failure, visible through document status.
    pub async fn release(&self, task_id: Uuid) -> Result<(), QueueError> {
        sqlx::query(
            r#"UPDATE "public"."pipeline_task"
               SET claimed_until = NULL,
                   scheduled_at = now() + make_interval(secs => $2)
               WHERE task_id = $1"#,
        )
        .bind(task_id)
        .bind(RELEASE_BACKOFF.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
