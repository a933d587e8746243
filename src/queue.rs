//! Queue names and retry policies for the four pipeline stages.
//!
//! Jobs live in the `jobs` table and are claimed in due-date order by one
//! consumer task per queue. Success deletes the row; failure reschedules it
//! with exponential backoff until the queue's attempt budget is exhausted,
//! after which the job is moved to `dead_jobs` with its last error.

use crate::db;
use anyhow::Result;
use sqlx::SqlitePool;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    SyncReq,
    SyncDb,
    Analytics,
    Mail,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::SyncReq => "syncReqQueue",
            QueueName::SyncDb => "syncDbQueue",
            QueueName::Analytics => "analyticsQueue",
            QueueName::Mail => "mailQueue",
        }
    }

    /// Per-queue retry budgets. DB jobs get more attempts with shorter
    /// backoff (transient lock contention); analytics jobs get long backoff
    /// (the external process is resource-bound).
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            QueueName::SyncReq => RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 3,
            },
            QueueName::SyncDb => RetryPolicy {
                max_attempts: 5,
                base_delay_secs: 2,
            },
            QueueName::Analytics => RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 10,
            },
            QueueName::Mail => RetryPolicy {
                max_attempts: 3,
                base_delay_secs: 5,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay_secs: i64,
}

impl RetryPolicy {
    /// Exponential backoff: base * 2^attempt, capped at one hour.
    pub fn delay_secs(&self, attempt: i32) -> i64 {
        let secs = self.base_delay_secs * (1_i64 << attempt.clamp(0, 10));
        secs.min(3600)
    }
}

/// Settle a claimed job: delete on success, otherwise backoff or dead-letter
/// once the queue's attempt budget is spent.
pub async fn settle_job(
    pool: &SqlitePool,
    queue: QueueName,
    job: &db::JobRow,
    outcome: Result<()>,
) -> Result<()> {
    match outcome {
        Ok(()) => {
            db::delete_job(pool, job.id).await?;
            Ok(())
        }
        Err(err) => {
            let policy = queue.retry_policy();
            if job.attempt + 1 >= policy.max_attempts {
                error!(
                    ?err,
                    queue = queue.as_str(),
                    id = job.id,
                    kind = %job.kind,
                    attempts = job.attempt + 1,
                    "job exhausted retries; dead-lettering"
                );
                db::dead_letter_job(pool, queue, job, &format!("{err:#}")).await?;
            } else {
                let delay = policy.delay_secs(job.attempt);
                warn!(
                    ?err,
                    queue = queue.as_str(),
                    id = job.id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    delay_secs = delay,
                    "job failed; backoff"
                );
                db::backoff_job(pool, job.id, job.attempt, delay).await?;
            }
            Ok(())
        }
    }
}
