//! Analytics worker: runs the external segmentation process for a tenant and
//! fans out to the mail queue on success.

use crate::db::{self, Pool};
use crate::model::{AnalyticsJob, MailJob};
use crate::queue::{self, QueueName};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

#[async_trait]
pub trait Segmenter: Send + Sync {
    /// Blocks (from the worker's perspective) until the segmentation process
    /// exits; Ok means exit code zero.
    async fn run(&self, tenant_id: &str) -> Result<()>;
}

/// Invokes the Python segmentation script with the tenant id as argument.
#[derive(Debug, Clone)]
pub struct PythonSegmenter {
    pub python_bin: String,
    pub script: String,
}

#[async_trait]
impl Segmenter for PythonSegmenter {
    async fn run(&self, tenant_id: &str) -> Result<()> {
        let status = Command::new(&self.python_bin)
            .arg(&self.script)
            .arg(tenant_id)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to spawn {} {}", self.python_bin, self.script))?;
        if !status.success() {
            return Err(anyhow!(
                "segmentation script exited with status {} for tenant {}",
                status,
                tenant_id
            ));
        }
        Ok(())
    }
}

#[instrument(skip_all)]
pub async fn process_next_job(pool: &Pool, segmenter: &dyn Segmenter) -> Result<bool> {
    let Some(job) = db::next_due_job(pool, QueueName::Analytics).await? else {
        return Ok(false);
    };
    let outcome = handle(pool, segmenter, &job).await;
    queue::settle_job(pool, QueueName::Analytics, &job, outcome).await?;
    Ok(true)
}

async fn handle(pool: &Pool, segmenter: &dyn Segmenter, job: &db::JobRow) -> Result<()> {
    let AnalyticsJob::GenerateInsights { tenant_id } = db::parse_job(job)?;
    info!(tenant_id, "running segmentation");
    segmenter.run(&tenant_id).await?;

    db::enqueue_job(
        pool,
        QueueName::Mail,
        &MailJob::SendAnalysisEmail {
            tenant_id: tenant_id.clone(),
        },
    )
    .await?;
    info!(tenant_id, "segmentation done; mail job enqueued");
    Ok(())
}
