//! Mail worker: sends segment-targeted notifications for a tenant's
//! customers after a completed analytics pass.

use crate::db::{self, Pool};
use crate::mailer::{retention_email, reward_email, Mailer};
use crate::model::{campaign_for_segment, Campaign, MailJob};
use crate::queue::{self, QueueName};
use anyhow::Result;
use tracing::{info, instrument, warn};

#[instrument(skip_all)]
pub async fn process_next_job(pool: &Pool, mailer: &dyn Mailer) -> Result<bool> {
    let Some(job) = db::next_due_job(pool, QueueName::Mail).await? else {
        return Ok(false);
    };
    let outcome = handle(pool, mailer, &job).await;
    queue::settle_job(pool, QueueName::Mail, &job, outcome).await?;
    Ok(true)
}

async fn handle(pool: &Pool, mailer: &dyn Mailer, job: &db::JobRow) -> Result<()> {
    let MailJob::SendAnalysisEmail { tenant_id } = db::parse_job(job)?;

    let Some(tenant) = db::get_tenant(pool, &tenant_id).await? else {
        warn!(tenant_id, "tenant gone; dropping mail job");
        return Ok(());
    };

    let targets = db::customers_for_mail(pool, &tenant_id).await?;
    let mut sent = 0_u32;
    for target in &targets {
        let Some(email) = target.email.as_deref().filter(|e| !e.is_empty()) else {
            continue;
        };
        let Some(segment) = target.segment.as_deref() else {
            continue;
        };
        let (subject, html) = match campaign_for_segment(segment) {
            Some(Campaign::Reward) => reward_email(&tenant.shop_name),
            Some(Campaign::Retention) => retention_email(&tenant.shop_name),
            None => continue,
        };
        // One failed send must not abort the rest of the batch.
        match mailer.send(email, &subject, &html).await {
            Ok(()) => sent += 1,
            Err(err) => warn!(?err, email, segment, "failed to send notification"),
        }
    }

    info!(
        tenant_id,
        customers = targets.len(),
        sent,
        "segment notifications processed"
    );
    Ok(())
}
