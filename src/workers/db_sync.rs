//! DB sync worker: transactional batch upserts plus the fan-in trigger for
//! category-completion signals.

use crate::db::{self, CategoryOutcome, JobRow, Pool};
use crate::model::DbSyncJob;
use crate::queue::{self, QueueName};
use anyhow::Result;
use tracing::{info, instrument, warn};

#[instrument(skip_all)]
pub async fn process_next_job(pool: &Pool) -> Result<bool> {
    let Some(job) = db::next_due_job(pool, QueueName::SyncDb).await? else {
        return Ok(false);
    };
    let outcome = handle(pool, &job).await;
    queue::settle_job(pool, QueueName::SyncDb, &job, outcome).await?;
    Ok(true)
}

async fn handle(pool: &Pool, job: &JobRow) -> Result<()> {
    match db::parse_job::<DbSyncJob>(job)? {
        DbSyncJob::ProcessProducts { tenant_id, items } => {
            db::upsert_products(pool, &tenant_id, &items).await?;
            info!(tenant_id, count = items.len(), "product batch upserted");
        }
        DbSyncJob::ProcessCustomers { tenant_id, items } => {
            db::upsert_customers(pool, &tenant_id, &items).await?;
            info!(tenant_id, count = items.len(), "customer batch upserted");
        }
        DbSyncJob::ProcessOrders { tenant_id, items } => {
            db::upsert_orders(pool, &tenant_id, &items).await?;
            info!(tenant_id, count = items.len(), "order batch upserted");
        }
        DbSyncJob::CategorySynced {
            tenant_id,
            category,
        } => match db::record_category_done(pool, &tenant_id, category).await? {
            CategoryOutcome::Remaining(remaining) => {
                info!(
                    tenant_id,
                    category = category.as_str(),
                    remaining,
                    "category complete"
                );
            }
            CategoryOutcome::CycleComplete => {
                info!(tenant_id, category = category.as_str(), "cycle complete; analytics enqueued");
            }
            CategoryOutcome::Duplicate => {
                warn!(
                    tenant_id,
                    category = category.as_str(),
                    "duplicate completion signal ignored"
                );
            }
        },
    }
    Ok(())
}
