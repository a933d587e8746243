//! Request worker: paginates one category of the Shopify API per job,
//! pushing fixed-size batches to the DB sync queue and signalling category
//! completion for the fan-in counter.

use crate::db::{self, JobRow, Pool};
use crate::model::{Category, DbSyncJob, RequestJob};
use crate::queue::{self, QueueName};
use crate::shopify::{ShopifyApi, ShopifyClientFactory, ShopifyError};
use anyhow::Result;
use tracing::{info, instrument, warn};

#[instrument(skip_all)]
pub async fn process_next_job(pool: &Pool, factory: &dyn ShopifyClientFactory) -> Result<bool> {
    let Some(job) = db::next_due_job(pool, QueueName::SyncReq).await? else {
        return Ok(false);
    };
    let outcome = handle(pool, factory, &job).await;
    queue::settle_job(pool, QueueName::SyncReq, &job, outcome).await?;
    Ok(true)
}

async fn handle(pool: &Pool, factory: &dyn ShopifyClientFactory, job: &JobRow) -> Result<()> {
    let request: RequestJob = db::parse_job(job)?;
    let (RequestJob::SyncProducts {
        tenant_id,
        shop_name,
        access_token,
    }
    | RequestJob::SyncCustomers {
        tenant_id,
        shop_name,
        access_token,
    }
    | RequestJob::SyncOrders {
        tenant_id,
        shop_name,
        access_token,
    }) = &request;
    let category = request.category();

    let client = factory.client(shop_name, access_token);
    match paginate(pool, client.as_ref(), tenant_id, category).await {
        Ok(pages) => {
            info!(tenant_id, category = category.as_str(), pages, "category fetched");
        }
        // Category-level permission denial is vacuous completion, not failure.
        Err(ShopifyError::AccessDenied(msg)) => {
            warn!(
                tenant_id,
                category = category.as_str(),
                msg,
                "access denied; treating category as complete"
            );
        }
        Err(ShopifyError::Other(err)) => return Err(err),
    }

    db::enqueue_job(
        pool,
        QueueName::SyncDb,
        &DbSyncJob::CategorySynced {
            tenant_id: tenant_id.clone(),
            category,
        },
    )
    .await?;
    Ok(())
}

/// One fetched page, normalized across categories.
struct FetchedPage {
    batch: Option<DbSyncJob>,
    end_cursor: Option<String>,
    has_next_page: bool,
}

async fn fetch_page(
    client: &dyn ShopifyApi,
    tenant_id: &str,
    category: Category,
    cursor: Option<&str>,
) -> Result<FetchedPage, ShopifyError> {
    let tenant_id = tenant_id.to_string();
    Ok(match category {
        Category::Products => {
            let page = client.products_page(cursor).await?;
            FetchedPage {
                batch: (!page.items.is_empty()).then(|| DbSyncJob::ProcessProducts {
                    tenant_id,
                    items: page.items,
                }),
                end_cursor: page.end_cursor,
                has_next_page: page.has_next_page,
            }
        }
        Category::Customers => {
            let page = client.customers_page(cursor).await?;
            FetchedPage {
                batch: (!page.items.is_empty()).then(|| DbSyncJob::ProcessCustomers {
                    tenant_id,
                    items: page.items,
                }),
                end_cursor: page.end_cursor,
                has_next_page: page.has_next_page,
            }
        }
        Category::Orders => {
            let page = client.orders_page(cursor).await?;
            FetchedPage {
                batch: (!page.items.is_empty()).then(|| DbSyncJob::ProcessOrders {
                    tenant_id,
                    items: page.items,
                }),
                end_cursor: page.end_cursor,
                has_next_page: page.has_next_page,
            }
        }
    })
}

/// Walk the category's cursor chain strictly in order; each non-empty page
/// becomes one batch job. Returns the number of pages fetched.
async fn paginate(
    pool: &Pool,
    client: &dyn ShopifyApi,
    tenant_id: &str,
    category: Category,
) -> Result<u32, ShopifyError> {
    let mut cursor: Option<String> = None;
    let mut has_more = true;
    let mut pages = 0_u32;

    while has_more {
        let page = fetch_page(client, tenant_id, category, cursor.as_deref()).await?;
        pages += 1;
        if let Some(batch) = page.batch {
            db::enqueue_job(pool, QueueName::SyncDb, &batch)
                .await
                .map_err(ShopifyError::Other)?;
        }
        has_more = page.has_next_page;
        cursor = page.end_cursor;
    }
    Ok(pages)
}
