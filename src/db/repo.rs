use super::model::{CategoryOutcome, JobRow, MailTarget};
use crate::model::{
    AnalyticsJob, Category, CustomerRecord, OrderRecord, ProductRecord, RequestJob, Tenant,
    CATEGORY_COUNT,
};
use crate::queue::QueueName;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Users and tenants
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn create_user(pool: &Pool, email: &str, api_key: &str) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO users (id, email, api_key) VALUES (?, ?, ?)")
        .bind(&id)
        .bind(email)
        .bind(api_key)
        .execute(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn user_id_by_api_key(pool: &Pool, api_key: &str) -> Result<Option<String>> {
    let id = sqlx::query_scalar::<_, String>("SELECT id FROM users WHERE api_key = ?")
        .bind(api_key)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn create_tenant(
    pool: &Pool,
    user_id: &str,
    shop_name: &str,
    access_token: &str,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    sqlx::query("INSERT INTO tenants (id, user_id, shop_name, access_token) VALUES (?, ?, ?, ?)")
        .bind(&id)
        .bind(user_id)
        .bind(shop_name)
        .bind(access_token)
        .execute(pool)
        .await?;
    Ok(id)
}

fn tenant_from_row(row: sqlx::sqlite::SqliteRow) -> Tenant {
    Tenant {
        id: row.get("id"),
        user_id: row.get("user_id"),
        shop_name: row.get("shop_name"),
        access_token: row.get("access_token"),
        syncing: row.get::<i64, _>("syncing") != 0,
        last_sync_at: row.try_get("last_sync_at").ok(),
    }
}

#[instrument(skip_all)]
pub async fn get_tenant(pool: &Pool, tenant_id: &str) -> Result<Option<Tenant>> {
    let row = sqlx::query(
        "SELECT id, user_id, shop_name, access_token, syncing, last_sync_at FROM tenants WHERE id = ?",
    )
    .bind(tenant_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(tenant_from_row))
}

#[instrument(skip_all)]
pub async fn get_tenant_by_shop(pool: &Pool, shop_name: &str) -> Result<Option<Tenant>> {
    let row = sqlx::query(
        "SELECT id, user_id, shop_name, access_token, syncing, last_sync_at FROM tenants WHERE shop_name = ?",
    )
    .bind(shop_name)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(tenant_from_row))
}

// ---------------------------------------------------------------------------
// Cycle admission and fan-in counter
// ---------------------------------------------------------------------------

/// Start a sync cycle for a tenant: flip the `syncing` flag (admission
/// control), seed the completion counter, clear stale signal guards and
/// enqueue one request job per category — all in one transaction. Returns
/// false without side effects when a cycle is already active.
#[instrument(skip_all)]
pub async fn begin_cycle(pool: &Pool, tenant: &Tenant) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let admitted = sqlx::query("UPDATE tenants SET syncing = 1 WHERE id = ? AND syncing = 0")
        .bind(&tenant.id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    if admitted == 0 {
        return Ok(false);
    }

    sqlx::query("INSERT OR REPLACE INTO sync_counters (tenant_id, remaining) VALUES (?, ?)")
        .bind(&tenant.id)
        .bind(CATEGORY_COUNT)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sync_signals WHERE tenant_id = ?")
        .bind(&tenant.id)
        .execute(&mut *tx)
        .await?;

    for category in Category::ALL {
        let job = RequestJob::new(
            category,
            &tenant.id,
            &tenant.shop_name,
            &tenant.access_token,
        );
        enqueue_job_tx(&mut tx, QueueName::SyncReq, &job).await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Record one category-completion signal. The signal guard insert and the
/// counter decrement happen in the same transaction, so a redelivered signal
/// can never decrement twice and the zero-crossing trigger fires exactly
/// once per cycle.
#[instrument(skip_all)]
pub async fn record_category_done(
    pool: &Pool,
    tenant_id: &str,
    category: Category,
) -> Result<CategoryOutcome> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO sync_signals (tenant_id, category) VALUES (?, ?) ON CONFLICT DO NOTHING",
    )
    .bind(tenant_id)
    .bind(category.as_str())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Ok(CategoryOutcome::Duplicate);
    }

    let remaining: Option<i64> = sqlx::query_scalar(
        "UPDATE sync_counters SET remaining = remaining - 1 WHERE tenant_id = ? RETURNING remaining",
    )
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(remaining) = remaining else {
        // Counter already gone: the cycle closed before this redelivery.
        warn!(tenant_id, category = category.as_str(), "signal for closed cycle ignored");
        return Ok(CategoryOutcome::Duplicate);
    };

    if remaining > 0 {
        tx.commit().await?;
        return Ok(CategoryOutcome::Remaining(remaining));
    }

    // Last category in: fan out to analytics and clear the cycle state.
    enqueue_job_tx(
        &mut tx,
        QueueName::Analytics,
        &AnalyticsJob::GenerateInsights {
            tenant_id: tenant_id.to_string(),
        },
    )
    .await?;
    sqlx::query("UPDATE tenants SET syncing = 0, last_sync_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sync_counters WHERE tenant_id = ?")
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM sync_signals WHERE tenant_id = ?")
        .bind(tenant_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(CategoryOutcome::CycleComplete)
}

pub async fn counter_remaining(pool: &Pool, tenant_id: &str) -> Result<Option<i64>> {
    let remaining =
        sqlx::query_scalar::<_, i64>("SELECT remaining FROM sync_counters WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(pool)
            .await?;
    Ok(remaining)
}

// ---------------------------------------------------------------------------
// Idempotent batch upserts
// ---------------------------------------------------------------------------

/// Upsert a whole product batch in one transaction; either every item
/// commits or the job is retried from scratch.
#[instrument(skip_all, fields(count = items.len()))]
pub async fn upsert_products(pool: &Pool, tenant_id: &str, items: &[ProductRecord]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for product in items {
        sqlx::query(
            "INSERT INTO products (id, shopify_product_id, tenant_id, title, body_html, vendor, product_type, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(shopify_product_id) DO UPDATE SET \
               title = excluded.title, \
               body_html = excluded.body_html, \
               vendor = excluded.vendor, \
               product_type = excluded.product_type",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(product.id)
        .bind(tenant_id)
        .bind(&product.title)
        .bind(&product.body_html)
        .bind(&product.vendor)
        .bind(&product.product_type)
        .bind(product.created_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn upsert_customer_tx(
    tx: &mut Transaction<'_, Sqlite>,
    tenant_id: &str,
    customer: &CustomerRecord,
) -> Result<String> {
    let id: String = sqlx::query_scalar(
        "INSERT INTO customers (id, shopify_customer_id, tenant_id, first_name, last_name, email, total_spent, orders_count) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(shopify_customer_id) DO UPDATE SET \
           first_name = excluded.first_name, \
           last_name = excluded.last_name, \
           email = excluded.email, \
           total_spent = excluded.total_spent, \
           orders_count = excluded.orders_count \
         RETURNING id",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(customer.id)
    .bind(tenant_id)
    .bind(&customer.first_name)
    .bind(&customer.last_name)
    .bind(&customer.email)
    .bind(customer.total_spent)
    .bind(customer.orders_count)
    .fetch_one(&mut **tx)
    .await
    .context("failed to upsert customer")?;
    Ok(id)
}

#[instrument(skip_all, fields(count = items.len()))]
pub async fn upsert_customers(
    pool: &Pool,
    tenant_id: &str,
    items: &[CustomerRecord],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    for customer in items {
        upsert_customer_tx(&mut tx, tenant_id, customer).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Upsert an order batch; embedded customers are upserted first so the order
/// row can reference the local customer id.
#[instrument(skip_all, fields(count = items.len()))]
pub async fn upsert_orders(pool: &Pool, tenant_id: &str, items: &[OrderRecord]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for order in items {
        let customer_id = match &order.customer {
            Some(customer) => Some(upsert_customer_tx(&mut tx, tenant_id, customer).await?),
            None => None,
        };
        sqlx::query(
            "INSERT INTO orders (id, shopify_order_id, tenant_id, customer_id, order_number, total_price, currency, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(shopify_order_id) DO UPDATE SET \
               total_price = excluded.total_price, \
               currency = excluded.currency, \
               customer_id = COALESCE(excluded.customer_id, orders.customer_id)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(order.id)
        .bind(tenant_id)
        .bind(customer_id)
        .bind(order.order_number)
        .bind(order.total_price)
        .bind(&order.currency)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn customers_for_mail(pool: &Pool, tenant_id: &str) -> Result<Vec<MailTarget>> {
    let rows = sqlx::query("SELECT email, segment FROM customers WHERE tenant_id = ?")
        .bind(tenant_id)
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|row| MailTarget {
            email: row.try_get("email").ok(),
            segment: row.try_get("segment").ok(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Queue storage
// ---------------------------------------------------------------------------

fn job_kind(value: &serde_json::Value) -> String {
    value
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or("unknown")
        .to_string()
}

#[instrument(skip_all)]
pub async fn enqueue_job<T: Serialize>(pool: &Pool, queue: QueueName, job: &T) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_job_tx(&mut tx, queue, job).await?;
    tx.commit().await?;
    Ok(id)
}

pub async fn enqueue_job_tx<T: Serialize>(
    tx: &mut Transaction<'_, Sqlite>,
    queue: QueueName,
    job: &T,
) -> Result<i64> {
    let value = serde_json::to_value(job).context("failed to serialize job payload")?;
    let kind = job_kind(&value);
    let rec = sqlx::query(
        "INSERT INTO jobs (queue, kind, payload, attempt) VALUES (?, ?, ?, 0) RETURNING id",
    )
    .bind(queue.as_str())
    .bind(kind)
    .bind(value.to_string())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

#[instrument(skip_all)]
pub async fn next_due_job(pool: &Pool, queue: QueueName) -> Result<Option<JobRow>> {
    let row = sqlx::query(
        "SELECT id, kind, payload, attempt FROM jobs \
         WHERE queue = ? AND datetime(due_at) <= CURRENT_TIMESTAMP \
         ORDER BY datetime(due_at) ASC, id ASC LIMIT 1",
    )
    .bind(queue.as_str())
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| JobRow {
        id: row.get("id"),
        kind: row.get("kind"),
        payload: row.get("payload"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn backoff_job(pool: &Pool, id: i64, attempt: i32, delay_secs: i64) -> Result<()> {
    sqlx::query(
        "UPDATE jobs SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(delay_secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Move an exhausted job to `dead_jobs`, preserving its payload and last error.
#[instrument(skip_all)]
pub async fn dead_letter_job(
    pool: &Pool,
    queue: QueueName,
    job: &JobRow,
    error: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO dead_jobs (queue, kind, payload, attempts, error) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(queue.as_str())
    .bind(&job.kind)
    .bind(&job.payload)
    .bind(job.attempt + 1)
    .bind(error)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(job.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn count_jobs(pool: &Pool, queue: QueueName) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE queue = ?")
        .bind(queue.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn count_dead_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Used by tests and operational tooling to make backed-off jobs due now.
pub async fn make_jobs_due_now(pool: &Pool) -> Result<()> {
    sqlx::query("UPDATE jobs SET due_at = datetime('now', '-1 seconds')")
        .execute(pool)
        .await?;
    Ok(())
}

pub fn parse_job<T: serde::de::DeserializeOwned>(job: &JobRow) -> Result<T> {
    serde_json::from_str(&job.payload)
        .map_err(|err| anyhow!("undecodable {} job {}: {}", job.kind, job.id, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_tenant(pool: &Pool) -> Tenant {
        let user_id = create_user(pool, "owner@example.com", "key-1").await.unwrap();
        let tenant_id = create_tenant(pool, &user_id, "acme.myshopify.com", "token")
            .await
            .unwrap();
        get_tenant(pool, &tenant_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn begin_cycle_enqueues_one_job_per_category() {
        let pool = setup_pool().await;
        let tenant = seed_tenant(&pool).await;

        assert!(begin_cycle(&pool, &tenant).await.unwrap());
        assert_eq!(count_jobs(&pool, QueueName::SyncReq).await.unwrap(), 3);
        assert_eq!(counter_remaining(&pool, &tenant.id).await.unwrap(), Some(3));

        // Second admission must be rejected with no new jobs.
        let tenant = get_tenant(&pool, &tenant.id).await.unwrap().unwrap();
        assert!(tenant.syncing);
        assert!(!begin_cycle(&pool, &tenant).await.unwrap());
        assert_eq!(count_jobs(&pool, QueueName::SyncReq).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn fan_in_triggers_exactly_once() {
        let pool = setup_pool().await;
        let tenant = seed_tenant(&pool).await;
        assert!(begin_cycle(&pool, &tenant).await.unwrap());

        let outcome = record_category_done(&pool, &tenant.id, Category::Orders)
            .await
            .unwrap();
        assert_eq!(outcome, CategoryOutcome::Remaining(2));

        // Redelivered signal for the same category must not decrement again.
        let outcome = record_category_done(&pool, &tenant.id, Category::Orders)
            .await
            .unwrap();
        assert_eq!(outcome, CategoryOutcome::Duplicate);
        assert_eq!(counter_remaining(&pool, &tenant.id).await.unwrap(), Some(2));

        let outcome = record_category_done(&pool, &tenant.id, Category::Products)
            .await
            .unwrap();
        assert_eq!(outcome, CategoryOutcome::Remaining(1));

        let outcome = record_category_done(&pool, &tenant.id, Category::Customers)
            .await
            .unwrap();
        assert_eq!(outcome, CategoryOutcome::CycleComplete);

        // Counter key deleted, syncing cleared, lastSyncAt set, one analytics job.
        assert_eq!(counter_remaining(&pool, &tenant.id).await.unwrap(), None);
        let tenant = get_tenant(&pool, &tenant.id).await.unwrap().unwrap();
        assert!(!tenant.syncing);
        assert!(tenant.last_sync_at.is_some());
        assert_eq!(count_jobs(&pool, QueueName::Analytics).await.unwrap(), 1);

        // A straggler signal after the cycle closed is ignored.
        let outcome = record_category_done(&pool, &tenant.id, Category::Customers)
            .await
            .unwrap();
        assert_eq!(outcome, CategoryOutcome::Duplicate);
        assert_eq!(count_jobs(&pool, QueueName::Analytics).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upserts_are_idempotent_and_last_write_wins() {
        let pool = setup_pool().await;
        let tenant = seed_tenant(&pool).await;

        let first = ProductRecord {
            id: 42,
            title: "Widget".into(),
            body_html: None,
            vendor: Some("Acme".into()),
            product_type: None,
            created_at: None,
        };
        upsert_products(&pool, &tenant.id, &[first.clone()]).await.unwrap();

        let mut second = first;
        second.title = "Widget v2".into();
        upsert_products(&pool, &tenant.id, &[second]).await.unwrap();

        let (count, title): (i64, String) = {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n, MAX(title) AS title FROM products WHERE shopify_product_id = 42",
            )
            .fetch_one(&pool)
            .await
            .unwrap();
            (row.get("n"), row.get("title"))
        };
        assert_eq!(count, 1);
        assert_eq!(title, "Widget v2");
    }

    #[tokio::test]
    async fn order_upsert_links_embedded_customer() {
        let pool = setup_pool().await;
        let tenant = seed_tenant(&pool).await;

        let order = OrderRecord {
            id: 900,
            order_number: 1001,
            total_price: 25.5,
            currency: "USD".into(),
            created_at: None,
            customer: Some(CustomerRecord {
                id: 7,
                first_name: Some("Ada".into()),
                last_name: None,
                email: Some("ada@example.com".into()),
                total_spent: 25.5,
                orders_count: 1,
            }),
        };
        upsert_orders(&pool, &tenant.id, &[order.clone()]).await.unwrap();
        // Replaying the same batch must not duplicate either row.
        upsert_orders(&pool, &tenant.id, &[order]).await.unwrap();

        let orders: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders")
            .fetch_one(&pool)
            .await
            .unwrap();
        let customers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(orders, 1);
        assert_eq!(customers, 1);

        let linked: Option<String> =
            sqlx::query_scalar("SELECT customer_id FROM orders WHERE shopify_order_id = 900")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(linked.is_some());
    }

    #[tokio::test]
    async fn dead_letter_preserves_payload_and_error() {
        let pool = setup_pool().await;
        let id = enqueue_job(
            &pool,
            QueueName::SyncReq,
            &serde_json::json!({ "kind": "syncOrders", "payload": { "tenantId": "t1" } }),
        )
        .await
        .unwrap();

        let job = next_due_job(&pool, QueueName::SyncReq).await.unwrap().unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.kind, "syncOrders");

        dead_letter_job(&pool, QueueName::SyncReq, &job, "boom").await.unwrap();
        assert_eq!(count_jobs(&pool, QueueName::SyncReq).await.unwrap(), 0);
        assert_eq!(count_dead_jobs(&pool).await.unwrap(), 1);

        let error: String = sqlx::query_scalar("SELECT error FROM dead_jobs LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(error, "boom");
    }
}
