//! Cycle entry point: ownership check, admission control and fan-out.

use crate::db::{self, Pool};
use anyhow::Result;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartSync {
    /// Cycle admitted; one request job per category is enqueued.
    Started,
    /// A cycle is already active for this tenant; no side effects.
    AlreadySyncing,
    /// Tenant missing or not owned by the requester.
    Unauthorized,
}

#[instrument(skip_all, fields(tenant_id))]
pub async fn start_sync(pool: &Pool, tenant_id: &str, requester_id: &str) -> Result<StartSync> {
    let Some(tenant) = db::get_tenant(pool, tenant_id).await? else {
        return Ok(StartSync::Unauthorized);
    };
    if tenant.user_id != requester_id {
        return Ok(StartSync::Unauthorized);
    }

    if !db::begin_cycle(pool, &tenant).await? {
        return Ok(StartSync::AlreadySyncing);
    }
    info!(tenant_id, shop = %tenant.shop_name, "sync cycle started");
    Ok(StartSync::Started)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueName;

    async fn setup_pool() -> Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn ownership_and_admission() {
        let pool = setup_pool().await;
        let owner = db::create_user(&pool, "owner@example.com", "key-owner")
            .await
            .unwrap();
        let other = db::create_user(&pool, "other@example.com", "key-other")
            .await
            .unwrap();
        let tenant_id = db::create_tenant(&pool, &owner, "acme.myshopify.com", "token")
            .await
            .unwrap();

        // Missing tenant and foreign requester are both unauthorized.
        assert_eq!(
            start_sync(&pool, "nope", &owner).await.unwrap(),
            StartSync::Unauthorized
        );
        assert_eq!(
            start_sync(&pool, &tenant_id, &other).await.unwrap(),
            StartSync::Unauthorized
        );
        assert_eq!(db::count_jobs(&pool, QueueName::SyncReq).await.unwrap(), 0);

        assert_eq!(
            start_sync(&pool, &tenant_id, &owner).await.unwrap(),
            StartSync::Started
        );
        assert_eq!(db::count_jobs(&pool, QueueName::SyncReq).await.unwrap(), 3);

        // Admission conflict: no new jobs.
        assert_eq!(
            start_sync(&pool, &tenant_id, &owner).await.unwrap(),
            StartSync::AlreadySyncing
        );
        assert_eq!(db::count_jobs(&pool, QueueName::SyncReq).await.unwrap(), 3);
    }
}
