//! Queue consumers, one module per pipeline stage.

pub mod analytics;
pub mod db_sync;
pub mod mail;
pub mod request;

use std::future::Future;
use std::time::Duration;
use tracing::error;

/// Drive one queue's `process_next_job` forever: busy while jobs are due,
/// sleeping the poll interval when the queue is drained.
pub async fn run_poll_loop<F, Fut>(name: &'static str, poll_interval: Duration, mut step: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    loop {
        match step().await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_interval).await;
                }
            }
            Err(err) => {
                error!(?err, worker = name, "worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
