use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use shopsync::db;
use shopsync::http::{self, AppState};
use shopsync::mailer::SendgridMailer;
use shopsync::shopify::HttpShopifyFactory;
use shopsync::workers::{self, analytics::PythonSegmenter, run_poll_loop};
use shopsync::{config, queue::QueueName};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/shopsync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    // One consumer task per queue, so each queue's jobs are handled by at
    // most one worker at a time.
    let factory = HttpShopifyFactory {
        api_version: cfg.shopify.api_version.clone(),
        page_size: cfg.app.page_size,
    };
    let req_pool = pool.clone();
    tokio::spawn(run_poll_loop(
        QueueName::SyncReq.as_str(),
        poll_sleep,
        move || {
            let pool = req_pool.clone();
            let factory = factory.clone();
            async move { workers::request::process_next_job(&pool, &factory).await }
        },
    ));

    let db_pool = pool.clone();
    tokio::spawn(run_poll_loop(
        QueueName::SyncDb.as_str(),
        poll_sleep,
        move || {
            let pool = db_pool.clone();
            async move { workers::db_sync::process_next_job(&pool).await }
        },
    ));

    let segmenter = PythonSegmenter {
        python_bin: cfg.analytics.python_bin.clone(),
        script: cfg.analytics.script.clone(),
    };
    let analytics_pool = pool.clone();
    tokio::spawn(run_poll_loop(
        QueueName::Analytics.as_str(),
        poll_sleep,
        move || {
            let pool = analytics_pool.clone();
            let segmenter = segmenter.clone();
            async move { workers::analytics::process_next_job(&pool, &segmenter).await }
        },
    ));

    let mailer = SendgridMailer::new(&cfg.sendgrid.api_key, &cfg.sendgrid.from_email);
    let mail_pool = pool.clone();
    tokio::spawn(run_poll_loop(
        QueueName::Mail.as_str(),
        poll_sleep,
        move || {
            let pool = mail_pool.clone();
            let mailer = mailer.clone();
            async move { workers::mail::process_next_job(&pool, &mailer).await }
        },
    ));

    let state = AppState {
        pool,
        webhook_secret: cfg.shopify.webhook_secret.clone(),
    };
    let app = http::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr).await?;
    info!(addr = %cfg.app.bind_addr, "listening");
    axum::serve(listener, app).await?;

    Ok(())
}
