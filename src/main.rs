use anyhow::{Context, Result};
use clap::Parser;
use gh_syncd::config;
use gh_syncd::db;
use gh_syncd::github::GithubClient;
use gh_syncd::jobs;
use gh_syncd::model::SyncJobKind;
use gh_syncd::processor::ProcessorGate;
use gh_syncd::server::{self, AppState};
use gh_syncd::sync::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run one full account sync for the configured user and exit
    #[arg(long)]
    sync_once: bool,
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
        .unwrap_or_else(|_| format!("sqlite://{}/syncd.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let user = db::get_or_create_user(&pool, &cfg.github.user, Some(&cfg.github.token)).await?;
    let client = GithubClient::from_api_base(
        cfg.github.token.clone(),
        &cfg.github.api_base,
        cfg.sync.rate_limit_max_retries,
        Duration::from_millis(cfg.sync.rate_limit_base_delay_ms),
    )
    .context("invalid github.api_base")?;
    let engine = Arc::new(SyncEngine::new(
        pool.clone(),
        Arc::new(client),
        cfg.sync.clone(),
        cfg.github.webhook_url.clone(),
    ));

    if args.sync_once {
        let progress = engine.full_account_sync(&user, true).await?;
        info!(?progress, "one-shot sync finished");
        return Ok(());
    }

    let state = AppState {
        pool: pool.clone(),
        gate: Arc::new(ProcessorGate::new()),
        queue_cfg: cfg.queue.clone(),
    };

    // Periodic safety-net pass so retries parked on next_retry_at run even
    // when no new delivery arrives to trigger one.
    let poll_state = state.clone();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    tokio::spawn(async move {
        loop {
            server::trigger_processing(&poll_state);
            tokio::time::sleep(poll_sleep).await;
        }
    });

    // Sync job worker (single-threaded)
    db::enqueue_sync_job(
        &pool,
        &user.id,
        SyncJobKind::FullSync,
        None,
        cfg.queue.max_attempts,
    )
    .await?;
    let job_pool = pool.clone();
    let job_engine = Arc::clone(&engine);
    let job_cfg = cfg.queue.clone();
    let job_sleep = poll_sleep;
    tokio::spawn(async move {
        loop {
            match jobs::process_next_job(&job_pool, &job_engine, &job_cfg).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(job_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "sync job worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&cfg.app.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", cfg.app.bind_addr))?;
    info!(addr = %cfg.app.bind_addr, "listening for webhooks");
    axum::serve(listener, server::router(state)).await?;

    Ok(())
}
