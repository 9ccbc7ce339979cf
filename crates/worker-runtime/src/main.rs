use std::sync::Arc;
use std::time::Duration;

use agent_store::{HeartbeatService, HEARTBEAT_TIMEOUT_SECONDS};
use anyhow::Result;
use position_service::PositionService;
use tokio::signal::unix::SignalKind;
use worker_runtime::{
    instance_id, Coordinator, EnvClientProvider, EventPublisher, MockTraderProvider,
    RuntimeConfig, WorkerManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("starting CoinPilot agent worker (instance {})", instance_id());

    let config = RuntimeConfig::from_env()?;
    tracing::info!("configuration loaded");
    tracing::info!("  error window: {}s / {} errors", config.worker_error_window_seconds, config.worker_max_consecutive_errors);
    tracing::info!(
        "  retry backoff: {:.0}s base, {:.0}s max, jitter={}",
        config.worker_retry_base_delay.as_secs_f64(),
        config.worker_retry_max_delay.as_secs_f64(),
        config.worker_retry_jitter
    );
    tracing::info!("  max positions per agent: {}", config.default_max_positions);

    // Database
    sqlx::any::install_default_drivers();
    let pool = sqlx::AnyPool::connect(&config.database_url).await?;
    agent_store::init_schema(&pool).await?;
    position_service::init_position_schema(&pool).await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    tracing::info!("startup check: database OK");

    // Redis (optional: absent means single-instance mode)
    let redis = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let manager = redis::aio::ConnectionManager::new(client).await?;
            tracing::info!("startup check: redis OK (distributed mode)");
            Some(manager)
        }
        None => {
            tracing::warn!("REDIS_URL not set - running in single-instance mode");
            None
        }
    };

    let coordinator = Coordinator::new(redis.clone(), instance_id());
    let events = EventPublisher::new(redis.clone());
    let ctx = worker_runtime::worker::WorkerContext {
        pool: pool.clone(),
        redis: redis.clone(),
        config: config.clone(),
        coordinator,
        events,
        trader_provider: Arc::new(MockTraderProvider::new(config.clone())),
        clients: Arc::new(EnvClientProvider::default()),
    };

    let manager = WorkerManager::new(ctx);
    manager.start().await?;

    // Stale-heartbeat detector: crashed workers surface as errored agents.
    let stale_pool = pool.clone();
    let stale_task = tokio::spawn(async move {
        let heartbeats = HeartbeatService::new(stale_pool);
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            match heartbeats.mark_stale_as_error(HEARTBEAT_TIMEOUT_SECONDS).await {
                Ok(0) => {}
                Ok(count) => tracing::warn!(count, "marked stale agents as errored"),
                Err(e) => tracing::warn!("stale detection failed: {e}"),
            }
        }
    });

    // Stale-pending GC: claims orphaned by crashes are deleted after five
    // minutes so their symbols free up. Exchange-side reconciliation is
    // driven by deployments that own live traders.
    let gc_pool = pool.clone();
    let gc_redis = redis.clone();
    let gc_task = tokio::spawn(async move {
        let positions = PositionService::new(gc_pool, gc_redis);
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            match positions.cleanup_stale_pending(300).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "cleaned up stale pending claims"),
                Err(e) => tracing::warn!("stale pending cleanup failed: {e}"),
            }
        }
    });

    tracing::info!("runtime is up; press Ctrl+C to stop");

    // Graceful shutdown on SIGINT / SIGTERM.
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM");
        }
    }

    tracing::info!("shutting down gracefully...");
    stale_task.abort();
    gc_task.abort();
    manager.stop().await;
    tracing::info!("worker runtime shut down");
    Ok(())
}
