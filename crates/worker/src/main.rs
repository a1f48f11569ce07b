use std::sync::Arc;
use std::time::Duration;

use skyflow::artifact::ArtifactStore;
use skyflow::config::Config;
use skyflow::context::RuntimeContext;
use skyflow::coordinator::Coordinator;
use skyflow::ratelimit::RateLimitConfig;
use skyflow::retry::RetryConfig;
use skyflow::store::StateStore;
use skyflow::worker::WorkerPool;
use skyflow::{api, db, MemStateStore, PgStateStore, SystemClock};
use tokio_util::sync::CancellationToken;

mod handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env()?;
    tracing::info!(
        worker_id = %cfg.worker_id,
        slots = cfg.slots,
        lease_seconds = cfg.lease_seconds,
        store_root = %cfg.store_root,
        admin = %cfg.admin_addr.clone().unwrap_or_else(|| "disabled".to_string()),
        "skyflow worker starting"
    );

    let clock = Arc::new(SystemClock);
    let store: Arc<dyn StateStore> = match &cfg.database_url {
        Some(url) => {
            let pool = db::make_pool(url).await?;
            if cfg.migrate_on_startup {
                db::run_migrations(&pool).await?;
            }
            Arc::new(PgStateStore::new(pool))
        }
        None => {
            tracing::warn!("no database url configured; using the in-process store");
            Arc::new(MemStateStore::new(clock.clone()))
        }
    };

    let ctx = RuntimeContext::new(
        store,
        ArtifactStore::new(cfg.store_root.clone()),
        handlers::build_registry(),
        clock,
        RateLimitConfig::atproto_default(),
        RetryConfig::default(),
    );
    ctx.limiter.ensure_buckets().await?;

    let shutdown = CancellationToken::new();

    // ---- Admin API task ----
    let api_addr = cfg.admin_addr.clone();
    let api_ctx = ctx.clone();
    let api_handle = tokio::spawn(async move {
        if let Some(addr) = api_addr {
            let app = api::router(api::ApiState { ctx: api_ctx });
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            tracing::info!("admin api listening on http://{addr}");
            axum::serve(listener, app).await?;
        } else {
            std::future::pending::<()>().await;
        }
        Ok::<(), anyhow::Error>(())
    });

    // ---- Lease reaper task ----
    let reaper_ctx = ctx.clone();
    let reap_interval = Duration::from_millis(cfg.reap_interval_ms.max(100));
    let reaper_shutdown = shutdown.clone();
    let reaper_handle = tokio::spawn(async move {
        loop {
            if reaper_shutdown.is_cancelled() {
                return Ok::<(), anyhow::Error>(());
            }
            match reaper_ctx.store.expire_leases().await {
                Ok(n) if n > 0 => {
                    skyflow::metrics::RuntimeMetrics::add(
                        &reaper_ctx.metrics.leases_expired,
                        n as i64,
                    );
                    tracing::info!(expired = n, "reaped expired leases");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("lease reap failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(reap_interval) => {}
                _ = reaper_shutdown.cancelled() => return Ok(()),
            }
        }
    });

    // ---- Coordinator task ----
    let coordinator = Coordinator::new(
        ctx.clone(),
        format!("{}-coordinator", cfg.worker_id),
        cfg.tick_interval_ms,
        shutdown.clone(),
    );
    let coordinator_handle = tokio::spawn(async move { coordinator.run().await });

    // ---- Worker pool task ----
    let pool = WorkerPool::new(
        ctx.clone(),
        cfg.worker_id.clone(),
        cfg.lease_seconds,
        cfg.dequeue_batch_size,
        shutdown.clone(),
    );
    let slots = cfg.slots;
    let pool_handle = tokio::spawn(async move { pool.run(slots).await });

    // ---- Shutdown on ctrl-c ----
    let signal_shutdown = shutdown.clone();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutting down");
            signal_shutdown.cancel();
            if let Err(e) = signal_ctx.limiter.surrender_subleases().await {
                tracing::warn!("sublease surrender failed: {e}");
            }
        }
    });

    tokio::select! {
        res = api_handle => res??,
        res = reaper_handle => res??,
        res = coordinator_handle => res??,
        res = pool_handle => res??,
    }

    Ok(())
}
