//! Keepwarden Background Worker
//!
//! Handles scheduled jobs including:
//! - Membership reconciliation (daily at `RECONCILIATION_HOUR` in `RECONCILIATION_TIMEZONE`)
//! - Grace period expiry, moving lapsed members to the Debtor role (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use keepwarden_access::{
    DailySchedule, GraceExpiryJob, HeartbeatJob, ReconciliationJob, Schedule, Scheduler, Services,
    SystemClock,
};
use keepwarden_shared::{create_pool, run_migrations, Config};
use tracing::info;

const GRACE_EXPIRY_INTERVAL: Duration = Duration::from_secs(60 * 60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keepwarden=debug")),
        )
        .init();

    info!("Starting Keepwarden Worker v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;

    let services = Services::from_config(&config, pool);
    let clock = Arc::new(SystemClock);
    let scheduler = Scheduler::new(clock.clone());

    // Job 1: Daily reconciliation
    let daily = DailySchedule::new(config.reconciliation_hour, config.reconciliation_timezone)?;
    info!(
        cron = %daily.cron_expression(),
        timezone = %config.reconciliation_timezone,
        "Reconciliation schedule configured"
    );
    scheduler.register(
        Arc::new(ReconciliationJob::new(services.reconciler.clone())),
        Schedule::Daily(daily),
    )?;

    // Job 2: Grace period expiry (hourly)
    scheduler.register(
        Arc::new(GraceExpiryJob::new(
            services.billing.clone(),
            services.queue.clone(),
            clock,
        )),
        Schedule::Every(GRACE_EXPIRY_INTERVAL),
    )?;

    // Job 3: Heartbeat
    scheduler.register(Arc::new(HeartbeatJob), Schedule::Every(HEARTBEAT_INTERVAL))?;

    for (job, next_run) in scheduler.next_runs() {
        info!(job = %job, next_run = %next_run, "Next run");
    }

    scheduler.start().await;
    info!("Worker started, waiting for shutdown signal");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scheduler.stop().await;
    services.queue.shutdown().await;

    info!("Worker stopped");
    Ok(())
}
