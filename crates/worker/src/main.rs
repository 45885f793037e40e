// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! PricEye Billing Worker
//!
//! Handles scheduled jobs:
//! - Full Stripe subscription reconciliation (every 6 hours by default)
//! - Billing invariant checks (daily at 4:00 AM UTC by default)
//! - Heartbeat (every 5 minutes)

mod config;
mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use priceye_billing::{BillingService, InvariantChecker};
use priceye_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting PricEye Billing Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;

    // Without Stripe there is nothing to reconcile against
    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    let checker = Arc::new(InvariantChecker::new(pool));

    if config.reconcile_on_start {
        reconcile::run_reconciliation(&billing.synchronizer).await;
    }

    let scheduler = JobScheduler::new().await?;

    // Job 1: Full reconciliation
    let reconcile_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.reconcile_cron.as_str(), move |_uuid, _l| {
            let billing = reconcile_billing.clone();
            Box::pin(async move {
                reconcile::run_reconciliation(&billing.synchronizer).await;
            })
        })?)
        .await?;
    info!(cron = %config.reconcile_cron, "Scheduled: Subscription reconciliation");

    // Job 2: Invariant checks
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async(config.invariant_cron.as_str(), move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                reconcile::run_invariant_checks(&checker).await;
            })
        })?)
        .await?;
    info!(cron = %config.invariant_cron, "Scheduled: Billing invariant checks");

    // Job 3: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("PricEye Billing Worker started with 3 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
