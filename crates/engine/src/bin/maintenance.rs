//! Clubpass Maintenance Tasks
//!
//! On-demand operational tasks, run by an operator (there is no background
//! scheduler; expiration and garbage collection are lazy by design):
//! - `check-invariants` - run all consistency checks and report violations
//! - `sweep-vouchers`   - persist 'expired' on overdue pending/verified vouchers
//! - `purge-initiated`  - delete initiated subscriptions past their TTL
//! - `parked`           - list payment events parked for manual resolution

use std::time::Duration;

use clubpass_engine::EngineService;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    let task = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "check-invariants".to_string());

    info!(task = %task, "Starting Clubpass maintenance");

    let pool = create_db_pool().await?;
    let engine = EngineService::from_env(pool).map_err(|e| anyhow::anyhow!(e.to_string()))?;

    match task.as_str() {
        "check-invariants" => {
            let summary = engine
                .invariants
                .run_all_checks()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            info!(
                checks_run = summary.checks_run,
                checks_passed = summary.checks_passed,
                checks_failed = summary.checks_failed,
                healthy = summary.healthy,
                "Invariant check complete"
            );

            for violation in &summary.violations {
                error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    description = %violation.description,
                    context = %violation.context,
                    "Invariant violation"
                );
            }

            if !summary.healthy {
                anyhow::bail!("{} invariant check(s) failed", summary.checks_failed);
            }
        }
        "sweep-vouchers" => {
            let swept = engine
                .vouchers
                .sweep_overdue()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            info!(swept = swept, "Voucher sweep complete");
        }
        "purge-initiated" => {
            let purged = engine
                .reconciliation
                .purge_stale_initiated(engine.config.initiated_ttl_hours)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            info!(
                purged = purged,
                ttl_hours = engine.config.initiated_ttl_hours,
                "Stale initiated subscription purge complete"
            );
        }
        "parked" => {
            let parked = engine
                .reconciliation
                .list_parked()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;

            if parked.is_empty() {
                info!("No parked payment events awaiting resolution");
            }
            for event in &parked {
                warn!(
                    id = %event.id,
                    provider = %event.provider,
                    payment_reference = %event.payment_reference,
                    reason = %event.reason,
                    parked_at = %event.parked_at,
                    "Parked payment event awaiting manual resolution"
                );
            }
        }
        other => {
            anyhow::bail!(
                "unknown task '{}'; expected check-invariants, sweep-vouchers, purge-initiated or parked",
                other
            );
        }
    }

    Ok(())
}
