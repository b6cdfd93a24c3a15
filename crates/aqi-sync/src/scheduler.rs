use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::{AirQualityService, SyncConfig};

fn reconcile_job(cron: &str, service: Arc<AirQualityService>) -> Result<Job> {
    Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            for (region, result) in service.reconcile_enabled().await {
                match result {
                    Ok(outcome) => info!(
                        %region,
                        updated = outcome.updated,
                        inserted = outcome.inserted,
                        "scheduled reconciliation finished"
                    ),
                    Err(err) => error!(%region, error = %err, "scheduled reconciliation failed"),
                }
            }
        })
    })
    .with_context(|| format!("creating reconcile job for cron {cron}"))
}

fn sweep_job(cron: &str, service: Arc<AirQualityService>) -> Result<Job> {
    Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            match service.sweep_default().await {
                Ok(outcome) => info!(deleted = outcome.deleted, "scheduled sweep finished"),
                Err(err) => error!(error = %err, "scheduled sweep failed"),
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {cron}"))
}

/// Builds (but does not start) the reconcile and sweep jobs when the
/// scheduler is enabled.
pub async fn maybe_build_scheduler(
    service: Arc<AirQualityService>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    sched
        .add(reconcile_job(&config.reconcile_cron, Arc::clone(&service))?)
        .await
        .context("adding reconcile job")?;
    sched
        .add(sweep_job(&config.sweep_cron, Arc::clone(&service))?)
        .await
        .context("adding sweep job")?;
    info!(
        reconcile_cron = %config.reconcile_cron,
        sweep_cron = %config.sweep_cron,
        "scheduler jobs registered"
    );
    Ok(Some(sched))
}

/// Starts `sched` and only then reports the scheduler as running.
pub async fn start_scheduler(
    sched: &JobScheduler,
    service: &AirQualityService,
    config: &SyncConfig,
) -> Result<()> {
    sched.start().await.context("starting scheduler")?;
    service
        .mark_scheduler_running(&config.reconcile_cron, &config.sweep_cron)
        .await;
    info!("scheduler started");
    Ok(())
}
