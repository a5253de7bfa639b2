use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::SeedConfig;
use crate::fanout::{FanOutScheduler, ProcessRequest};

/// Registers the periodic `process_pending` job, or returns `None` when scheduling is disabled.
/// A firing that overlaps a still-running batch is skipped.
pub async fn maybe_build_scheduler(
    config: &SeedConfig,
    fanout: FanOutScheduler,
    cancel: CancellationToken,
) -> anyhow::Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let request = ProcessRequest::from_config(config);
    let running = Arc::new(Mutex::new(()));
    let cron = config.sync_cron.clone();

    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let fanout = fanout.clone();
        let request = request.clone();
        let cancel = cancel.clone();
        let running = running.clone();
        Box::pin(async move {
            let Ok(_guard) = running.try_lock() else {
                warn!("previous scheduled batch still running; skipping");
                return;
            };
            match fanout.process_pending(&request, &cancel).await {
                Ok(outcome) => info!(
                    found = outcome.events_found,
                    succeeded = outcome.succeeded,
                    failed = outcome.failed,
                    "scheduled batch finished"
                ),
                Err(err) => error!(error = %err, "scheduled batch failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    info!(cron = %config.sync_cron, "seeding job scheduled");
    Ok(Some(sched))
}
