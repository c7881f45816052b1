use anyhow::{Context, Result};
use serde_json::json;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::{JobKind, JobRunner};

/// One cron entry per job that has a schedule. Returns `None` when scheduling is disabled.
/// The caller starts the scheduler.
pub async fn maybe_build_scheduler(runner: &JobRunner) -> Result<Option<JobScheduler>> {
    if !runner.context().config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for job in JobKind::ALL {
        let Some(cron) = runner.context().config.cron_for(job) else {
            info!(job = job.id(), "no schedule; manual trigger only");
            continue;
        };
        let runner = runner.clone();
        let entry = Job::new_async(cron, move |_uuid, _l| {
            let runner = runner.clone();
            Box::pin(async move {
                let response = runner.invoke(job, json!({})).await;
                if !response.is_success() {
                    warn!(job = job.id(), error = ?response.body.error, "scheduled run failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {job} ({cron})"))?;
        sched.add(entry).await.context("adding scheduler job")?;
        info!(job = job.id(), cron, "scheduled");
    }
    Ok(Some(sched))
}
