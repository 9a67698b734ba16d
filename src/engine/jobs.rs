//! Wall-clock scheduled jobs.
//!
//! Wraps `tokio-cron-scheduler`'s `JobScheduler` and keeps a mapping from
//! job names to internal UUIDs so jobs can be removed at runtime. Two jobs
//! are registered at startup: the daily verification ceremony and the
//! five-minute staleness sweep.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_cron_scheduler::JobScheduler;

use super::{heartbeat, EngineInner};
use crate::ceremony;

pub struct JobRunner {
    job_scheduler: JobScheduler,
    /// Maps job name -> job UUID (for removing jobs at runtime)
    job_ids: HashMap<String, uuid::Uuid>,
}

impl JobRunner {
    /// Create a new runner. Call `start()` after registering jobs.
    pub async fn new() -> Result<Self> {
        let job_scheduler = JobScheduler::new()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create job scheduler: {}", e))?;

        Ok(Self {
            job_scheduler,
            job_ids: HashMap::new(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.job_scheduler
            .start()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start job scheduler: {}", e))?;

        tracing::info!("Job scheduler started");
        Ok(())
    }

    /// Register a job under a name.
    pub async fn add_job(
        &mut self,
        name: &str,
        cron_expression: &str,
        on_fire: impl FnMut(
                uuid::Uuid,
                tokio_cron_scheduler::JobScheduler,
            ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        let job = tokio_cron_scheduler::Job::new_async(cron_expression, on_fire)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", cron_expression, e))?;

        let job_uuid = job.guid();
        self.job_scheduler
            .add(job)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to add job: {}", e))?;

        self.job_ids.insert(name.to_string(), job_uuid);

        tracing::info!("Registered cron job '{}' (uuid: {})", name, job_uuid);
        Ok(())
    }

    pub async fn remove_job(&mut self, name: &str) -> Result<()> {
        if let Some(job_uuid) = self.job_ids.remove(name) {
            self.job_scheduler
                .remove(&job_uuid)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to remove job: {}", e))?;
            tracing::info!("Removed cron job '{}'", name);
        }
        Ok(())
    }

    pub fn job_count(&self) -> usize {
        self.job_ids.len()
    }
}

/// Validate a cron expression without creating a job.
pub fn validate_cron_expression(expr: &str) -> Result<(), String> {
    expr.parse::<croner::Cron>()
        .map(|_| ())
        .map_err(|e| format!("Invalid cron expression '{}': {}", expr, e))
}

/// Register the engine's standing jobs and start the runner.
pub async fn start_engine_jobs(inner: Arc<EngineInner>) -> Result<JobRunner> {
    let mut runner = JobRunner::new().await?;

    // Daily verification ceremony at the configured wall-clock time.
    let ceremony_cron = format!(
        "0 {} {} * * *",
        inner.config.ceremony_minute, inner.config.ceremony_hour
    );
    let ceremony_inner = inner.clone();
    runner
        .add_job("daily_ceremony", &ceremony_cron, move |_uuid, _sched| {
            let inner = ceremony_inner.clone();
            Box::pin(async move {
                if let Err(e) = ceremony::run_daily(&inner).await {
                    tracing::warn!("Daily ceremony failed: {}", e);
                }
            })
        })
        .await?;

    // Staleness sweep every five minutes.
    let sweep_inner = inner.clone();
    runner
        .add_job("staleness_sweep", "0 */5 * * * *", move |_uuid, _sched| {
            let inner = sweep_inner.clone();
            Box::pin(async move {
                if let Err(e) = heartbeat::staleness_sweep(&inner).await {
                    tracing::warn!("Staleness sweep failed: {}", e);
                }
            })
        })
        .await?;

    runner.start().await?;
    Ok(runner)
}
