use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use types::{
    elapsed_ms, FederatedCommand, Job, JobFilter, JobStatus, StatusMachine, StopJobRequest, Task,
    TaskFilter, TaskStatus, TaskUpdate,
};

use crate::controller::TaskController;
use crate::database::JobStore;
use crate::error::Result;
use crate::federation::FederatedScheduler;

/// What one detector pass found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetectReport {
    pub checked: usize,
    /// Tasks marked FAILED because their worker was gone.
    pub lost: usize,
    /// Tasks killed because their job had already ended.
    pub orphaned: usize,
    /// Dead-looking tasks that finished on their own during the grace period.
    pub raced: usize,
}

enum Probe {
    Alive,
    Lost,
    Orphaned,
    Raced,
}

/// Finds RUNNING tasks whose worker died without reporting.
pub struct Detector {
    party_id: String,
    job_store: Arc<dyn JobStore>,
    controller: Arc<TaskController>,
    federation: Arc<FederatedScheduler>,
    interval: Duration,
    grace_period: Duration,
    running: Arc<RwLock<bool>>,
}

impl Detector {
    pub fn new(
        party_id: impl Into<String>,
        job_store: Arc<dyn JobStore>,
        controller: Arc<TaskController>,
        federation: Arc<FederatedScheduler>,
        interval: Duration,
        grace_period: Duration,
    ) -> Self {
        Self {
            party_id: party_id.into(),
            job_store,
            controller,
            federation,
            interval,
            grace_period,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            party_id = self.party_id,
            interval_ms = self.interval.as_millis() as u64,
            "Starting detector"
        );
        *self.running.write().await = true;
        tokio::spawn(async move {
            loop {
                if !*self.running.read().await {
                    break;
                }
                match self.scan_once().await {
                    Ok(report) if report.lost + report.orphaned > 0 => {
                        info!(
                            checked = report.checked,
                            lost = report.lost,
                            orphaned = report.orphaned,
                            raced = report.raced,
                            "Detector pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Detector pass failed"),
                }
                tokio::time::sleep(self.interval).await;
            }
        })
    }

    pub async fn stop(&self) {
        info!("Stopping detector");
        *self.running.write().await = false;
    }

    /// Probe every locally RUNNING task once.
    pub async fn scan_once(&self) -> Result<DetectReport> {
        let tasks = self
            .job_store
            .query_tasks(&TaskFilter {
                party_id: Some(self.party_id.clone()),
                party_statuses: vec![TaskStatus::Running],
                only_latest: true,
                ..Default::default()
            })
            .await?;

        let mut report = DetectReport::default();
        for task in tasks {
            report.checked += 1;
            match self.probe(&task).await {
                Ok(Probe::Alive) => {}
                Ok(Probe::Lost) => report.lost += 1,
                Ok(Probe::Orphaned) => report.orphaned += 1,
                Ok(Probe::Raced) => report.raced += 1,
                Err(e) => {
                    warn!(
                        job_id = task.job_id,
                        task_id = task.task_id,
                        task_version = task.task_version,
                        error = %e,
                        "Failed to probe task"
                    );
                }
            }
        }
        Ok(report)
    }

    async fn owning_job(&self, task: &Task) -> Result<Option<Job>> {
        Ok(self
            .job_store
            .query_jobs(&JobFilter {
                job_id: Some(task.job_id.clone()),
                role: Some(task.role),
                party_id: Some(task.party_id.clone()),
                ..Default::default()
            })
            .await?
            .into_iter()
            .next())
    }

    async fn probe(&self, task: &Task) -> Result<Probe> {
        let job = self.owning_job(task).await?;

        if job.as_ref().map_or(true, |j| j.status.is_end()) {
            if let Err(e) = self.controller.kill_task(task).await {
                warn!(job_id = task.job_id, task_id = task.task_id, error = %e, "Failed to kill orphaned worker");
            }
            let failed = self.mark_failed(task, "job already ended").await?;
            if failed {
                info!(job_id = task.job_id, task_id = task.task_id, "Orphaned task stopped");
                return Ok(Probe::Orphaned);
            }
            return Ok(Probe::Raced);
        }

        if self.controller.is_alive(task).await {
            return Ok(Probe::Alive);
        }

        // A worker that just exited may still be reporting its final status.
        tokio::time::sleep(self.grace_period).await;
        let current = self
            .job_store
            .query_tasks(&TaskFilter::by_key(&task.key()))
            .await?
            .into_iter()
            .next();
        if current.map_or(true, |t| t.party_status != TaskStatus::Running) {
            info!(
                job_id = task.job_id,
                task_id = task.task_id,
                task_version = task.task_version,
                "Task finished during grace period"
            );
            return Ok(Probe::Raced);
        }

        if !self.mark_failed(task, "task worker lost").await? {
            return Ok(Probe::Raced);
        }
        warn!(
            job_id = task.job_id,
            task_id = task.task_id,
            task_version = task.task_version,
            role = %task.role,
            "Task worker lost, asking scheduler to stop the job"
        );

        if let Some(job) = job {
            let command = FederatedCommand::StopAll(StopJobRequest {
                job_id: task.job_id.clone(),
                task_name: None,
                stop_status: Some(JobStatus::Failed),
            });
            if let Err(e) = self.federation.send(&job.scheduler_party_id, &command).await {
                warn!(
                    job_id = task.job_id,
                    scheduler_party_id = job.scheduler_party_id,
                    error = %e,
                    "Failed to request job stop"
                );
            }
        }
        Ok(Probe::Lost)
    }

    async fn mark_failed(&self, task: &Task, reason: &str) -> Result<bool> {
        let now = Utc::now();
        let mut update = TaskUpdate::new(task.key());
        update.expected_party_status = Some(TaskStatus::Running);
        update.party_status = Some(TaskStatus::Failed);
        update.status = Some(TaskStatus::Failed);
        update.error_report = Some(reason.to_string());
        update.end_time = Some(now);
        update.elapsed = elapsed_ms(task.start_time, now);
        Ok(self.job_store.update_task(&update).await?)
    }
}
