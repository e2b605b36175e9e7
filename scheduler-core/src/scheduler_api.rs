use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use types::{
    classify_transition, elapsed_ms, task_id_for, CreateAllRequest, JobDefaults, JobStatus,
    JobStatusAllData, PartyTaskStatus, ScheduleJob, ScheduleJobFilter, ScheduleJobUpdate,
    ScheduleTask, ScheduleTaskFilter, ScheduleTaskUpdate, StatusMachine, TaskReportRequest,
    TaskStatus, Transition, DEFAULT_PROTOCOL, INITIAL_TASK_VERSION,
};
use uuid::Uuid;

use crate::database::ScheduleStore;
use crate::error::{Result, SchedulerError, StoreError};

/// Scheduler-party operations that only touch the schedule store.
///
/// Submission, stop and rerun record intent; the job scheduler acts on it
/// during its next tick.
pub struct SchedulerApi {
    party_id: String,
    store: Arc<dyn ScheduleStore>,
    job_defaults: JobDefaults,
}

impl SchedulerApi {
    pub fn new(
        party_id: impl Into<String>,
        store: Arc<dyn ScheduleStore>,
        job_defaults: JobDefaults,
    ) -> Self {
        Self {
            party_id: party_id.into(),
            store,
            job_defaults,
        }
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    pub fn job_defaults(&self) -> &JobDefaults {
        &self.job_defaults
    }

    /// Validate the DAG and record the job with its first task versions.
    pub async fn submit_job(&self, request: CreateAllRequest) -> Result<String> {
        let parsed = dag_parser::parse_value(&request.dag)?;
        let conf = parsed.conf.resolve(&self.job_defaults);

        let job_id = match request.job_id {
            Some(id) if id.trim().is_empty() => {
                return Err(SchedulerError::InvalidRequest("job_id is empty".to_string()))
            }
            Some(id) => id,
            None => Uuid::new_v4().simple().to_string(),
        };
        let protocol = request
            .config
            .get("protocol")
            .and_then(|p| p.as_str())
            .unwrap_or(DEFAULT_PROTOCOL)
            .to_string();

        let now = Utc::now();
        let job = ScheduleJob {
            job_id: job_id.clone(),
            protocol,
            dag: request.dag,
            parties: parsed.parties(),
            initiator_party_id: self.party_id.clone(),
            scheduler_party_id: self.party_id.clone(),
            status: JobStatus::Waiting,
            status_code: 0,
            progress: 0,
            priority: conf.priority,
            schedule_signal: false,
            schedule_time: None,
            cancel_signal: false,
            cancel_time: None,
            stop_status: None,
            rerun_signal: false,
            rerun_tasks: Vec::new(),
            created_parties: Vec::new(),
            error_message: None,
            create_time: now,
            update_time: now,
            start_time: None,
            end_time: None,
            elapsed: None,
        };
        self.store.create_schedule_job(&job).await?;

        let mut task_count = 0;
        for (party, graph) in &parsed.party_graphs {
            for task in graph.tasks() {
                let row = ScheduleTask {
                    job_id: job_id.clone(),
                    role: party.role,
                    party_id: party.party_id.clone(),
                    task_name: task.task_name.clone(),
                    component: task.component.clone(),
                    task_id: task_id_for(&job_id, &task.task_name),
                    task_version: INITIAL_TASK_VERSION,
                    status: TaskStatus::Pending,
                    auto_retries: conf.auto_retries as i32,
                    error_report: None,
                    create_time: now,
                    update_time: now,
                    start_time: None,
                    end_time: None,
                    elapsed: None,
                };
                self.store.create_schedule_task(&row).await?;
                task_count += 1;
            }
        }

        info!(
            job_id = job_id,
            parties = job.parties.len(),
            tasks = task_count,
            "Job submitted"
        );
        Ok(job_id)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<ScheduleJob> {
        self.store
            .query_schedule_jobs(&ScheduleJobFilter::by_job(job_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    pub async fn latest_tasks(&self, job_id: &str) -> Result<Vec<ScheduleTask>> {
        Ok(self
            .store
            .query_schedule_tasks(&ScheduleTaskFilter::latest_for_job(job_id))
            .await?)
    }

    /// Raise the cancel signal. Parties are stopped on the next tick.
    pub async fn stop_job(&self, job_id: &str, stop_status: Option<JobStatus>) -> Result<()> {
        let stop_status = stop_status.unwrap_or(JobStatus::Canceled);
        if !matches!(stop_status, JobStatus::Canceled | JobStatus::Failed) {
            return Err(SchedulerError::InvalidRequest(format!(
                "{} is not a stop status",
                stop_status
            )));
        }

        let job = self.get_job(job_id).await?;
        if job.status.is_end() {
            return Err(SchedulerError::InvalidRequest(format!(
                "job {} already finished with {}",
                job_id, job.status
            )));
        }

        let mut update = ScheduleJobUpdate::new(job_id);
        update.cancel_signal = Some(true);
        update.cancel_time = Some(Utc::now());
        update.stop_status = Some(stop_status);
        self.store.update_schedule_job(&update).await?;

        info!(job_id, stop_status = %stop_status, "Stop requested");
        Ok(())
    }

    /// Ask for a rerun of `tasks` (all unfinished ones when empty) and everything downstream.
    pub async fn rerun_job(&self, job_id: &str, tasks: Vec<String>) -> Result<()> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_end() {
            return Err(SchedulerError::InvalidRequest(format!(
                "job {} is still {}",
                job_id, job.status
            )));
        }

        let parsed = dag_parser::parse_value(&job.dag)?;
        if let Some(unknown) = tasks.iter().find(|t| !parsed.graph.contains(t)) {
            return Err(SchedulerError::InvalidRequest(format!(
                "job {} has no task {}",
                job_id, unknown
            )));
        }

        let mut update = ScheduleJobUpdate::new(job_id);
        update.expected_status = Some(job.status);
        update.rerun_signal = Some(true);
        update.rerun_tasks = Some(tasks);
        if !self.store.update_schedule_job(&update).await? {
            return Err(SchedulerError::InvalidRequest(format!(
                "job {} changed while requesting rerun",
                job_id
            )));
        }

        info!(job_id, "Rerun requested");
        Ok(())
    }

    pub async fn query_job_status(&self, job_id: &str) -> Result<JobStatusAllData> {
        let job = self.get_job(job_id).await?;
        let status = self
            .latest_tasks(job_id)
            .await?
            .into_iter()
            .map(|t| PartyTaskStatus {
                task_name: t.task_name,
                task_version: t.task_version,
                role: t.role,
                party_id: t.party_id,
                status: t.status,
            })
            .collect();

        Ok(JobStatusAllData {
            job_id: job.job_id,
            job_status: job.status,
            progress: job.progress,
            status,
        })
    }

    /// Apply a party's task status report to the schedule task.
    pub async fn report_task(&self, report: &TaskReportRequest) -> Result<bool> {
        let filter = ScheduleTaskFilter {
            job_id: Some(report.job_id.clone()),
            task_id: Some(report.task_id.clone()),
            task_version: Some(report.task_version),
            role: Some(report.role),
            party_id: Some(report.party_id.clone()),
            ..Default::default()
        };
        let row = self
            .store
            .query_schedule_tasks(&filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SchedulerError::TaskNotFound(report.task_id.clone()))?;

        match classify_transition(row.status, report.status) {
            Transition::NoOp => return Ok(false),
            Transition::Illegal => {
                return Err(StoreError::illegal(row.status, report.status).into());
            }
            Transition::Advance => {}
        }

        let now = Utc::now();
        let mut update = ScheduleTaskUpdate::new(row.key());
        update.expected_status = Some(row.status);
        update.status = Some(report.status);
        update.error_report = report.error_report.clone();
        if report.status == TaskStatus::Running && row.start_time.is_none() {
            update.start_time = Some(now);
        }
        if report.status.is_end() {
            update.end_time = Some(now);
            update.elapsed = elapsed_ms(row.start_time.or(update.start_time), now);
        }

        let changed = self.store.update_schedule_task(&update).await?;
        info!(
            job_id = report.job_id,
            task_id = report.task_id,
            task_version = report.task_version,
            role = %report.role,
            party_id = report.party_id,
            status = %report.status,
            changed,
            "Task report applied"
        );
        Ok(changed)
    }
}
