use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use types::{
    elapsed_ms, task_id_for, AdapterJobStatus, AuditConfirmRequest, CreateJobRequest,
    FederatedCommand, Job, JobConf, JobDefaults, JobFilter, JobRef, JobStatus, JobUpdate, Party,
    PollTaskRequest, ResponseEnvelope, Role, StartTaskRequest, StatusMachine, StopJobRequest, SyncType,
    Task, TaskCallbackRequest, TaskFilter, TaskKey, TaskReportRequest, TaskStatus, TaskStatusData,
    TaskUpdate, DEFAULT_PROTOCOL, INITIAL_TASK_VERSION,
};

use crate::controller::TaskController;
use crate::database::{validate_job_status, validate_status, JobStore};
use crate::error::{Result, SchedulerError, StoreError};
use crate::federation::{CommandHandler, FederatedScheduler};
use crate::scheduler_api::SchedulerApi;

/// Party-side handling of every federated command.
pub struct PartyService {
    party_id: String,
    job_store: Arc<dyn JobStore>,
    controller: Arc<TaskController>,
    /// Outbound client for reports to a remote scheduler party.
    federation: Arc<FederatedScheduler>,
    scheduler: Option<Arc<SchedulerApi>>,
    job_defaults: JobDefaults,
}

impl PartyService {
    pub fn new(
        party_id: impl Into<String>,
        job_store: Arc<dyn JobStore>,
        controller: Arc<TaskController>,
        federation: Arc<FederatedScheduler>,
        job_defaults: JobDefaults,
    ) -> Self {
        Self {
            party_id: party_id.into(),
            job_store,
            controller,
            federation,
            scheduler: None,
            job_defaults,
        }
    }

    /// Also serve the scheduler-party commands.
    pub fn with_scheduler(mut self, scheduler: Arc<SchedulerApi>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn party_id(&self) -> &str {
        &self.party_id
    }

    pub async fn dispatch(&self, command: FederatedCommand) -> Result<Option<Value>> {
        match command {
            FederatedCommand::CreateJob(request) => self.create_job(request).await.map(|_| None),
            FederatedCommand::StartJob(request) => self.start_job(&request).await.map(|_| None),
            FederatedCommand::StopJob(request) => self.stop_job(&request).await.map(|_| None),
            FederatedCommand::AuditConfirm(request) => {
                self.audit_confirm(&request).await.map(|_| None)
            }
            FederatedCommand::RerunJob(request) => self.rerun_job(&request).await.map(|_| None),
            FederatedCommand::StartTask(request) => {
                let status = self.start_task(&request).await?;
                to_data(&TaskStatusData { status })
            }
            FederatedCommand::PollTask(request) => {
                let status = self.poll_task(&request).await?;
                to_data(&TaskStatusData { status })
            }
            FederatedCommand::TaskCallback(request) => {
                self.task_callback(&request).await.map(|_| None)
            }
            FederatedCommand::CreateAll(request) => {
                let job_id = self.scheduler()?.submit_job(request).await?;
                Ok(Some(json!({ "job_id": job_id })))
            }
            FederatedCommand::StopAll(request) => self
                .scheduler()?
                .stop_job(&request.job_id, request.stop_status)
                .await
                .map(|_| None),
            FederatedCommand::StatusAll(request) => {
                let status = self.scheduler()?.query_job_status(&request.job_id).await?;
                to_data(&status)
            }
            FederatedCommand::ReportTask(request) => {
                self.scheduler()?.report_task(&request).await.map(|_| None)
            }
        }
    }

    fn scheduler(&self) -> Result<&Arc<SchedulerApi>> {
        self.scheduler.as_ref().ok_or_else(|| {
            SchedulerError::InvalidRequest(format!(
                "party {} is not a scheduler party",
                self.party_id
            ))
        })
    }

    async fn local_jobs(&self, job_id: &str) -> Result<Vec<Job>> {
        let jobs = self
            .job_store
            .query_jobs(&JobFilter {
                job_id: Some(job_id.to_string()),
                party_id: Some(self.party_id.clone()),
                ..Default::default()
            })
            .await?;
        if jobs.is_empty() {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }
        Ok(jobs)
    }

    async fn latest_tasks(&self, job: &Job) -> Result<Vec<Task>> {
        Ok(self
            .job_store
            .query_tasks(&TaskFilter {
                job_id: Some(job.job_id.clone()),
                role: Some(job.role),
                party_id: Some(job.party_id.clone()),
                only_latest: true,
                ..Default::default()
            })
            .await?)
    }

    async fn find_task(&self, key: &TaskKey) -> Result<Option<Task>> {
        Ok(self
            .job_store
            .query_tasks(&TaskFilter::by_key(key))
            .await?
            .into_iter()
            .next())
    }

    /// Create the local job for every role this party holds. Repeated calls are harmless.
    pub async fn create_job(&self, request: CreateJobRequest) -> Result<()> {
        let parsed = dag_parser::parse_value(&request.dag)?;
        let local: Vec<Party> = parsed
            .parties()
            .into_iter()
            .filter(|p| p.party_id == self.party_id)
            .collect();
        if local.is_empty() {
            return Err(SchedulerError::InvalidRequest(format!(
                "party {} does not take part in job {}",
                self.party_id, request.job_id
            )));
        }

        let conf = parsed.conf.resolve(&self.job_defaults);
        let protocol = request
            .config
            .get("protocol")
            .and_then(|p| p.as_str())
            .unwrap_or(DEFAULT_PROTOCOL)
            .to_string();
        let now = Utc::now();

        for party in local {
            let existing = self
                .job_store
                .query_jobs(&JobFilter {
                    job_id: Some(request.job_id.clone()),
                    role: Some(party.role),
                    party_id: Some(party.party_id.clone()),
                    ..Default::default()
                })
                .await?;
            if !existing.is_empty() {
                info!(job_id = request.job_id, role = %party.role, "Job already created");
                continue;
            }

            // Tasks first so a partially applied create is completed by a retry.
            if let Some(graph) = parsed.party_graph(&party) {
                for party_task in graph.tasks() {
                    let task = Task {
                        job_id: request.job_id.clone(),
                        role: party.role,
                        party_id: party.party_id.clone(),
                        task_name: party_task.task_name.clone(),
                        component: party_task.component.clone(),
                        task_id: task_id_for(&request.job_id, &party_task.task_name),
                        task_version: INITIAL_TASK_VERSION,
                        status: TaskStatus::Pending,
                        party_status: TaskStatus::Pending,
                        parameters: Value::Object(party_task.parameters.clone()),
                        inputs: party_task.inputs.clone(),
                        conf: Value::Object(party_task.conf.clone()),
                        dependencies: party_task.dependencies.clone(),
                        worker_id: None,
                        run_pid: None,
                        run_ip: None,
                        error_report: None,
                        create_time: now,
                        update_time: now,
                        start_time: None,
                        end_time: None,
                        elapsed: None,
                    };
                    match self.job_store.create_task(&task).await {
                        Ok(()) | Err(StoreError::Duplicate(_)) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }

            let job = Job {
                job_id: request.job_id.clone(),
                role: party.role,
                party_id: party.party_id.clone(),
                protocol: protocol.clone(),
                dag: request.dag.clone(),
                parties: parsed.parties(),
                initiator_party_id: request.initiator_party_id.clone(),
                scheduler_party_id: request.scheduler_party_id.clone(),
                status: JobStatus::Waiting,
                status_code: 0,
                progress: 0,
                priority: conf.priority,
                error_message: None,
                create_time: now,
                update_time: now,
                start_time: None,
                end_time: None,
                elapsed: None,
            };
            match self.job_store.create_job(&job).await {
                Ok(()) => info!(job_id = job.job_id, role = %job.role, party_id = job.party_id, "Job created"),
                Err(StoreError::Duplicate(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn start_local_job(&self, job: &Job) -> Result<()> {
        if job.status != JobStatus::Waiting {
            return Ok(());
        }
        let mut update = JobUpdate::new(job.key());
        update.expected_status = Some(JobStatus::Waiting);
        update.status = Some(JobStatus::Running);
        update.start_time = Some(Utc::now());
        if self.job_store.update_job(&update).await? {
            info!(job_id = job.job_id, role = %job.role, "Job running");
        }
        Ok(())
    }

    pub async fn start_job(&self, request: &JobRef) -> Result<()> {
        for job in self.local_jobs(&request.job_id).await? {
            self.start_local_job(&job).await?;

            // Nothing to run here: this party is done as soon as it starts.
            if self.latest_tasks(&job).await?.is_empty() {
                let now = Utc::now();
                let mut update = JobUpdate::new(job.key());
                update.expected_status = Some(JobStatus::Running);
                update.status = Some(JobStatus::Success);
                update.progress = Some(100);
                update.end_time = Some(now);
                update.elapsed = elapsed_ms(job.start_time.or(Some(now)), now);
                self.job_store.update_job(&update).await?;
                info!(job_id = job.job_id, role = %job.role, "No local tasks, job finished");
            }
        }
        Ok(())
    }

    /// Create the requested version from the latest earlier one.
    async fn create_task_version(&self, key: &TaskKey) -> Result<Task> {
        let history = self
            .job_store
            .query_tasks(&TaskFilter {
                job_id: Some(key.job_id.clone()),
                task_id: Some(key.task_id.clone()),
                role: Some(key.role),
                party_id: Some(key.party_id.clone()),
                ..Default::default()
            })
            .await?;
        let previous = history
            .into_iter()
            .filter(|t| t.task_version < key.task_version)
            .max_by_key(|t| t.task_version)
            .ok_or_else(|| SchedulerError::TaskNotFound(key.task_id.clone()))?;

        let now = Utc::now();
        let task = Task {
            task_version: key.task_version,
            status: TaskStatus::Pending,
            party_status: TaskStatus::Pending,
            worker_id: None,
            run_pid: None,
            run_ip: None,
            error_report: None,
            create_time: now,
            update_time: now,
            start_time: None,
            end_time: None,
            elapsed: None,
            ..previous
        };

        match self.job_store.create_task(&task).await {
            Ok(()) => {
                info!(
                    job_id = task.job_id,
                    task_id = task.task_id,
                    task_version = task.task_version,
                    "New task version created"
                );
                Ok(task)
            }
            Err(StoreError::Duplicate(_)) => self
                .find_task(key)
                .await?
                .ok_or_else(|| SchedulerError::TaskNotFound(key.task_id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Start one task version locally; repeated requests report the current status.
    pub async fn start_task(&self, request: &StartTaskRequest) -> Result<TaskStatus> {
        let key = TaskKey {
            job_id: request.job_id.clone(),
            task_id: request.task_id.clone(),
            task_version: request.task_version,
            role: request.role,
            party_id: request.party_id.clone(),
        };

        let jobs = self.local_jobs(&request.job_id).await?;
        if let Some(job) = jobs.iter().find(|j| j.role == request.role) {
            if job.status.is_end() {
                return Err(SchedulerError::InvalidRequest(format!(
                    "job {} already finished with {}",
                    job.job_id, job.status
                )));
            }
            self.start_local_job(job).await?;
        }

        let task = match self.find_task(&key).await? {
            Some(task) => task,
            None => self.create_task_version(&key).await?,
        };
        if task.party_status != TaskStatus::Pending {
            return Ok(task.party_status);
        }

        let status = self.controller.start_task(&task).await?;
        self.refresh_progress(&request.job_id, request.role).await;
        Ok(status)
    }

    pub async fn poll_task(&self, request: &PollTaskRequest) -> Result<TaskStatus> {
        let key = TaskKey {
            job_id: request.job_id.clone(),
            task_id: request.task_id.clone(),
            task_version: request.task_version,
            role: request.role,
            party_id: request.party_id.clone(),
        };
        self.find_task(&key)
            .await?
            .map(|t| t.party_status)
            .ok_or_else(|| SchedulerError::TaskNotFound(request.task_id.clone()))
    }

    /// Worker status callback.
    pub async fn task_callback(&self, request: &TaskCallbackRequest) -> Result<()> {
        let key = TaskKey {
            job_id: request.job_id.clone(),
            task_id: request.task_id.clone(),
            task_version: request.task_version,
            role: request.role,
            party_id: request.party_id.clone(),
        };
        let task = self
            .find_task(&key)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound(request.task_id.clone()))?;

        if let Some(next) = validate_status(task.party_status, Some(request.status))? {
            let now = Utc::now();
            let mut update = TaskUpdate::new(key);
            update.expected_party_status = Some(task.party_status);
            update.party_status = Some(next);
            update.status = Some(next);
            update.error_report = request.error_report.clone();
            if next == TaskStatus::Running && task.start_time.is_none() {
                update.start_time = Some(now);
            }
            if next.is_end() {
                update.end_time = Some(now);
                update.elapsed = elapsed_ms(task.start_time.or(update.start_time), now);
            }
            if !self.job_store.update_task(&update).await? {
                info!(
                    job_id = task.job_id,
                    task_id = task.task_id,
                    task_version = task.task_version,
                    "Task changed before callback applied"
                );
                return Ok(());
            }
            info!(
                job_id = task.job_id,
                task_id = task.task_id,
                task_version = task.task_version,
                status = %next,
                "Task status updated"
            );
            self.refresh_progress(&task.job_id, task.role).await;
        }

        let jobs = self.local_jobs(&request.job_id).await?;
        let Some(job) = jobs.iter().find(|j| j.role == request.role) else {
            return Ok(());
        };
        let conf = JobConf::from_dag_document(&job.dag)
            .unwrap_or_default()
            .resolve(&self.job_defaults);
        if conf.sync_type == SyncType::Callback {
            self.report_to_scheduler(job, request).await?;
        }
        Ok(())
    }

    async fn report_to_scheduler(&self, job: &Job, request: &TaskCallbackRequest) -> Result<()> {
        let report = TaskReportRequest {
            job_id: request.job_id.clone(),
            role: request.role,
            party_id: request.party_id.clone(),
            task_id: request.task_id.clone(),
            task_version: request.task_version,
            status: request.status,
            error_report: request.error_report.clone(),
        };

        match &self.scheduler {
            Some(api) if job.scheduler_party_id == self.party_id => {
                api.report_task(&report).await?;
            }
            _ => {
                self.federation
                    .send(&job.scheduler_party_id, &FederatedCommand::ReportTask(report))
                    .await?;
            }
        }
        Ok(())
    }

    /// Kill in-flight local tasks and, for a whole-job stop, end the local job.
    pub async fn stop_job(&self, request: &StopJobRequest) -> Result<()> {
        let stop_status = request.stop_status.unwrap_or(JobStatus::Canceled);
        let now = Utc::now();

        for job in self.local_jobs(&request.job_id).await? {
            let tasks = self.latest_tasks(&job).await?;
            for task in tasks.iter().filter(|t| {
                t.party_status.is_in_flight()
                    && request.task_name.as_ref().map_or(true, |n| *n == t.task_name)
            }) {
                if let Err(e) = self.controller.kill_task(task).await {
                    warn!(
                        job_id = task.job_id,
                        task_id = task.task_id,
                        error = %e,
                        "Failed to kill task worker"
                    );
                }
                let mut update = TaskUpdate::new(task.key());
                update.expected_party_status = Some(task.party_status);
                update.party_status = Some(TaskStatus::Failed);
                update.status = Some(TaskStatus::Failed);
                update.error_report = Some(format!("stopped with {}", stop_status));
                update.end_time = Some(now);
                update.elapsed = elapsed_ms(task.start_time, now);
                self.job_store.update_task(&update).await?;
            }

            if request.task_name.is_none() && !job.status.is_end() {
                let mut update = JobUpdate::new(job.key());
                update.expected_status = Some(job.status);
                update.status = Some(stop_status);
                update.end_time = Some(now);
                update.elapsed = elapsed_ms(job.start_time, now);
                if self.job_store.update_job(&update).await? {
                    info!(job_id = job.job_id, role = %job.role, status = %stop_status, "Job stopped");
                }
            }
        }
        Ok(())
    }

    /// Apply the scheduler's final verdict to the local job.
    pub async fn audit_confirm(&self, request: &AuditConfirmRequest) -> Result<()> {
        for job in self.local_jobs(&request.job_id).await? {
            let target = parse_job_status(&job.protocol, &request.status)?;
            if job.status == target {
                continue;
            }
            if job.status == JobStatus::Waiting && target == JobStatus::Success {
                self.start_local_job(&job).await?;
            }

            let current = if job.status == JobStatus::Waiting && target == JobStatus::Success {
                JobStatus::Running
            } else {
                job.status
            };
            validate_job_status(current, Some(target), false)?;

            let now = Utc::now();
            let mut update = JobUpdate::new(job.key());
            update.expected_status = Some(current);
            update.status = Some(target);
            update.end_time = Some(now);
            update.elapsed = elapsed_ms(job.start_time.or(Some(now)), now);
            if target == JobStatus::Success {
                update.progress = Some(100);
            }
            self.job_store.update_job(&update).await?;
            info!(job_id = job.job_id, role = %job.role, status = %target, "Job status confirmed");
        }
        Ok(())
    }

    pub async fn rerun_job(&self, request: &JobRef) -> Result<()> {
        for job in self.local_jobs(&request.job_id).await? {
            if !job.status.is_end() {
                continue;
            }
            let mut update = JobUpdate::new(job.key());
            update.expected_status = Some(job.status);
            update.status = Some(JobStatus::Waiting);
            update.rerun = true;
            update.progress = Some(0);
            if self.job_store.update_job(&update).await? {
                info!(job_id = job.job_id, role = %job.role, "Job reset for rerun");
            }
        }
        Ok(())
    }

    /// Local progress is the share of latest tasks that succeeded.
    async fn refresh_progress(&self, job_id: &str, role: Role) {
        let jobs = match self.local_jobs(job_id).await {
            Ok(jobs) => jobs,
            Err(_) => return,
        };
        for job in jobs.into_iter().filter(|j| j.role == role) {
            let tasks = match self.latest_tasks(&job).await {
                Ok(tasks) => tasks,
                Err(e) => {
                    warn!(job_id, error = %e, "Failed to read tasks for progress");
                    continue;
                }
            };
            if tasks.is_empty() {
                continue;
            }
            let done = tasks.iter().filter(|t| t.party_status == TaskStatus::Success).count();
            let progress = (done * 100 / tasks.len()) as i32;
            if progress == job.progress {
                continue;
            }
            let mut update = JobUpdate::new(job.key());
            update.progress = Some(progress);
            if let Err(e) = self.job_store.update_job(&update).await {
                warn!(job_id, error = %e, "Failed to update progress");
            }
        }
    }
}

fn to_data<T: serde::Serialize>(value: &T) -> Result<Option<Value>> {
    serde_json::to_value(value)
        .map(Some)
        .map_err(|e| StoreError::Serialization(e.to_string()).into())
}

/// Primary status names always parse; adapter protocols may also send
/// their own status names, mapped explicitly.
fn parse_job_status(protocol: &str, status: &str) -> Result<JobStatus> {
    if let Ok(status) = JobStatus::from_str(status) {
        return Ok(status);
    }
    if protocol != DEFAULT_PROTOCOL {
        if let Ok(adapter) = AdapterJobStatus::from_str(status) {
            return Ok(adapter.to_job_status());
        }
    }
    Err(SchedulerError::InvalidRequest(format!(
        "unknown job status {} for protocol {}",
        status, protocol
    )))
}

#[async_trait]
impl CommandHandler for PartyService {
    async fn handle(&self, command: FederatedCommand) -> ResponseEnvelope {
        let endpoint = command.endpoint();
        let job_id = command.job_id().to_string();
        match self.dispatch(command).await {
            Ok(data) => ResponseEnvelope::success(data),
            Err(e) => {
                warn!(
                    job_id,
                    endpoint,
                    party_id = self.party_id,
                    error = %e,
                    "Federated command failed"
                );
                ResponseEnvelope::error(e.return_code(), e.to_string())
            }
        }
    }
}
