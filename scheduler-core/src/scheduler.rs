use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use types::{
    classify_transition, distinct_party_ids, elapsed_ms, AuditConfirmRequest, CreateAllRequest,
    CreateJobRequest, EffectiveJobConf, FederatedCommand, JobRef, JobStatus, JobStatusAllData,
    OrderBy, PollTaskRequest, ScheduleJob, ScheduleJobFilter, ScheduleJobUpdate, ScheduleTask,
    ScheduleTaskUpdate, StartTaskRequest, StatusMachine, StopJobRequest, SyncType, TaskStatus,
    TaskStatusData, Transition,
};

use crate::config::SchedulerConfig;
use crate::database::ScheduleStore;
use crate::error::{FederatedError, Result};
use crate::federation::FederatedScheduler;
use crate::resource::{job_conf, Admission, ResourceManager};
use crate::scheduler_api::SchedulerApi;

/// Aggregate status of one task across the parties running it.
pub fn aggregate_status(rows: &[&ScheduleTask]) -> TaskStatus {
    if rows.iter().any(|r| r.status == TaskStatus::Failed) {
        TaskStatus::Failed
    } else if rows.iter().all(|r| r.status == TaskStatus::Success) {
        TaskStatus::Success
    } else if rows.iter().any(|r| r.status == TaskStatus::Running) {
        TaskStatus::Running
    } else if rows.iter().any(|r| r.status == TaskStatus::Ready) {
        TaskStatus::Ready
    } else {
        TaskStatus::Pending
    }
}

/// Cross-party progress: the least advanced party wins. No tasks is 100.
pub fn job_progress(tasks: &[ScheduleTask]) -> i32 {
    let mut per_party: BTreeMap<(types::Role, &str), (usize, usize)> = BTreeMap::new();
    for task in tasks {
        let entry = per_party
            .entry((task.role, task.party_id.as_str()))
            .or_insert((0, 0));
        entry.1 += 1;
        if task.status == TaskStatus::Success {
            entry.0 += 1;
        }
    }
    per_party
        .values()
        .map(|(done, total)| (done * 100 / total) as i32)
        .min()
        .unwrap_or(100)
}

fn group_by_task(tasks: &[ScheduleTask]) -> BTreeMap<&str, Vec<&ScheduleTask>> {
    let mut groups: BTreeMap<&str, Vec<&ScheduleTask>> = BTreeMap::new();
    for task in tasks {
        groups.entry(task.task_name.as_str()).or_default().push(task);
    }
    groups
}

/// Outcome of the failure pass of a running job.
enum FailurePass {
    Clean,
    Retried,
    JobFailed,
}

/// The scheduler party's control loop.
///
/// Holds no state between ticks; everything it decides is read from and
/// written to the schedule store.
pub struct JobScheduler {
    config: SchedulerConfig,
    store: Arc<dyn ScheduleStore>,
    federation: Arc<FederatedScheduler>,
    api: Arc<SchedulerApi>,
    resources: ResourceManager,
    running: Arc<RwLock<bool>>,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        api: Arc<SchedulerApi>,
        federation: Arc<FederatedScheduler>,
    ) -> Self {
        let resources = ResourceManager::new(config.max_running_jobs, config.total_cores);
        Self {
            store: Arc::clone(api.store()),
            config,
            federation,
            api,
            resources,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn submit_job(&self, request: CreateAllRequest) -> Result<String> {
        self.api.submit_job(request).await
    }

    pub async fn stop_job(&self, job_id: &str, stop_status: Option<JobStatus>) -> Result<()> {
        self.api.stop_job(job_id, stop_status).await
    }

    pub async fn rerun_job(&self, job_id: &str, tasks: Vec<String>) -> Result<()> {
        self.api.rerun_job(job_id, tasks).await
    }

    pub async fn query_job_status(&self, job_id: &str) -> Result<JobStatusAllData> {
        self.api.query_job_status(job_id).await
    }

    /// Spawn the cron loop.
    pub async fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            party_id = self.config.party_id,
            interval_ms = self.config.schedule_interval.as_millis() as u64,
            "Starting job scheduler"
        );
        *self.running.write().await = true;
        tokio::spawn(async move { self.run_loop().await })
    }

    pub async fn stop(&self) {
        info!("Stopping job scheduler");
        *self.running.write().await = false;
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.schedule_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !*self.running.read().await {
                break;
            }
            if let Err(e) = self.tick().await {
                error!(error = %e, "Schedule tick failed");
            }
        }
    }

    /// One pass over every unfinished job, then over pending reruns.
    ///
    /// A failing job is logged and skipped; it never aborts the tick.
    pub async fn tick(&self) -> Result<()> {
        let jobs = self
            .store
            .query_schedule_jobs(&ScheduleJobFilter {
                statuses: JobStatus::non_end_statuses(),
                order_by: OrderBy::PriorityThenCreateTime,
                ..Default::default()
            })
            .await?;

        for job in jobs {
            let job_id = job.job_id.clone();
            if let Err(e) = self.schedule_job(job).await {
                error!(job_id, error = %e, "Failed to schedule job");
            }
        }

        let reruns = self
            .store
            .query_schedule_jobs(&ScheduleJobFilter {
                statuses: JobStatus::end_statuses(),
                rerun_signal: Some(true),
                ..Default::default()
            })
            .await?;

        for job in reruns {
            let job_id = job.job_id.clone();
            if let Err(e) = self.rerun(job).await {
                error!(job_id, error = %e, "Failed to rerun job");
            }
        }
        Ok(())
    }

    /// Take the job's schedule signal. A stale signal is reclaimed.
    async fn acquire_signal(&self, job: &ScheduleJob) -> Result<bool> {
        let now = Utc::now();
        let timeout = ChronoDuration::from_std(self.config.schedule_signal_timeout)
            .unwrap_or_else(|_| ChronoDuration::seconds(600));

        let mut update = ScheduleJobUpdate::new(&job.job_id);
        if job.schedule_signal {
            match job.schedule_time {
                Some(time) if now - time < timeout => return Ok(false),
                stale => {
                    warn!(job_id = job.job_id, "Reclaiming stale schedule signal");
                    update.expected_schedule_signal = Some(true);
                    update.expected_schedule_time = stale;
                }
            }
        } else {
            update.expected_schedule_signal = Some(false);
        }
        update.schedule_signal = Some(true);
        update.schedule_time = Some(now);
        Ok(self.store.update_schedule_job(&update).await?)
    }

    async fn release_signal(&self, job_id: &str) -> Result<()> {
        let mut update = ScheduleJobUpdate::new(job_id);
        update.expected_schedule_signal = Some(true);
        update.schedule_signal = Some(false);
        self.store.update_schedule_job(&update).await?;
        Ok(())
    }

    async fn schedule_job(&self, job: ScheduleJob) -> Result<()> {
        if !self.acquire_signal(&job).await? {
            debug!(job_id = job.job_id, "Job is being scheduled elsewhere");
            return Ok(());
        }

        let result = self.process(&job.job_id).await;
        if let Err(e) = self.release_signal(&job.job_id).await {
            warn!(job_id = job.job_id, error = %e, "Failed to release schedule signal");
        }
        result
    }

    async fn process(&self, job_id: &str) -> Result<()> {
        let job = self.api.get_job(job_id).await?;
        let conf = job_conf(&job, &self.config.job_defaults);

        if job.cancel_signal {
            let stop_status = job.stop_status.unwrap_or(JobStatus::Canceled);
            return self.cancel(&job, stop_status, "stopped by request").await;
        }

        if job.status == JobStatus::Running && self.timed_out(&job, &conf, Utc::now()) {
            return self.cancel(&job, JobStatus::Failed, "job timed out").await;
        }

        match job.status {
            JobStatus::Waiting => self.schedule_waiting(&job, &conf).await,
            JobStatus::Running => self.schedule_running(&job, &conf).await,
            _ => Ok(()),
        }
    }

    fn timed_out(&self, job: &ScheduleJob, conf: &EffectiveJobConf, now: DateTime<Utc>) -> bool {
        let limit = seconds(conf.timeout);
        job.start_time.map_or(false, |start| now - start > limit)
    }

    /// Create the job on every party, then admit and start it.
    async fn schedule_waiting(&self, job: &ScheduleJob, conf: &EffectiveJobConf) -> Result<()> {
        let pending: Vec<String> = distinct_party_ids(&job.parties)
            .into_iter()
            .filter(|p| !job.created_parties.contains(p))
            .collect();

        if !pending.is_empty() {
            let command = FederatedCommand::CreateJob(CreateJobRequest {
                job_id: job.job_id.clone(),
                dag: job.dag.clone(),
                config: json!({ "protocol": job.protocol }),
                flow_id: None,
                old_job_id: None,
                scheduler_party_id: job.scheduler_party_id.clone(),
                initiator_party_id: job.initiator_party_id.clone(),
            });

            let mut created = job.created_parties.clone();
            let mut unreachable = 0;
            let mut rejection: Option<String> = None;
            for (party_id, result) in self.federation.broadcast(&pending, &command).await {
                match result {
                    Ok(_) => created.push(party_id),
                    Err(e @ FederatedError::Application { .. }) => {
                        rejection = Some(format!("party {} rejected the job: {}", party_id, e));
                    }
                    Err(e) => {
                        warn!(
                            job_id = job.job_id,
                            party_id,
                            error = %e,
                            "Job not created yet, retrying next tick"
                        );
                        unreachable += 1;
                    }
                }
            }

            if created.len() != job.created_parties.len() {
                let mut update = ScheduleJobUpdate::new(&job.job_id);
                update.created_parties = Some(created);
                self.store.update_schedule_job(&update).await?;
            }
            if let Some(reason) = rejection {
                return self.cancel(job, JobStatus::Failed, &reason).await;
            }
            if unreachable > 0 {
                return Ok(());
            }
        }

        let running = self
            .store
            .query_schedule_jobs(&ScheduleJobFilter {
                statuses: vec![JobStatus::Running],
                ..Default::default()
            })
            .await?;
        if let Admission::Rejected(reason) =
            self.resources
                .admit(conf, &running, &self.config.job_defaults)
        {
            info!(job_id = job.job_id, reason, "Job waiting for resources");
            return Ok(());
        }

        let mut update = ScheduleJobUpdate::new(&job.job_id);
        update.expected_status = Some(JobStatus::Waiting);
        update.status = Some(JobStatus::Running);
        update.start_time = Some(Utc::now());
        if !self.store.update_schedule_job(&update).await? {
            info!(job_id = job.job_id, "Job left WAITING before it could start");
            return Ok(());
        }
        info!(job_id = job.job_id, "Job running");

        let command = FederatedCommand::StartJob(JobRef {
            job_id: job.job_id.clone(),
        });
        for (party_id, result) in self
            .federation
            .broadcast(&distinct_party_ids(&job.parties), &command)
            .await
        {
            if let Err(e) = result {
                warn!(job_id = job.job_id, party_id, error = %e, "Failed to start job on party");
            }
        }

        let job = self.api.get_job(&job.job_id).await?;
        self.schedule_running(&job, conf).await
    }

    async fn schedule_running(&self, job: &ScheduleJob, conf: &EffectiveJobConf) -> Result<()> {
        let mut tasks = self.api.latest_tasks(&job.job_id).await?;

        if conf.sync_type == SyncType::Poll && !tasks.is_empty() {
            self.sync_tasks(job, &tasks).await?;
            tasks = self.api.latest_tasks(&job.job_id).await?;
        }

        match self.handle_failures(job, conf, &tasks).await? {
            FailurePass::JobFailed => return Ok(()),
            FailurePass::Retried => tasks = self.api.latest_tasks(&job.job_id).await?,
            FailurePass::Clean => {}
        }

        if tasks.iter().all(|t| t.status == TaskStatus::Success) {
            return self.finish(job, JobStatus::Success, None).await;
        }

        if self.dispatch(job, conf, &tasks).await? {
            tasks = self.api.latest_tasks(&job.job_id).await?;
        }

        let progress = job_progress(&tasks);
        if progress != job.progress {
            let mut update = ScheduleJobUpdate::new(&job.job_id);
            update.progress = Some(progress);
            self.store.update_schedule_job(&update).await?;
        }
        Ok(())
    }

    /// Poll parties for in-flight tasks and record status changes.
    async fn sync_tasks(&self, job: &ScheduleJob, tasks: &[ScheduleTask]) -> Result<()> {
        let commands: Vec<(String, FederatedCommand)> = tasks
            .iter()
            .filter(|t| t.status.is_in_flight())
            .map(|t| {
                (
                    t.party_id.clone(),
                    FederatedCommand::PollTask(PollTaskRequest {
                        job_id: t.job_id.clone(),
                        task_id: t.task_id.clone(),
                        task_version: t.task_version,
                        role: t.role,
                        party_id: t.party_id.clone(),
                    }),
                )
            })
            .collect();

        for (party_id, command, result) in self.federation.send_all(commands).await {
            let FederatedCommand::PollTask(request) = command else {
                continue;
            };
            let reported = match result {
                Ok(envelope) => status_from(envelope.data),
                Err(e) => {
                    warn!(
                        job_id = job.job_id,
                        party_id,
                        task_id = request.task_id,
                        error = %e,
                        "Task status unknown this tick"
                    );
                    continue;
                }
            };
            let Some(reported) = reported else {
                continue;
            };
            let Some(row) = tasks.iter().find(|t| {
                t.task_id == request.task_id
                    && t.task_version == request.task_version
                    && t.role == request.role
                    && t.party_id == request.party_id
            }) else {
                continue;
            };
            self.record_task_status(row, reported, None).await?;
        }
        Ok(())
    }

    async fn record_task_status(
        &self,
        row: &ScheduleTask,
        status: TaskStatus,
        error_report: Option<String>,
    ) -> Result<bool> {
        match classify_transition(row.status, status) {
            Transition::NoOp => return Ok(false),
            Transition::Illegal => {
                warn!(
                    job_id = row.job_id,
                    task_id = row.task_id,
                    from = %row.status,
                    to = %status,
                    "Ignoring illegal task status report"
                );
                return Ok(false);
            }
            Transition::Advance => {}
        }

        let now = Utc::now();
        let mut update = ScheduleTaskUpdate::new(row.key());
        update.expected_status = Some(row.status);
        update.status = Some(status);
        update.error_report = error_report;
        if status == TaskStatus::Running && row.start_time.is_none() {
            update.start_time = Some(now);
        }
        if status.is_end() {
            update.end_time = Some(now);
            update.elapsed = elapsed_ms(row.start_time.or(update.start_time), now);
        }
        let changed = self.store.update_schedule_task(&update).await?;
        if changed {
            info!(
                job_id = row.job_id,
                task_id = row.task_id,
                task_version = row.task_version,
                role = %row.role,
                party_id = row.party_id,
                status = %status,
                "Task status synced"
            );
        }
        Ok(changed)
    }

    /// Retry failed tasks with budget left; fail the job when one has none.
    async fn handle_failures(
        &self,
        job: &ScheduleJob,
        conf: &EffectiveJobConf,
        tasks: &[ScheduleTask],
    ) -> Result<FailurePass> {
        let now = Utc::now();
        let delay = seconds(conf.auto_retry_delay);
        let mut pass = FailurePass::Clean;

        for (task_name, rows) in group_by_task(tasks) {
            let failed: Vec<&&ScheduleTask> =
                rows.iter().filter(|r| r.status == TaskStatus::Failed).collect();
            let Some(first) = failed.first() else {
                continue;
            };

            let budget = failed.iter().map(|r| r.auto_retries).min().unwrap_or(0);
            if budget <= 0 {
                let reason = format!(
                    "task {} failed on {} {}: {}",
                    task_name,
                    first.role,
                    first.party_id,
                    first.error_report.as_deref().unwrap_or("no error report")
                );
                self.cancel(job, JobStatus::Failed, &reason).await?;
                return Ok(FailurePass::JobFailed);
            }

            let failed_at = failed
                .iter()
                .map(|r| r.end_time.unwrap_or(r.update_time))
                .max()
                .unwrap_or(now);
            if now < failed_at + delay {
                debug!(job_id = job.job_id, task_name, "Waiting for retry delay");
                continue;
            }

            self.retry_task(job, task_name, &rows, budget - 1).await?;
            pass = FailurePass::Retried;
        }
        Ok(pass)
    }

    /// Stop the failed version everywhere and queue the next version.
    async fn retry_task(
        &self,
        job: &ScheduleJob,
        task_name: &str,
        rows: &[&ScheduleTask],
        remaining: i32,
    ) -> Result<()> {
        let next_version = rows.iter().map(|r| r.task_version).max().unwrap_or(0) + 1;

        let mut stops = Vec::new();
        for row in rows.iter().filter(|r| !r.status.is_end()) {
            self.record_task_status(row, TaskStatus::Failed, Some("superseded by retry".to_string()))
                .await?;
            stops.push((
                row.party_id.clone(),
                FederatedCommand::StopJob(StopJobRequest {
                    job_id: job.job_id.clone(),
                    task_name: Some(task_name.to_string()),
                    stop_status: None,
                }),
            ));
        }
        for (party_id, _, result) in self.federation.send_all(stops).await {
            if let Err(e) = result {
                warn!(job_id = job.job_id, party_id, task_name, error = %e, "Failed to stop superseded task");
            }
        }

        let now = Utc::now();
        for row in rows {
            let retry = ScheduleTask {
                task_version: next_version,
                status: TaskStatus::Pending,
                auto_retries: remaining,
                error_report: None,
                create_time: now,
                update_time: now,
                start_time: None,
                end_time: None,
                elapsed: None,
                ..(*row).clone()
            };
            self.store.create_schedule_task(&retry).await?;
        }

        info!(
            job_id = job.job_id,
            task_name,
            task_version = next_version,
            auto_retries = remaining,
            "Task queued for automatic retry"
        );
        Ok(())
    }

    /// Start every task whose upstream succeeded, up to the parallelism ceiling.
    ///
    /// Returns whether any start command was sent.
    async fn dispatch(
        &self,
        job: &ScheduleJob,
        conf: &EffectiveJobConf,
        tasks: &[ScheduleTask],
    ) -> Result<bool> {
        let parsed = dag_parser::parse_value(&job.dag)?;
        let groups = group_by_task(tasks);

        let in_flight = groups
            .values()
            .filter(|rows| rows.iter().any(|r| r.status.is_in_flight()))
            .count();
        let mut slots = (conf.task_parallelism as usize).saturating_sub(in_flight);

        let mut commands = Vec::new();
        for name in parsed.graph.topological_order() {
            let Some(rows) = groups.get(name.as_str()) else {
                continue;
            };
            let pending: Vec<&ScheduleTask> = rows
                .iter()
                .copied()
                .filter(|r| r.status == TaskStatus::Pending)
                .collect();
            if pending.is_empty() {
                continue;
            }
            // Parties that missed an earlier start get it again without taking a new slot.
            let started = pending.len() < rows.len();
            if !started && slots == 0 {
                continue;
            }
            let ready = parsed.graph.dependencies(name).map_or(true, |deps| {
                deps.iter().all(|d| {
                    groups
                        .get(d.as_str())
                        .map_or(true, |upstream| aggregate_status(upstream) == TaskStatus::Success)
                })
            });
            if !ready {
                continue;
            }

            for row in pending {
                commands.push((
                    row.party_id.clone(),
                    FederatedCommand::StartTask(StartTaskRequest {
                        job_id: row.job_id.clone(),
                        task_id: row.task_id.clone(),
                        task_name: row.task_name.clone(),
                        task_version: row.task_version,
                        role: row.role,
                        party_id: row.party_id.clone(),
                    }),
                ));
            }
            if !started {
                slots -= 1;
            }
        }

        if commands.is_empty() {
            return Ok(false);
        }

        for (party_id, command, result) in self.federation.send_all(commands).await {
            let FederatedCommand::StartTask(request) = command else {
                continue;
            };
            let Some(row) = tasks.iter().find(|t| {
                t.task_id == request.task_id
                    && t.task_version == request.task_version
                    && t.role == request.role
                    && t.party_id == request.party_id
            }) else {
                continue;
            };
            match result {
                Ok(envelope) => {
                    let status = status_from(envelope.data).unwrap_or(TaskStatus::Ready);
                    info!(
                        job_id = job.job_id,
                        task_id = request.task_id,
                        task_version = request.task_version,
                        party_id,
                        status = %status,
                        "Task dispatched"
                    );
                    self.record_task_status(row, status, None).await?;
                }
                Err(e) => {
                    warn!(
                        job_id = job.job_id,
                        task_id = request.task_id,
                        party_id,
                        error = %e,
                        "Task start not acknowledged, retrying next tick"
                    );
                }
            }
        }
        Ok(true)
    }

    /// Stop every party, fail what is unfinished and end the job.
    ///
    /// The job ends even when some parties cannot be reached.
    async fn cancel(&self, job: &ScheduleJob, stop_status: JobStatus, reason: &str) -> Result<()> {
        info!(job_id = job.job_id, status = %stop_status, reason, "Stopping job");

        let command = FederatedCommand::StopJob(StopJobRequest {
            job_id: job.job_id.clone(),
            task_name: None,
            stop_status: Some(stop_status),
        });
        let party_ids = distinct_party_ids(&job.parties);
        for (party_id, result) in self.federation.broadcast(&party_ids, &command).await {
            if let Err(e) = result {
                warn!(job_id = job.job_id, party_id, error = %e, "Stop not delivered");
            }
        }

        for row in self.api.latest_tasks(&job.job_id).await? {
            if !row.status.is_end() {
                self.record_task_status(&row, TaskStatus::Failed, Some(reason.to_string()))
                    .await?;
            }
        }

        self.finish(job, stop_status, Some(reason.to_string())).await
    }

    /// End bookkeeping and final status confirmation to every party.
    async fn finish(
        &self,
        job: &ScheduleJob,
        status: JobStatus,
        message: Option<String>,
    ) -> Result<()> {
        let now = Utc::now();
        let tasks = self.api.latest_tasks(&job.job_id).await?;

        let mut update = ScheduleJobUpdate::new(&job.job_id);
        update.expected_status = Some(job.status);
        update.status = Some(status);
        update.progress = Some(if status == JobStatus::Success {
            100
        } else {
            job_progress(&tasks)
        });
        update.schedule_signal = Some(false);
        update.end_time = Some(now);
        update.elapsed = elapsed_ms(job.start_time.or(Some(now)), now);
        update.error_message = message;
        if status != JobStatus::Success {
            update.status_code = Some(types::ReturnCode::Exception.code());
        }

        if !self.store.update_schedule_job(&update).await? {
            info!(job_id = job.job_id, "Job changed before it could finish");
            return Ok(());
        }
        info!(job_id = job.job_id, status = %status, "Job finished");

        let command = FederatedCommand::AuditConfirm(AuditConfirmRequest {
            job_id: job.job_id.clone(),
            status: status.to_string(),
        });
        for (party_id, result) in self
            .federation
            .broadcast(&distinct_party_ids(&job.parties), &command)
            .await
        {
            if let Err(e) = result {
                warn!(job_id = job.job_id, party_id, error = %e, "Final status not confirmed by party");
            }
        }
        Ok(())
    }

    /// New versions for the requested tasks and everything downstream, then back to WAITING.
    async fn rerun(&self, job: ScheduleJob) -> Result<()> {
        if !self.acquire_signal(&job).await? {
            return Ok(());
        }
        let result = self.prepare_rerun(&job).await;
        if let Err(e) = self.release_signal(&job.job_id).await {
            warn!(job_id = job.job_id, error = %e, "Failed to release schedule signal");
        }
        result
    }

    async fn prepare_rerun(&self, job: &ScheduleJob) -> Result<()> {
        let parsed = dag_parser::parse_value(&job.dag)?;
        let tasks = self.api.latest_tasks(&job.job_id).await?;
        let groups = group_by_task(&tasks);

        let requested: Vec<String> = if job.rerun_tasks.is_empty() {
            groups
                .iter()
                .filter(|(_, rows)| aggregate_status(rows) != TaskStatus::Success)
                .map(|(name, _)| name.to_string())
                .collect()
        } else {
            job.rerun_tasks.clone()
        };
        let targets = parsed.graph.downstream_closure(&requested);

        if targets.is_empty() {
            let mut update = ScheduleJobUpdate::new(&job.job_id);
            update.rerun_signal = Some(false);
            update.rerun_tasks = Some(Vec::new());
            self.store.update_schedule_job(&update).await?;
            info!(job_id = job.job_id, "Nothing to rerun");
            return Ok(());
        }

        let conf = job_conf(job, &self.config.job_defaults);
        let now = Utc::now();
        for name in &targets {
            let Some(rows) = groups.get(name.as_str()) else {
                continue;
            };
            let next_version = rows.iter().map(|r| r.task_version).max().unwrap_or(0) + 1;
            for row in rows {
                let rerun = ScheduleTask {
                    task_version: next_version,
                    status: TaskStatus::Pending,
                    auto_retries: conf.auto_retries as i32,
                    error_report: None,
                    create_time: now,
                    update_time: now,
                    start_time: None,
                    end_time: None,
                    elapsed: None,
                    ..(*row).clone()
                };
                self.store.create_schedule_task(&rerun).await?;
            }
        }

        let mut update = ScheduleJobUpdate::new(&job.job_id);
        update.expected_status = Some(job.status);
        update.status = Some(JobStatus::Waiting);
        update.rerun = true;
        update.rerun_signal = Some(false);
        update.rerun_tasks = Some(Vec::new());
        update.cancel_signal = Some(false);
        update.status_code = Some(0);
        update.progress = Some(job_progress(&self.api.latest_tasks(&job.job_id).await?));
        if !self.store.update_schedule_job(&update).await? {
            warn!(job_id = job.job_id, "Job changed while preparing rerun");
            return Ok(());
        }
        info!(job_id = job.job_id, tasks = ?targets, "Job rerun");

        let command = FederatedCommand::RerunJob(JobRef {
            job_id: job.job_id.clone(),
        });
        for (party_id, result) in self
            .federation
            .broadcast(&distinct_party_ids(&job.parties), &command)
            .await
        {
            if let Err(e) = result {
                warn!(job_id = job.job_id, party_id, error = %e, "Rerun not delivered");
            }
        }
        Ok(())
    }
}

fn seconds(secs: u64) -> ChronoDuration {
    ChronoDuration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
}

fn status_from(data: Option<serde_json::Value>) -> Option<TaskStatus> {
    data.and_then(|d| serde_json::from_value::<TaskStatusData>(d).ok())
        .map(|d| d.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::Role;

    fn row(task_name: &str, role: Role, party_id: &str, status: TaskStatus) -> ScheduleTask {
        let now = Utc::now();
        ScheduleTask {
            job_id: "j".to_string(),
            role,
            party_id: party_id.to_string(),
            task_name: task_name.to_string(),
            component: "c".to_string(),
            task_id: format!("j_{}", task_name),
            task_version: 1,
            status,
            auto_retries: 0,
            error_report: None,
            create_time: now,
            update_time: now,
            start_time: None,
            end_time: None,
            elapsed: None,
        }
    }

    #[test]
    fn test_progress_is_minimum_over_parties() {
        let tasks = vec![
            row("a", Role::Guest, "9999", TaskStatus::Success),
            row("b", Role::Guest, "9999", TaskStatus::Success),
            row("a", Role::Host, "10000", TaskStatus::Success),
            row("b", Role::Host, "10000", TaskStatus::Running),
        ];
        assert_eq!(job_progress(&tasks), 50);
        assert_eq!(job_progress(&[]), 100);
    }

    #[test]
    fn test_aggregate_status() {
        let success = row("a", Role::Guest, "9999", TaskStatus::Success);
        let running = row("a", Role::Host, "10000", TaskStatus::Running);
        let failed = row("a", Role::Host, "10000", TaskStatus::Failed);
        assert_eq!(aggregate_status(&[&success, &success]), TaskStatus::Success);
        assert_eq!(aggregate_status(&[&success, &running]), TaskStatus::Running);
        assert_eq!(aggregate_status(&[&running, &failed]), TaskStatus::Failed);
    }
}
