/// In-memory implementations for testing without database connections
///
/// These follow the same rules as the Postgres stores: optimistic filters,
/// transition validation, duplicate detection and latest-version queries.
use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::database::{
    validate_job_status, validate_status, HasFieldChanges, JobStore, ScheduleStore,
};
use scheduler_core::error::{StoreError, StoreResult};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use types::{
    retain_latest, Job, JobFilter, JobUpdate, OrderBy, ScheduleJob, ScheduleJobFilter,
    ScheduleJobUpdate, ScheduleTask, ScheduleTaskFilter, ScheduleTaskUpdate, Task, TaskFilter,
    TaskUpdate,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn page<T>(rows: Vec<T>, limit: Option<usize>, offset: usize) -> Vec<T> {
    rows.into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect()
}

fn fail_if_set(write_error: &Mutex<Option<String>>) -> StoreResult<()> {
    match lock(write_error).as_ref() {
        Some(message) => Err(StoreError::Database(message.clone())),
        None => Ok(()),
    }
}

/// Party-local jobs and tasks held in memory.
#[derive(Clone, Default)]
pub struct MockJobStore {
    jobs: Arc<Mutex<Vec<Job>>>,
    tasks: Arc<Mutex<Vec<Task>>>,
    write_error: Arc<Mutex<Option<String>>>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a database error until cleared with `None`.
    pub fn set_write_error(&self, message: Option<&str>) {
        *lock(&self.write_error) = message.map(|m| m.to_string());
    }

    pub fn get_all_jobs(&self) -> Vec<Job> {
        lock(&self.jobs).clone()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        lock(&self.tasks).clone()
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn create_job(&self, job: &Job) -> StoreResult<()> {
        fail_if_set(&self.write_error)?;
        let mut jobs = lock(&self.jobs);
        if jobs.iter().any(|j| j.key() == job.key()) {
            return Err(StoreError::Duplicate(format!(
                "job {} {} {}",
                job.job_id, job.role, job.party_id
            )));
        }
        jobs.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, update: &JobUpdate) -> StoreResult<bool> {
        fail_if_set(&self.write_error)?;
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.iter_mut().find(|j| j.key() == update.key) else {
            return Ok(false);
        };
        if update.expected_status.map_or(false, |expected| expected != job.status) {
            return Ok(false);
        }
        let next = validate_job_status(job.status, update.status, update.rerun)?;
        if next.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        if let Some(status) = next {
            job.status = status;
        }
        if let Some(status_code) = update.status_code {
            job.status_code = status_code;
        }
        if let Some(progress) = update.progress {
            job.progress = progress;
        }
        if let Some(ref error_message) = update.error_message {
            job.error_message = Some(error_message.clone());
        }
        if update.start_time.is_some() {
            job.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            job.end_time = update.end_time;
        }
        if update.elapsed.is_some() {
            job.elapsed = update.elapsed;
        }
        job.update_time = Utc::now();
        Ok(true)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let mut rows: Vec<Job> = lock(&self.jobs)
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        match filter.order_by {
            OrderBy::CreateTimeAsc => rows.sort_by_key(|j| j.create_time),
            OrderBy::PriorityThenCreateTime => {
                rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.create_time.cmp(&b.create_time)))
            }
        }
        Ok(page(rows, filter.limit, filter.offset))
    }

    async fn create_task(&self, task: &Task) -> StoreResult<()> {
        fail_if_set(&self.write_error)?;
        let mut tasks = lock(&self.tasks);
        if tasks.iter().any(|t| t.key() == task.key()) {
            return Err(StoreError::Duplicate(format!(
                "task {} v{} {} {}",
                task.task_id, task.task_version, task.role, task.party_id
            )));
        }
        tasks.push(task.clone());
        Ok(())
    }

    async fn update_task(&self, update: &TaskUpdate) -> StoreResult<bool> {
        fail_if_set(&self.write_error)?;
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.iter_mut().find(|t| t.key() == update.key) else {
            return Ok(false);
        };
        if update
            .expected_party_status
            .map_or(false, |expected| expected != task.party_status)
        {
            return Ok(false);
        }
        let next_status = validate_status(task.status, update.status)?;
        let next_party_status = validate_status(task.party_status, update.party_status)?;
        if next_status.is_none() && next_party_status.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        if let Some(status) = next_status {
            task.status = status;
        }
        if let Some(party_status) = next_party_status {
            task.party_status = party_status;
        }
        if let Some(ref worker_id) = update.worker_id {
            task.worker_id = Some(worker_id.clone());
        }
        if update.run_pid.is_some() {
            task.run_pid = update.run_pid;
        }
        if let Some(ref run_ip) = update.run_ip {
            task.run_ip = Some(run_ip.clone());
        }
        if let Some(ref error_report) = update.error_report {
            task.error_report = Some(error_report.clone());
        }
        if update.start_time.is_some() {
            task.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            task.end_time = update.end_time;
        }
        if update.elapsed.is_some() {
            task.elapsed = update.elapsed;
        }
        task.update_time = Utc::now();
        Ok(true)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>> {
        let mut rows = lock(&self.tasks).clone();
        if filter.only_latest {
            rows = retain_latest(rows, |t| {
                (t.task_id.clone(), t.role, t.party_id.clone(), t.task_version)
            });
        }
        let mut rows: Vec<_> = rows.into_iter().filter(|t| filter.matches(t)).collect();
        rows.sort_by_key(|t| (t.create_time, t.task_version));
        Ok(page(rows, filter.limit, filter.offset))
    }
}

/// Scheduler-side records held in memory.
#[derive(Clone, Default)]
pub struct MockScheduleStore {
    jobs: Arc<Mutex<Vec<ScheduleJob>>>,
    tasks: Arc<Mutex<Vec<ScheduleTask>>>,
    write_error: Arc<Mutex<Option<String>>>,
}

impl MockScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a database error until cleared with `None`.
    pub fn set_write_error(&self, message: Option<&str>) {
        *lock(&self.write_error) = message.map(|m| m.to_string());
    }

    pub fn get_all_jobs(&self) -> Vec<ScheduleJob> {
        lock(&self.jobs).clone()
    }

    pub fn get_all_tasks(&self) -> Vec<ScheduleTask> {
        lock(&self.tasks).clone()
    }
}

#[async_trait]
impl ScheduleStore for MockScheduleStore {
    async fn create_schedule_job(&self, job: &ScheduleJob) -> StoreResult<()> {
        fail_if_set(&self.write_error)?;
        let mut jobs = lock(&self.jobs);
        if jobs.iter().any(|j| j.job_id == job.job_id) {
            return Err(StoreError::Duplicate(format!("schedule job {}", job.job_id)));
        }
        jobs.push(job.clone());
        Ok(())
    }

    async fn update_schedule_job(&self, update: &ScheduleJobUpdate) -> StoreResult<bool> {
        fail_if_set(&self.write_error)?;
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.iter_mut().find(|j| j.job_id == update.job_id) else {
            return Ok(false);
        };
        if update.expected_status.map_or(false, |expected| expected != job.status)
            || update
                .expected_schedule_signal
                .map_or(false, |expected| expected != job.schedule_signal)
            || update
                .expected_schedule_time
                .map_or(false, |expected| Some(expected) != job.schedule_time)
        {
            return Ok(false);
        }
        let next = validate_job_status(job.status, update.status, update.rerun)?;
        if next.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        if let Some(status) = next {
            job.status = status;
        }
        if let Some(status_code) = update.status_code {
            job.status_code = status_code;
        }
        if let Some(progress) = update.progress {
            job.progress = progress;
        }
        if let Some(schedule_signal) = update.schedule_signal {
            job.schedule_signal = schedule_signal;
        }
        if update.schedule_time.is_some() {
            job.schedule_time = update.schedule_time;
        }
        if let Some(cancel_signal) = update.cancel_signal {
            job.cancel_signal = cancel_signal;
        }
        if update.cancel_time.is_some() {
            job.cancel_time = update.cancel_time;
        }
        if update.stop_status.is_some() {
            job.stop_status = update.stop_status;
        }
        if let Some(rerun_signal) = update.rerun_signal {
            job.rerun_signal = rerun_signal;
        }
        if let Some(ref rerun_tasks) = update.rerun_tasks {
            job.rerun_tasks = rerun_tasks.clone();
        }
        if let Some(ref created_parties) = update.created_parties {
            job.created_parties = created_parties.clone();
        }
        if let Some(ref error_message) = update.error_message {
            job.error_message = Some(error_message.clone());
        }
        if update.start_time.is_some() {
            job.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            job.end_time = update.end_time;
        }
        if update.elapsed.is_some() {
            job.elapsed = update.elapsed;
        }
        job.update_time = Utc::now();
        Ok(true)
    }

    async fn query_schedule_jobs(&self, filter: &ScheduleJobFilter) -> StoreResult<Vec<ScheduleJob>> {
        let mut rows: Vec<ScheduleJob> = lock(&self.jobs)
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        match filter.order_by {
            OrderBy::CreateTimeAsc => rows.sort_by_key(|j| j.create_time),
            OrderBy::PriorityThenCreateTime => {
                rows.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.create_time.cmp(&b.create_time)))
            }
        }
        Ok(page(rows, filter.limit, filter.offset))
    }

    async fn create_schedule_task(&self, task: &ScheduleTask) -> StoreResult<()> {
        fail_if_set(&self.write_error)?;
        let mut tasks = lock(&self.tasks);
        if tasks.iter().any(|t| t.key() == task.key()) {
            return Err(StoreError::Duplicate(format!(
                "schedule task {} v{} {} {}",
                task.task_id, task.task_version, task.role, task.party_id
            )));
        }
        tasks.push(task.clone());
        Ok(())
    }

    async fn update_schedule_task(&self, update: &ScheduleTaskUpdate) -> StoreResult<bool> {
        fail_if_set(&self.write_error)?;
        let mut tasks = lock(&self.tasks);
        let Some(task) = tasks.iter_mut().find(|t| t.key() == update.key) else {
            return Ok(false);
        };
        if update.expected_status.map_or(false, |expected| expected != task.status) {
            return Ok(false);
        }
        let next = validate_status(task.status, update.status)?;
        if next.is_none() && !update.has_field_changes() {
            return Ok(false);
        }

        if let Some(status) = next {
            task.status = status;
        }
        if let Some(auto_retries) = update.auto_retries {
            task.auto_retries = auto_retries;
        }
        if let Some(ref error_report) = update.error_report {
            task.error_report = Some(error_report.clone());
        }
        if update.start_time.is_some() {
            task.start_time = update.start_time;
        }
        if update.end_time.is_some() {
            task.end_time = update.end_time;
        }
        if update.elapsed.is_some() {
            task.elapsed = update.elapsed;
        }
        task.update_time = Utc::now();
        Ok(true)
    }

    async fn query_schedule_tasks(
        &self,
        filter: &ScheduleTaskFilter,
    ) -> StoreResult<Vec<ScheduleTask>> {
        let mut rows = lock(&self.tasks).clone();
        if filter.only_latest {
            rows = retain_latest(rows, |t| {
                (t.task_id.clone(), t.role, t.party_id.clone(), t.task_version)
            });
        }
        let mut rows: Vec<_> = rows.into_iter().filter(|t| filter.matches(t)).collect();
        rows.sort_by_key(|t| (t.create_time, t.task_version));
        Ok(page(rows, filter.limit, filter.offset))
    }
}
