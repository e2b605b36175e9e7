use async_trait::async_trait;
use types::{
    check_rerun_transition, classify_transition, Job, JobFilter, JobStatus, JobUpdate,
    ScheduleJob, ScheduleJobFilter, ScheduleJobUpdate, ScheduleTask, ScheduleTaskFilter,
    ScheduleTaskUpdate, StatusMachine, Task, TaskFilter, TaskUpdate, Transition,
};

use crate::error::{StoreError, StoreResult};

/// Database connection trait
#[async_trait]
pub trait Database: Send + Sync {
    async fn health_check(&self) -> bool;
    async fn close(&self);
}

/// Party-local jobs and tasks.
///
/// Updates return `Ok(false)` when no row changed: the row is absent, the
/// optimistic filter did not match, or nothing but a same-status no-op was
/// requested. Illegal transitions are rejected before any row is touched.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> StoreResult<()>;
    async fn update_job(&self, update: &JobUpdate) -> StoreResult<bool>;
    async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;

    async fn create_task(&self, task: &Task) -> StoreResult<()>;
    async fn update_task(&self, update: &TaskUpdate) -> StoreResult<bool>;
    async fn query_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>>;
}

/// Scheduler-side shadow records.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create_schedule_job(&self, job: &ScheduleJob) -> StoreResult<()>;
    async fn update_schedule_job(&self, update: &ScheduleJobUpdate) -> StoreResult<bool>;
    async fn query_schedule_jobs(&self, filter: &ScheduleJobFilter) -> StoreResult<Vec<ScheduleJob>>;

    async fn create_schedule_task(&self, task: &ScheduleTask) -> StoreResult<()>;
    async fn update_schedule_task(&self, update: &ScheduleTaskUpdate) -> StoreResult<bool>;
    async fn query_schedule_tasks(
        &self,
        filter: &ScheduleTaskFilter,
    ) -> StoreResult<Vec<ScheduleTask>>;
}

/// Validate a requested status against the stored one.
///
/// Returns the status to write: `None` for a same-status no-op.
pub fn validate_status<S: StatusMachine>(current: S, requested: Option<S>) -> StoreResult<Option<S>> {
    match requested {
        None => Ok(None),
        Some(next) => match classify_transition(current, next) {
            Transition::Advance => Ok(Some(next)),
            Transition::NoOp => Ok(None),
            Transition::Illegal => Err(StoreError::illegal(current, next)),
        },
    }
}

/// Job variant of [`validate_status`] that also honours rerun re-entry.
pub fn validate_job_status(
    current: JobStatus,
    requested: Option<JobStatus>,
    rerun: bool,
) -> StoreResult<Option<JobStatus>> {
    match requested {
        Some(next) if rerun && check_rerun_transition(current, next) => Ok(Some(next)),
        _ => validate_status(current, requested),
    }
}

/// Whether an update sets anything besides its status fields.
pub trait HasFieldChanges {
    fn has_field_changes(&self) -> bool;
}

macro_rules! impl_has_changes {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl HasFieldChanges for $ty {
            fn has_field_changes(&self) -> bool {
                false $(|| self.$field.is_some())+
            }
        }
    };
}

impl_has_changes!(JobUpdate {
    status_code,
    progress,
    error_message,
    start_time,
    end_time,
    elapsed,
});

impl_has_changes!(ScheduleJobUpdate {
    status_code,
    progress,
    schedule_signal,
    schedule_time,
    cancel_signal,
    cancel_time,
    stop_status,
    rerun_signal,
    rerun_tasks,
    created_parties,
    error_message,
    start_time,
    end_time,
    elapsed,
});

impl_has_changes!(TaskUpdate {
    worker_id,
    run_pid,
    run_ip,
    error_report,
    start_time,
    end_time,
    elapsed,
});

impl_has_changes!(ScheduleTaskUpdate {
    auto_retries,
    error_report,
    start_time,
    end_time,
    elapsed,
});
