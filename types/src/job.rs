use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::party::{Party, Role};
use crate::status::JobStatus;

pub const DEFAULT_PROTOCOL: &str = "fate";

/// Identity of a party-local job row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub job_id: String,
    pub role: Role,
    pub party_id: String,
}

impl JobKey {
    pub fn new(job_id: impl Into<String>, role: Role, party_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            role,
            party_id: party_id.into(),
        }
    }
}

/// A federated job as seen by one party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub role: Role,
    pub party_id: String,
    pub protocol: String,
    pub dag: serde_json::Value,
    pub parties: Vec<Party>,
    pub initiator_party_id: String,
    pub scheduler_party_id: String,
    pub status: JobStatus,
    pub status_code: i32,
    pub progress: i32,
    pub priority: i32,
    pub error_message: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Milliseconds between start and end.
    pub elapsed: Option<i64>,
}

impl Job {
    pub fn key(&self) -> JobKey {
        JobKey::new(self.job_id.clone(), self.role, self.party_id.clone())
    }

    pub fn party(&self) -> Party {
        Party::new(self.role, self.party_id.clone())
    }
}

/// Partial update of a party-local job.
#[derive(Debug, Clone)]
pub struct JobUpdate {
    pub key: JobKey,
    /// Optimistic filter: only rows currently in this status are touched.
    pub expected_status: Option<JobStatus>,
    pub status: Option<JobStatus>,
    /// Allows an end status to re-enter WAITING.
    pub rerun: bool,
    pub status_code: Option<i32>,
    pub progress: Option<i32>,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

impl JobUpdate {
    pub fn new(key: JobKey) -> Self {
        Self {
            key,
            expected_status: None,
            status: None,
            rerun: false,
            status_code: None,
            progress: None,
            error_message: None,
            start_time: None,
            end_time: None,
            elapsed: None,
        }
    }
}

/// Scheduler-side shadow of a job, aggregated across all parties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJob {
    pub job_id: String,
    pub protocol: String,
    pub dag: serde_json::Value,
    pub parties: Vec<Party>,
    pub initiator_party_id: String,
    pub scheduler_party_id: String,
    pub status: JobStatus,
    pub status_code: i32,
    pub progress: i32,
    pub priority: i32,
    pub schedule_signal: bool,
    pub schedule_time: Option<DateTime<Utc>>,
    pub cancel_signal: bool,
    pub cancel_time: Option<DateTime<Utc>>,
    /// Terminal status requested together with the cancel signal.
    pub stop_status: Option<JobStatus>,
    pub rerun_signal: bool,
    /// Task names requested for rerun; empty means every non-SUCCESS task.
    pub rerun_tasks: Vec<String>,
    /// Party ids that acknowledged `create_job`.
    pub created_parties: Vec<String>,
    pub error_message: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ScheduleJobUpdate {
    pub job_id: String,
    pub expected_status: Option<JobStatus>,
    pub expected_schedule_signal: Option<bool>,
    pub expected_schedule_time: Option<DateTime<Utc>>,
    pub status: Option<JobStatus>,
    pub rerun: bool,
    pub status_code: Option<i32>,
    pub progress: Option<i32>,
    pub schedule_signal: Option<bool>,
    pub schedule_time: Option<DateTime<Utc>>,
    pub cancel_signal: Option<bool>,
    pub cancel_time: Option<DateTime<Utc>>,
    pub stop_status: Option<JobStatus>,
    pub rerun_signal: Option<bool>,
    pub rerun_tasks: Option<Vec<String>>,
    pub created_parties: Option<Vec<String>>,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

impl ScheduleJobUpdate {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            expected_status: None,
            expected_schedule_signal: None,
            expected_schedule_time: None,
            status: None,
            rerun: false,
            status_code: None,
            progress: None,
            schedule_signal: None,
            schedule_time: None,
            cancel_signal: None,
            cancel_time: None,
            stop_status: None,
            rerun_signal: None,
            rerun_tasks: None,
            created_parties: None,
            error_message: None,
            start_time: None,
            end_time: None,
            elapsed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderBy {
    #[default]
    CreateTimeAsc,
    /// Higher priority first, earlier submissions first within a priority.
    PriorityThenCreateTime,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_id: Option<String>,
    pub role: Option<Role>,
    pub party_id: Option<String>,
    /// Empty matches any status.
    pub statuses: Vec<JobStatus>,
    pub protocol: Option<String>,
    pub order_by: OrderBy,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    pub fn by_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.job_id.as_ref().map_or(true, |v| *v == job.job_id)
            && self.role.map_or(true, |v| v == job.role)
            && self.party_id.as_ref().map_or(true, |v| *v == job.party_id)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.protocol.as_ref().map_or(true, |v| *v == job.protocol)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleJobFilter {
    pub job_id: Option<String>,
    pub statuses: Vec<JobStatus>,
    pub protocol: Option<String>,
    pub cancel_signal: Option<bool>,
    pub rerun_signal: Option<bool>,
    pub order_by: OrderBy,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ScheduleJobFilter {
    pub fn by_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &ScheduleJob) -> bool {
        self.job_id.as_ref().map_or(true, |v| *v == job.job_id)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.protocol.as_ref().map_or(true, |v| *v == job.protocol)
            && self.cancel_signal.map_or(true, |v| v == job.cancel_signal)
            && self.rerun_signal.map_or(true, |v| v == job.rerun_signal)
    }
}

/// Milliseconds between two instants, never negative.
pub fn elapsed_ms(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<i64> {
    start.map(|s| (end - s).num_milliseconds().max(0))
}
