use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::party::{Party, Role};
use crate::status::TaskStatus;

pub const INITIAL_TASK_VERSION: i32 = 1;

/// Stable task identity across reruns.
pub fn task_id_for(job_id: &str, task_name: &str) -> String {
    format!("{}_{}", job_id, task_name)
}

/// Composite key of one task row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub job_id: String,
    pub task_id: String,
    pub task_version: i32,
    pub role: Role,
    pub party_id: String,
}

/// One DAG node instantiated for one party.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub job_id: String,
    pub role: Role,
    pub party_id: String,
    pub task_name: String,
    pub component: String,
    pub task_id: String,
    pub task_version: i32,
    /// Status as last decided by the scheduler.
    pub status: TaskStatus,
    /// Local execution status.
    pub party_status: TaskStatus,
    pub parameters: serde_json::Value,
    pub inputs: serde_json::Value,
    pub conf: serde_json::Value,
    pub dependencies: Vec<String>,
    pub worker_id: Option<String>,
    pub run_pid: Option<i32>,
    pub run_ip: Option<String>,
    pub error_report: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

impl Task {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            job_id: self.job_id.clone(),
            task_id: self.task_id.clone(),
            task_version: self.task_version,
            role: self.role,
            party_id: self.party_id.clone(),
        }
    }

    pub fn party(&self) -> Party {
        Party::new(self.role, self.party_id.clone())
    }
}

#[derive(Debug, Clone)]
pub struct TaskUpdate {
    pub key: TaskKey,
    /// Optimistic filter on `party_status`.
    pub expected_party_status: Option<TaskStatus>,
    pub status: Option<TaskStatus>,
    pub party_status: Option<TaskStatus>,
    pub worker_id: Option<String>,
    pub run_pid: Option<i32>,
    pub run_ip: Option<String>,
    pub error_report: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

impl TaskUpdate {
    pub fn new(key: TaskKey) -> Self {
        Self {
            key,
            expected_party_status: None,
            status: None,
            party_status: None,
            worker_id: None,
            run_pid: None,
            run_ip: None,
            error_report: None,
            start_time: None,
            end_time: None,
            elapsed: None,
        }
    }
}

/// Scheduler-side record of one party's execution of a task version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleTask {
    pub job_id: String,
    pub role: Role,
    pub party_id: String,
    pub task_name: String,
    pub component: String,
    pub task_id: String,
    pub task_version: i32,
    pub status: TaskStatus,
    /// Remaining automatic retries.
    pub auto_retries: i32,
    pub error_report: Option<String>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

impl ScheduleTask {
    pub fn key(&self) -> TaskKey {
        TaskKey {
            job_id: self.job_id.clone(),
            task_id: self.task_id.clone(),
            task_version: self.task_version,
            role: self.role,
            party_id: self.party_id.clone(),
        }
    }

    pub fn party(&self) -> Party {
        Party::new(self.role, self.party_id.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleTaskUpdate {
    pub key: TaskKey,
    pub expected_status: Option<TaskStatus>,
    pub status: Option<TaskStatus>,
    pub auto_retries: Option<i32>,
    pub error_report: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub elapsed: Option<i64>,
}

impl ScheduleTaskUpdate {
    pub fn new(key: TaskKey) -> Self {
        Self {
            key,
            expected_status: None,
            status: None,
            auto_retries: None,
            error_report: None,
            start_time: None,
            end_time: None,
            elapsed: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub job_id: Option<String>,
    pub role: Option<Role>,
    pub party_id: Option<String>,
    pub task_name: Option<String>,
    pub task_id: Option<String>,
    pub task_version: Option<i32>,
    pub statuses: Vec<TaskStatus>,
    pub party_statuses: Vec<TaskStatus>,
    /// Keep only the highest version per (task_id, role, party_id).
    pub only_latest: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl TaskFilter {
    pub fn by_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn by_key(key: &TaskKey) -> Self {
        Self {
            job_id: Some(key.job_id.clone()),
            task_id: Some(key.task_id.clone()),
            task_version: Some(key.task_version),
            role: Some(key.role),
            party_id: Some(key.party_id.clone()),
            ..Default::default()
        }
    }

    /// Every predicate except `only_latest` and pagination.
    pub fn matches(&self, task: &Task) -> bool {
        self.job_id.as_ref().map_or(true, |v| *v == task.job_id)
            && self.role.map_or(true, |v| v == task.role)
            && self.party_id.as_ref().map_or(true, |v| *v == task.party_id)
            && self.task_name.as_ref().map_or(true, |v| *v == task.task_name)
            && self.task_id.as_ref().map_or(true, |v| *v == task.task_id)
            && self.task_version.map_or(true, |v| v == task.task_version)
            && (self.statuses.is_empty() || self.statuses.contains(&task.status))
            && (self.party_statuses.is_empty() || self.party_statuses.contains(&task.party_status))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScheduleTaskFilter {
    pub job_id: Option<String>,
    pub role: Option<Role>,
    pub party_id: Option<String>,
    pub task_name: Option<String>,
    pub task_id: Option<String>,
    pub task_version: Option<i32>,
    pub statuses: Vec<TaskStatus>,
    pub only_latest: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl ScheduleTaskFilter {
    pub fn latest_for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            only_latest: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &ScheduleTask) -> bool {
        self.job_id.as_ref().map_or(true, |v| *v == task.job_id)
            && self.role.map_or(true, |v| v == task.role)
            && self.party_id.as_ref().map_or(true, |v| *v == task.party_id)
            && self.task_name.as_ref().map_or(true, |v| *v == task.task_name)
            && self.task_id.as_ref().map_or(true, |v| *v == task.task_id)
            && self.task_version.map_or(true, |v| v == task.task_version)
            && (self.statuses.is_empty() || self.statuses.contains(&task.status))
    }
}

/// Reduce rows to the highest version per (task_id, role, party_id),
/// keeping the input order of the survivors.
pub fn retain_latest<T, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> (String, Role, String, i32),
{
    let mut latest: std::collections::HashMap<(String, Role, String), i32> =
        std::collections::HashMap::new();
    for row in &rows {
        let (task_id, role, party_id, version) = key(row);
        let entry = latest.entry((task_id, role, party_id)).or_insert(version);
        if version > *entry {
            *entry = version;
        }
    }
    rows.into_iter()
        .filter(|row| {
            let (task_id, role, party_id, version) = key(row);
            latest.get(&(task_id, role, party_id)) == Some(&version)
        })
        .collect()
}
