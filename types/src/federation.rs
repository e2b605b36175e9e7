use serde::{Deserialize, Serialize};
use std::fmt;

use crate::party::Role;
use crate::status::{JobStatus, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Post => f.write_str("POST"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub job_id: String,
    pub dag: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_job_id: Option<String>,
    /// Party that drives the job and receives task reports.
    pub scheduler_party_id: String,
    pub initiator_party_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAllRequest {
    pub dag: serde_json::Value,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,
    /// Client-generated job id; the scheduler generates one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopJobRequest {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_status: Option<JobStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditConfirmRequest {
    pub job_id: String,
    /// Primary status name, or an adapter status name for non-fate protocols.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub job_id: String,
    pub task_id: String,
    pub task_name: String,
    pub task_version: i32,
    pub role: Role,
    pub party_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollTaskRequest {
    pub job_id: String,
    pub task_id: String,
    pub task_version: i32,
    pub role: Role,
    pub party_id: String,
}

/// Worker to party status callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCallbackRequest {
    pub job_id: String,
    pub task_id: String,
    pub task_version: i32,
    pub role: Role,
    pub party_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_report: Option<String>,
}

/// Party to scheduler status report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReportRequest {
    pub job_id: String,
    pub role: Role,
    pub party_id: String,
    pub task_id: String,
    pub task_version: i32,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_report: Option<String>,
}

/// Every scheduling command exchanged between party schedulers.
#[derive(Debug, Clone, PartialEq)]
pub enum FederatedCommand {
    CreateJob(CreateJobRequest),
    CreateAll(CreateAllRequest),
    StartJob(JobRef),
    StopJob(StopJobRequest),
    StopAll(StopJobRequest),
    StatusAll(JobRef),
    AuditConfirm(AuditConfirmRequest),
    RerunJob(JobRef),
    StartTask(StartTaskRequest),
    PollTask(PollTaskRequest),
    TaskCallback(TaskCallbackRequest),
    ReportTask(TaskReportRequest),
}

impl FederatedCommand {
    pub fn endpoint(&self) -> &'static str {
        match self {
            FederatedCommand::CreateJob(_) => "/schedule/job/create",
            FederatedCommand::CreateAll(_) => "/schedule/job/create_all",
            FederatedCommand::StartJob(_) => "/schedule/job/start",
            FederatedCommand::StopJob(_) => "/schedule/job/stop",
            FederatedCommand::StopAll(_) => "/schedule/job/stop_all",
            FederatedCommand::StatusAll(_) => "/schedule/job/status_all",
            FederatedCommand::AuditConfirm(_) => "/schedule/job/audit_confirm",
            FederatedCommand::RerunJob(_) => "/schedule/job/rerun",
            FederatedCommand::StartTask(_) => "/schedule/task/start",
            FederatedCommand::PollTask(_) => "/schedule/task/poll",
            FederatedCommand::TaskCallback(_) => "/schedule/task/callback",
            FederatedCommand::ReportTask(_) => "/schedule/task/report",
        }
    }

    pub fn method(&self) -> HttpMethod {
        match self {
            FederatedCommand::StatusAll(_) => HttpMethod::Get,
            _ => HttpMethod::Post,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            FederatedCommand::CreateJob(r) => &r.job_id,
            FederatedCommand::CreateAll(r) => r.job_id.as_deref().unwrap_or(""),
            FederatedCommand::StartJob(r)
            | FederatedCommand::StatusAll(r)
            | FederatedCommand::RerunJob(r) => &r.job_id,
            FederatedCommand::StopJob(r) | FederatedCommand::StopAll(r) => &r.job_id,
            FederatedCommand::AuditConfirm(r) => &r.job_id,
            FederatedCommand::StartTask(r) => &r.job_id,
            FederatedCommand::PollTask(r) => &r.job_id,
            FederatedCommand::TaskCallback(r) => &r.job_id,
            FederatedCommand::ReportTask(r) => &r.job_id,
        }
    }

    /// JSON body sent on the wire.
    pub fn body(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            FederatedCommand::CreateJob(r) => serde_json::to_value(r),
            FederatedCommand::CreateAll(r) => serde_json::to_value(r),
            FederatedCommand::StartJob(r)
            | FederatedCommand::StatusAll(r)
            | FederatedCommand::RerunJob(r) => serde_json::to_value(r),
            FederatedCommand::StopJob(r) | FederatedCommand::StopAll(r) => serde_json::to_value(r),
            FederatedCommand::AuditConfirm(r) => serde_json::to_value(r),
            FederatedCommand::StartTask(r) => serde_json::to_value(r),
            FederatedCommand::PollTask(r) => serde_json::to_value(r),
            FederatedCommand::TaskCallback(r) => serde_json::to_value(r),
            FederatedCommand::ReportTask(r) => serde_json::to_value(r),
        }
    }

    /// Decode a command from the endpoint it arrived on.
    pub fn from_endpoint(endpoint: &str, body: serde_json::Value) -> Result<Self, String> {
        let parse_err = |e: serde_json::Error| format!("Invalid body for {}: {}", endpoint, e);
        let command = match endpoint {
            "/schedule/job/create" => {
                FederatedCommand::CreateJob(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/create_all" => {
                FederatedCommand::CreateAll(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/start" => {
                FederatedCommand::StartJob(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/stop" => {
                FederatedCommand::StopJob(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/stop_all" => {
                FederatedCommand::StopAll(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/status_all" => {
                FederatedCommand::StatusAll(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/audit_confirm" => {
                FederatedCommand::AuditConfirm(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/job/rerun" => {
                FederatedCommand::RerunJob(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/task/start" => {
                FederatedCommand::StartTask(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/task/poll" => {
                FederatedCommand::PollTask(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/task/callback" => {
                FederatedCommand::TaskCallback(serde_json::from_value(body).map_err(parse_err)?)
            }
            "/schedule/task/report" => {
                FederatedCommand::ReportTask(serde_json::from_value(body).map_err(parse_err)?)
            }
            other => return Err(format!("Unknown endpoint: {}", other)),
        };
        Ok(command)
    }
}

/// Result codes carried in the response envelope. Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Success = 0,
    Exception = 100,
    ParamsError = 101,
    JobNotFound = 102,
    TaskNotFound = 103,
    CreateJobFailed = 104,
    UpdateFailed = 105,
    KillFailed = 106,
    ResourceExhausted = 107,
    NoRoute = 108,
    IllegalTransition = 109,
    StartTaskFailed = 110,
    FederatedError = 111,
    JobAlreadyExists = 112,
}

impl ReturnCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let all = [
            ReturnCode::Success,
            ReturnCode::Exception,
            ReturnCode::ParamsError,
            ReturnCode::JobNotFound,
            ReturnCode::TaskNotFound,
            ReturnCode::CreateJobFailed,
            ReturnCode::UpdateFailed,
            ReturnCode::KillFailed,
            ReturnCode::ResourceExhausted,
            ReturnCode::NoRoute,
            ReturnCode::IllegalTransition,
            ReturnCode::StartTaskFailed,
            ReturnCode::FederatedError,
            ReturnCode::JobAlreadyExists,
        ];
        all.into_iter().find(|c| c.code() == code)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub code: i32,
    #[serde(default, alias = "msg")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ResponseEnvelope {
    pub fn success(data: Option<serde_json::Value>) -> Self {
        Self {
            code: ReturnCode::Success.code(),
            message: "success".to_string(),
            data,
        }
    }

    pub fn error(code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ReturnCode::Success.code()
    }
}

/// `data` of a poll or start-task response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusData {
    pub status: TaskStatus,
}

/// One row of a `status_all` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyTaskStatus {
    pub task_name: String,
    pub task_version: i32,
    pub role: Role,
    pub party_id: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusAllData {
    pub job_id: String,
    pub job_status: JobStatus,
    pub progress: i32,
    pub status: Vec<PartyTaskStatus>,
}
