use thiserror::Error;
use types::ReturnCode;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Illegal status transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub fn illegal(from: impl ToString, to: impl ToString) -> Self {
        StoreError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FederatedError {
    #[error("No route for party {0}")]
    NoRoute(String),

    #[error("Network error calling {endpoint} on party {party_id}: {message}")]
    Network {
        party_id: String,
        endpoint: String,
        message: String,
    },

    #[error("Timed out after {timeout_ms}ms calling {endpoint} on party {party_id}")]
    Timeout {
        party_id: String,
        endpoint: String,
        timeout_ms: u64,
    },

    #[error("Party {party_id} answered {endpoint} with HTTP {status}: {body}")]
    Http {
        party_id: String,
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("Party {party_id} rejected {endpoint} (code {code}): {message}")]
    Application {
        party_id: String,
        endpoint: String,
        code: i32,
        message: String,
    },

    #[error("Gave up on {endpoint} for party {party_id} after {attempts} attempts: {last}")]
    RetriesExhausted {
        party_id: String,
        endpoint: String,
        attempts: u32,
        last: Box<FederatedError>,
    },

    #[error("Failed to encode command: {0}")]
    Encode(String),
}

impl FederatedError {
    /// Network-level failures are worth another attempt; answers are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FederatedError::Network { .. } | FederatedError::Timeout { .. }
        )
    }

    /// Return code carried by an application-level rejection.
    pub fn application_code(&self) -> Option<i32> {
        match self {
            FederatedError::Application { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to launch worker: {0}")]
    Launch(String),

    #[error("Failed to kill worker: {0}")]
    Kill(String),

    #[error("No engine adapter registered for device {0}")]
    Unsupported(String),

    #[error("Engine configuration error: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dag(#[from] dag_parser::DagError),

    #[error(transparent)]
    Federated(#[from] FederatedError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn return_code(&self) -> ReturnCode {
        match self {
            SchedulerError::Store(StoreError::IllegalTransition { .. }) => {
                ReturnCode::IllegalTransition
            }
            SchedulerError::Store(StoreError::Duplicate(_)) => ReturnCode::JobAlreadyExists,
            SchedulerError::Store(StoreError::NotFound(_)) => ReturnCode::JobNotFound,
            SchedulerError::Store(_) => ReturnCode::UpdateFailed,
            SchedulerError::Dag(_) => ReturnCode::ParamsError,
            SchedulerError::Federated(FederatedError::NoRoute(_)) => ReturnCode::NoRoute,
            SchedulerError::Federated(_) => ReturnCode::FederatedError,
            SchedulerError::Engine(EngineError::Kill(_)) => ReturnCode::KillFailed,
            SchedulerError::Engine(_) => ReturnCode::StartTaskFailed,
            SchedulerError::JobNotFound(_) => ReturnCode::JobNotFound,
            SchedulerError::TaskNotFound(_) => ReturnCode::TaskNotFound,
            SchedulerError::InvalidRequest(_) => ReturnCode::ParamsError,
            SchedulerError::Config(_) => ReturnCode::Exception,
        }
    }
}
