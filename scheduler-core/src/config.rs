use std::str::FromStr;
use std::time::Duration;

use types::{ComputingEngine, EngineDevice, JobDefaults, SyncType};

use crate::error::{Result, SchedulerError};

/// Numeric settings fall back to their default when unset or unparsable.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Tag settings must parse when present.
fn env_tag<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| SchedulerError::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct FederatedConfig {
    /// Per-attempt timeout.
    pub timeout: Duration,
    pub try_times: u32,
    pub retry_interval: Duration,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            try_times: 3,
            retry_interval: Duration::from_millis(500),
        }
    }
}

/// How workers are launched.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub device: EngineDevice,
    pub worker_program: String,
    pub worker_args: Vec<String>,
    pub spark_submit: String,
    pub docker_image: String,
    pub k8s_namespace: String,
    pub k8s_image: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: EngineDevice::Local,
            worker_program: "python".to_string(),
            worker_args: vec![
                "-m".to_string(),
                "fate.components".to_string(),
                "execute".to_string(),
            ],
            spark_submit: "spark-submit".to_string(),
            docker_image: "federatedai/fate:latest".to_string(),
            k8s_namespace: "default".to_string(),
            k8s_image: "federatedai/fate:latest".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let worker_args = match std::env::var("FATE_FLOW_WORKER_ARGS") {
            Ok(args) => args.split_whitespace().map(|a| a.to_string()).collect(),
            Err(_) => defaults.worker_args,
        };

        Ok(Self {
            device: env_tag("FATE_FLOW_ENGINE_DEVICE", defaults.device)?,
            worker_program: std::env::var("FATE_FLOW_WORKER_PROGRAM")
                .unwrap_or(defaults.worker_program),
            worker_args,
            spark_submit: std::env::var("FATE_FLOW_SPARK_SUBMIT").unwrap_or(defaults.spark_submit),
            docker_image: std::env::var("FATE_FLOW_DOCKER_IMAGE").unwrap_or(defaults.docker_image),
            k8s_namespace: std::env::var("K8S_NAMESPACE").unwrap_or(defaults.k8s_namespace),
            k8s_image: std::env::var("FATE_FLOW_K8S_IMAGE").unwrap_or(defaults.k8s_image),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Party this process serves.
    pub party_id: String,
    pub is_scheduler: bool,
    pub schedule_interval: Duration,
    pub detect_interval: Duration,
    /// Wait before re-checking a task whose worker looks dead.
    pub detector_grace_period: Duration,
    /// A schedule signal older than this is considered abandoned.
    pub schedule_signal_timeout: Duration,
    pub max_running_jobs: usize,
    pub total_cores: u32,
    pub federated: FederatedConfig,
    pub job_defaults: JobDefaults,
    pub engine: EngineConfig,
}

impl SchedulerConfig {
    pub fn new(party_id: impl Into<String>) -> Self {
        Self {
            party_id: party_id.into(),
            is_scheduler: true,
            schedule_interval: Duration::from_secs(2),
            detect_interval: Duration::from_secs(5),
            detector_grace_period: Duration::from_secs(3),
            schedule_signal_timeout: Duration::from_secs(600),
            max_running_jobs: 10,
            total_cores: 64,
            federated: FederatedConfig::default(),
            job_defaults: JobDefaults::default(),
            engine: EngineConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self> {
        let party_id = std::env::var("FATE_FLOW_PARTY_ID")
            .map_err(|_| SchedulerError::Config("FATE_FLOW_PARTY_ID is not set".to_string()))?;
        let base = Self::new(party_id);
        let defaults = JobDefaults::default();

        let job_defaults = JobDefaults {
            priority: env_or("FATE_FLOW_DEFAULT_PRIORITY", defaults.priority),
            task_parallelism: env_or("FATE_FLOW_TASK_PARALLELISM", defaults.task_parallelism),
            task_cores: env_or("FATE_FLOW_TASK_CORES", defaults.task_cores),
            auto_retries: env_or("FATE_FLOW_AUTO_RETRIES", defaults.auto_retries),
            auto_retry_delay: env_or("FATE_FLOW_AUTO_RETRY_DELAY", defaults.auto_retry_delay),
            sync_type: env_tag::<SyncType>("FATE_FLOW_SYNC_TYPE", defaults.sync_type)?,
            timeout: env_or("FATE_FLOW_JOB_TIMEOUT", defaults.timeout),
            computing_engine: env_tag::<ComputingEngine>(
                "FATE_FLOW_COMPUTING_ENGINE",
                defaults.computing_engine,
            )?,
        };

        Ok(Self {
            is_scheduler: env_or("FATE_FLOW_IS_SCHEDULER", base.is_scheduler),
            schedule_interval: Duration::from_millis(env_or(
                "FATE_FLOW_SCHEDULE_INTERVAL_MS",
                base.schedule_interval.as_millis() as u64,
            )),
            detect_interval: Duration::from_millis(env_or(
                "FATE_FLOW_DETECT_INTERVAL_MS",
                base.detect_interval.as_millis() as u64,
            )),
            detector_grace_period: Duration::from_millis(env_or(
                "FATE_FLOW_DETECT_GRACE_MS",
                base.detector_grace_period.as_millis() as u64,
            )),
            schedule_signal_timeout: Duration::from_secs(env_or(
                "FATE_FLOW_SCHEDULE_SIGNAL_TIMEOUT",
                base.schedule_signal_timeout.as_secs(),
            )),
            max_running_jobs: env_or("FATE_FLOW_MAX_RUNNING_JOBS", base.max_running_jobs),
            total_cores: env_or("FATE_FLOW_TOTAL_CORES", base.total_cores),
            federated: FederatedConfig {
                timeout: Duration::from_millis(env_or(
                    "FATE_FLOW_FEDERATED_TIMEOUT_MS",
                    base.federated.timeout.as_millis() as u64,
                )),
                try_times: env_or("FATE_FLOW_FEDERATED_TRY_TIMES", base.federated.try_times).max(1),
                retry_interval: Duration::from_millis(env_or(
                    "FATE_FLOW_FEDERATED_RETRY_INTERVAL_MS",
                    base.federated.retry_interval.as_millis() as u64,
                )),
            },
            job_defaults,
            engine: EngineConfig::from_env()?,
            party_id: base.party_id,
        })
    }
}
