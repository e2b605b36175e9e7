use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{error, info, warn};
use types::{
    elapsed_ms, ComputingEngine, EffectiveJobConf, EngineDevice, JobConf, JobDefaults, Task,
    TaskFilter, TaskStatus, TaskUpdate,
};

use crate::config::EngineConfig;
use crate::database::JobStore;
use crate::error::{EngineError, Result, SchedulerError};

/// What a launched worker can be found by later.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHandle {
    pub worker_id: String,
    pub run_pid: Option<i32>,
    pub run_ip: Option<String>,
}

/// Everything an engine needs to start one task worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    /// Stable name for containers and cluster jobs.
    pub worker_name: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub computing_engine: ComputingEngine,
    pub cores: u32,
}

impl WorkerSpec {
    pub fn for_task(task: &Task, conf: &EffectiveJobConf, engine: &EngineConfig) -> Self {
        let mut env = BTreeMap::new();
        env.insert("FATE_JOB_ID".to_string(), task.job_id.clone());
        env.insert("FATE_TASK_ID".to_string(), task.task_id.clone());
        env.insert("FATE_TASK_NAME".to_string(), task.task_name.clone());
        env.insert("FATE_TASK_VERSION".to_string(), task.task_version.to_string());
        env.insert("FATE_COMPONENT".to_string(), task.component.clone());
        env.insert("FATE_ROLE".to_string(), task.role.to_string());
        env.insert("FATE_PARTY_ID".to_string(), task.party_id.clone());
        env.insert("FATE_TASK_PARAMETERS".to_string(), task.parameters.to_string());
        env.insert("FATE_TASK_INPUTS".to_string(), task.inputs.to_string());
        env.insert(
            "FATE_COMPUTING_ENGINE".to_string(),
            conf.computing_engine.to_string(),
        );

        let worker_name = worker_name(task);
        let (program, args) = match conf.computing_engine {
            ComputingEngine::Spark => {
                let mut args = vec![
                    "--name".to_string(),
                    worker_name.clone(),
                    "--conf".to_string(),
                    format!("spark.cores.max={}", conf.task_cores),
                    engine.worker_program.clone(),
                ];
                args.extend(engine.worker_args.iter().cloned());
                (engine.spark_submit.clone(), args)
            }
            ComputingEngine::Standalone | ComputingEngine::Eggroll => {
                (engine.worker_program.clone(), engine.worker_args.clone())
            }
        };

        Self {
            worker_name,
            program,
            args,
            env,
            computing_engine: conf.computing_engine,
            cores: conf.task_cores,
        }
    }
}

/// Longest name a k8s label value (and so a Job name) may have.
const WORKER_NAME_MAX: usize = 63;
const WORKER_NAME_HASH_LEN: usize = 8;

/// Name usable as a container name or a k8s object name.
///
/// A readable prefix, cut to fit, followed by a hash of the exact task
/// identity so that names differing only in sanitized characters stay apart.
pub fn worker_name(task: &Task) -> String {
    let identity = format!(
        "{}\n{}\n{}\n{}\n{}",
        task.job_id, task.task_name, task.task_version, task.role, task.party_id
    );
    let digest = hex::encode(Sha256::digest(identity.as_bytes()));

    let readable: String = format!(
        "fate-{}-{}-{}-{}-{}",
        task.job_id, task.task_name, task.task_version, task.role, task.party_id
    )
    .to_lowercase()
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
    .take(WORKER_NAME_MAX - WORKER_NAME_HASH_LEN - 1)
    .collect();

    format!(
        "{}-{}",
        readable.trim_end_matches('-'),
        &digest[..WORKER_NAME_HASH_LEN]
    )
}

/// Capability every worker backend provides.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn device(&self) -> EngineDevice;

    /// Launch the worker. A launch failure is reported here, not later.
    async fn run(&self, task: &Task, spec: &WorkerSpec) -> std::result::Result<WorkerHandle, EngineError>;

    /// Stop the worker. A worker that is already gone counts as stopped.
    async fn kill(&self, task: &Task) -> std::result::Result<(), EngineError>;

    /// `false` for a worker that no longer exists.
    async fn is_alive(&self, task: &Task) -> bool;
}

/// Engine adapters by device, resolved once at startup.
pub struct EngineRegistry {
    default_device: EngineDevice,
    adapters: HashMap<EngineDevice, Arc<dyn EngineAdapter>>,
}

impl EngineRegistry {
    pub fn new(default_device: EngineDevice) -> Self {
        Self {
            default_device,
            adapters: HashMap::new(),
        }
    }

    pub fn register(mut self, adapter: Arc<dyn EngineAdapter>) -> Self {
        self.adapters.insert(adapter.device(), adapter);
        self
    }

    /// Fails when the default device has no adapter.
    pub fn validate(&self) -> std::result::Result<(), EngineError> {
        self.get(self.default_device).map(|_| ())
    }

    pub fn default_device(&self) -> EngineDevice {
        self.default_device
    }

    pub fn get(&self, device: EngineDevice) -> std::result::Result<Arc<dyn EngineAdapter>, EngineError> {
        self.adapters
            .get(&device)
            .cloned()
            .ok_or_else(|| EngineError::Unsupported(device.to_string()))
    }

    pub fn default_adapter(&self) -> std::result::Result<Arc<dyn EngineAdapter>, EngineError> {
        self.get(self.default_device)
    }
}

/// Starts, stops and probes local task workers and records the outcome.
pub struct TaskController {
    job_store: Arc<dyn JobStore>,
    engines: Arc<EngineRegistry>,
    engine_config: EngineConfig,
    job_defaults: JobDefaults,
}

impl TaskController {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        engines: Arc<EngineRegistry>,
        engine_config: EngineConfig,
        job_defaults: JobDefaults,
    ) -> Self {
        Self {
            job_store,
            engines,
            engine_config,
            job_defaults,
        }
    }

    fn effective_conf(&self, task: &Task) -> EffectiveJobConf {
        let conf: JobConf = serde_json::from_value(task.conf.clone()).unwrap_or_else(|e| {
            warn!(task_id = task.task_id, error = %e, "Unreadable task conf, using defaults");
            JobConf::default()
        });
        conf.resolve(&self.job_defaults)
    }

    /// PENDING -> READY -> launch -> RUNNING, or FAILED when the launch fails.
    ///
    /// Returns the party status the task ended up in. A task another caller
    /// already claimed is reported as-is.
    pub async fn start_task(&self, task: &Task) -> Result<TaskStatus> {
        let key = task.key();
        let mut claim = TaskUpdate::new(key.clone());
        claim.expected_party_status = Some(TaskStatus::Pending);
        claim.party_status = Some(TaskStatus::Ready);
        claim.status = Some(TaskStatus::Ready);

        if !self.job_store.update_task(&claim).await? {
            let current = self.current_status(task).await?;
            info!(
                job_id = task.job_id,
                task_id = task.task_id,
                task_version = task.task_version,
                status = %current,
                "Task already claimed"
            );
            return Ok(current);
        }

        let conf = self.effective_conf(task);
        let spec = WorkerSpec::for_task(task, &conf, &self.engine_config);
        let launched = match self.engines.default_adapter() {
            Ok(engine) => engine.run(task, &spec).await,
            Err(e) => Err(e),
        };

        let now = Utc::now();
        match launched {
            Ok(handle) => {
                let mut update = TaskUpdate::new(key);
                update.expected_party_status = Some(TaskStatus::Ready);
                update.party_status = Some(TaskStatus::Running);
                update.status = Some(TaskStatus::Running);
                update.worker_id = Some(handle.worker_id.clone());
                update.run_pid = handle.run_pid;
                update.run_ip = handle.run_ip.clone();
                update.start_time = Some(now);
                self.job_store.update_task(&update).await?;

                info!(
                    job_id = task.job_id,
                    task_id = task.task_id,
                    task_version = task.task_version,
                    worker_id = handle.worker_id,
                    "Task worker started"
                );
                Ok(TaskStatus::Running)
            }
            Err(e) => {
                error!(
                    job_id = task.job_id,
                    task_id = task.task_id,
                    task_version = task.task_version,
                    error = %e,
                    "Task worker failed to launch"
                );
                let mut update = TaskUpdate::new(key);
                update.expected_party_status = Some(TaskStatus::Ready);
                update.party_status = Some(TaskStatus::Failed);
                update.status = Some(TaskStatus::Failed);
                update.error_report = Some(e.to_string());
                update.end_time = Some(now);
                update.elapsed = elapsed_ms(task.start_time, now);
                self.job_store.update_task(&update).await?;
                Ok(TaskStatus::Failed)
            }
        }
    }

    async fn current_status(&self, task: &Task) -> Result<TaskStatus> {
        self.job_store
            .query_tasks(&TaskFilter::by_key(&task.key()))
            .await?
            .first()
            .map(|t| t.party_status)
            .ok_or_else(|| SchedulerError::TaskNotFound(task.task_id.clone()))
    }

    /// Best-effort stop; an absent worker is not an error.
    pub async fn kill_task(&self, task: &Task) -> Result<()> {
        let engine = self.engines.default_adapter()?;
        engine.kill(task).await?;
        info!(
            job_id = task.job_id,
            task_id = task.task_id,
            task_version = task.task_version,
            "Task worker killed"
        );
        Ok(())
    }

    pub async fn is_alive(&self, task: &Task) -> bool {
        match self.engines.default_adapter() {
            Ok(engine) => engine.is_alive(task).await,
            Err(e) => {
                warn!(task_id = task.task_id, error = %e, "No engine to probe task");
                false
            }
        }
    }
}
