// In-memory federation of parties for end-to-end scheduling tests

use async_trait::async_trait;
use database::mocks::{MockJobStore, MockScheduleStore};
use scheduler_core::config::{EngineConfig, FederatedConfig, SchedulerConfig};
use scheduler_core::controller::{worker_name, EngineAdapter, EngineRegistry, WorkerHandle, WorkerSpec};
use scheduler_core::error::{EngineError, FederatedError};
use scheduler_core::federation::{CommandHandler, FederatedResult, FederatedScheduler, FederatedTransport};
use scheduler_core::{Detector, JobScheduler, PartyService, SchedulerApi, TaskController};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use types::{
    EngineDevice, FederatedCommand, Job, JobDefaults, ScheduleJob, ScheduleTask, StatusMachine,
    Task, TaskCallbackRequest, TaskStatus,
};

pub mod fixtures;

pub const SCHEDULER_PARTY: &str = "9999";
pub const HOST_PARTY: &str = "10000";

/// Routes commands straight to each party's handler.
#[derive(Default)]
pub struct Network {
    parties: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    down: Mutex<HashSet<String>>,
}

impl Network {
    pub fn register(&self, party_id: &str, handler: Arc<dyn CommandHandler>) {
        self.parties
            .write()
            .unwrap()
            .insert(party_id.to_string(), handler);
    }

    pub fn set_down(&self, party_id: &str, down: bool) {
        let mut parties = self.down.lock().unwrap();
        if down {
            parties.insert(party_id.to_string());
        } else {
            parties.remove(party_id);
        }
    }
}

#[async_trait]
impl FederatedTransport for Network {
    async fn send(&self, dest_party_id: &str, command: &FederatedCommand) -> FederatedResult {
        if self.down.lock().unwrap().contains(dest_party_id) {
            return Err(FederatedError::Network {
                party_id: dest_party_id.to_string(),
                endpoint: command.endpoint().to_string(),
                message: "connection refused".to_string(),
            });
        }
        let handler = self.parties.read().unwrap().get(dest_party_id).cloned();
        match handler {
            Some(handler) => Ok(handler.handle(command.clone()).await),
            None => Err(FederatedError::NoRoute(dest_party_id.to_string())),
        }
    }
}

/// Engine that launches nothing and remembers what it was asked to do.
#[derive(Default)]
pub struct FakeEngine {
    alive: Mutex<HashSet<String>>,
    runs: Mutex<Vec<(String, i32)>>,
    kills: Mutex<Vec<String>>,
    fail_launch: Mutex<HashSet<String>>,
}

impl FakeEngine {
    /// Number of launches of `task_name`, over all versions.
    pub fn runs_of(&self, task_name: &str) -> usize {
        self.runs
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == task_name)
            .count()
    }

    pub fn kills(&self) -> Vec<String> {
        self.kills.lock().unwrap().clone()
    }

    pub fn alive_count(&self) -> usize {
        self.alive.lock().unwrap().len()
    }

    pub fn fail_launch_of(&self, task_name: &str) {
        self.fail_launch.lock().unwrap().insert(task_name.to_string());
    }

    /// The worker disappears without reporting.
    pub fn crash(&self, task: &Task) {
        self.alive.lock().unwrap().remove(&worker_name(task));
    }
}

#[async_trait]
impl EngineAdapter for FakeEngine {
    fn device(&self) -> EngineDevice {
        EngineDevice::Local
    }

    async fn run(&self, task: &Task, spec: &WorkerSpec) -> Result<WorkerHandle, EngineError> {
        if self.fail_launch.lock().unwrap().contains(&task.task_name) {
            return Err(EngineError::Launch(format!("cannot start {}", task.task_name)));
        }
        self.runs
            .lock()
            .unwrap()
            .push((task.task_name.clone(), task.task_version));
        self.alive.lock().unwrap().insert(spec.worker_name.clone());
        Ok(WorkerHandle {
            worker_id: spec.worker_name.clone(),
            run_pid: Some(4242),
            run_ip: Some("127.0.0.1".to_string()),
        })
    }

    async fn kill(&self, task: &Task) -> Result<(), EngineError> {
        let name = worker_name(task);
        self.alive.lock().unwrap().remove(&name);
        self.kills.lock().unwrap().push(name);
        Ok(())
    }

    async fn is_alive(&self, task: &Task) -> bool {
        self.alive.lock().unwrap().contains(&worker_name(task))
    }
}

pub struct Party {
    pub party_id: String,
    pub job_store: Arc<MockJobStore>,
    pub engine: Arc<FakeEngine>,
    pub service: Arc<PartyService>,
    pub detector: Detector,
}

impl Party {
    /// The local job row; every party holds a single role in these tests.
    pub fn job(&self, job_id: &str) -> Job {
        self.job_store
            .get_all_jobs()
            .into_iter()
            .find(|j| j.job_id == job_id && j.party_id == self.party_id)
            .unwrap()
    }

    /// Latest local task versions.
    pub fn latest_tasks(&self) -> Vec<Task> {
        let tasks = self.job_store.get_all_tasks();
        types::retain_latest(tasks, |t| {
            (t.task_id.clone(), t.role, t.party_id.clone(), t.task_version)
        })
    }

    pub fn task(&self, task_name: &str) -> Task {
        self.latest_tasks()
            .into_iter()
            .find(|t| t.task_name == task_name)
            .unwrap()
    }

    /// Worker callback for the latest version of `task_name`.
    pub async fn report(&self, task_name: &str, status: TaskStatus) {
        let task = self.task(task_name);
        if status.is_end() {
            self.engine.crash(&task);
        }
        self.service
            .task_callback(&TaskCallbackRequest {
                job_id: task.job_id.clone(),
                task_id: task.task_id.clone(),
                task_version: task.task_version,
                role: task.role,
                party_id: task.party_id.clone(),
                status,
                error_report: (status == TaskStatus::Failed).then(|| "worker exited 1".to_string()),
            })
            .await
            .unwrap();
    }
}

/// A scheduler party plus one host party wired over [`Network`].
pub struct Federation {
    pub network: Arc<Network>,
    pub schedule_store: Arc<MockScheduleStore>,
    pub api: Arc<SchedulerApi>,
    pub scheduler: JobScheduler,
    pub parties: BTreeMap<String, Party>,
}

fn federated_config() -> FederatedConfig {
    FederatedConfig {
        timeout: Duration::from_secs(5),
        try_times: 2,
        retry_interval: Duration::from_millis(5),
    }
}

impl Federation {
    pub fn new() -> Self {
        Self::with_defaults(JobDefaults::default())
    }

    pub fn with_defaults(job_defaults: JobDefaults) -> Self {
        let network = Arc::new(Network::default());
        let federation = Arc::new(FederatedScheduler::new(
            Arc::clone(&network) as Arc<dyn FederatedTransport>,
            federated_config(),
        ));

        let schedule_store = Arc::new(MockScheduleStore::new());
        let api = Arc::new(SchedulerApi::new(
            SCHEDULER_PARTY,
            Arc::clone(&schedule_store) as Arc<dyn scheduler_core::ScheduleStore>,
            job_defaults.clone(),
        ));

        let mut parties = BTreeMap::new();
        for party_id in [SCHEDULER_PARTY, HOST_PARTY] {
            let job_store = Arc::new(MockJobStore::new());
            let engine = Arc::new(FakeEngine::default());
            let engines = Arc::new(
                EngineRegistry::new(EngineDevice::Local)
                    .register(Arc::clone(&engine) as Arc<dyn EngineAdapter>),
            );
            let controller = Arc::new(TaskController::new(
                Arc::clone(&job_store) as Arc<dyn scheduler_core::JobStore>,
                engines,
                EngineConfig::default(),
                job_defaults.clone(),
            ));

            let mut service = PartyService::new(
                party_id,
                Arc::clone(&job_store) as Arc<dyn scheduler_core::JobStore>,
                Arc::clone(&controller),
                Arc::clone(&federation),
                job_defaults.clone(),
            );
            if party_id == SCHEDULER_PARTY {
                service = service.with_scheduler(Arc::clone(&api));
            }
            let service = Arc::new(service);
            network.register(party_id, Arc::clone(&service) as Arc<dyn CommandHandler>);

            let detector = Detector::new(
                party_id,
                Arc::clone(&job_store) as Arc<dyn scheduler_core::JobStore>,
                controller,
                Arc::clone(&federation),
                Duration::from_millis(50),
                Duration::from_millis(10),
            );

            parties.insert(
                party_id.to_string(),
                Party {
                    party_id: party_id.to_string(),
                    job_store,
                    engine,
                    service,
                    detector,
                },
            );
        }

        let mut config = SchedulerConfig::new(SCHEDULER_PARTY);
        config.job_defaults = job_defaults;
        config.federated = federated_config();
        let scheduler = JobScheduler::new(config, Arc::clone(&api), federation);

        Self {
            network,
            schedule_store,
            api,
            scheduler,
            parties,
        }
    }

    pub fn party(&self, party_id: &str) -> &Party {
        &self.parties[party_id]
    }

    pub fn guest(&self) -> &Party {
        self.party(SCHEDULER_PARTY)
    }

    pub fn host(&self) -> &Party {
        self.party(HOST_PARTY)
    }

    pub async fn tick(&self) {
        self.scheduler.tick().await.unwrap();
    }

    pub fn job(&self, job_id: &str) -> ScheduleJob {
        self.schedule_store
            .get_all_jobs()
            .into_iter()
            .find(|j| j.job_id == job_id)
            .unwrap()
    }

    /// Latest schedule rows of `task_name`, one per party.
    pub fn schedule_tasks(&self, task_name: &str) -> Vec<ScheduleTask> {
        let rows: Vec<ScheduleTask> = self
            .schedule_store
            .get_all_tasks()
            .into_iter()
            .filter(|t| t.task_name == task_name)
            .collect();
        types::retain_latest(rows, |t| {
            (t.task_id.clone(), t.role, t.party_id.clone(), t.task_version)
        })
    }

    /// Every party reports the same status for `task_name`.
    pub async fn report_all(&self, task_name: &str, status: TaskStatus) {
        for party in self.parties.values() {
            party.report(task_name, status).await;
        }
    }
}
