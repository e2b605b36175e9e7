// Unit tests for TaskController and Detector

use mockall::mock;
use scheduler_core::config::{EngineConfig, FederatedConfig};
use scheduler_core::controller::{
    worker_name, EngineAdapter, EngineRegistry, TaskController, WorkerHandle, WorkerSpec,
};
use scheduler_core::database::JobStore;
use scheduler_core::detector::Detector;
use scheduler_core::error::{EngineError, StoreResult};
use scheduler_core::federation::{FederatedResult, FederatedScheduler, FederatedTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use types::{
    ComputingEngine, EngineDevice, FederatedCommand, Job, JobConf, JobDefaults, JobFilter,
    JobStatus, ResponseEnvelope, Role, Task, TaskFilter, TaskStatus, TaskUpdate,
};

mock! {
    Store {}

    #[async_trait::async_trait]
    impl JobStore for Store {
        async fn create_job(&self, job: &Job) -> StoreResult<()>;
        async fn update_job(&self, update: &types::JobUpdate) -> StoreResult<bool>;
        async fn query_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>>;
        async fn create_task(&self, task: &Task) -> StoreResult<()>;
        async fn update_task(&self, update: &TaskUpdate) -> StoreResult<bool>;
        async fn query_tasks(&self, filter: &TaskFilter) -> StoreResult<Vec<Task>>;
    }
}

mock! {
    Engine {}

    #[async_trait::async_trait]
    impl EngineAdapter for Engine {
        fn device(&self) -> EngineDevice;
        async fn run(&self, task: &Task, spec: &WorkerSpec) -> Result<WorkerHandle, EngineError>;
        async fn kill(&self, task: &Task) -> Result<(), EngineError>;
        async fn is_alive(&self, task: &Task) -> bool;
    }
}

mock! {
    Transport {}

    #[async_trait::async_trait]
    impl FederatedTransport for Transport {
        async fn send(&self, dest_party_id: &str, command: &FederatedCommand) -> FederatedResult;
    }
}

fn create_test_task(party_status: TaskStatus) -> Task {
    let now = chrono::Utc::now();
    Task {
        job_id: "job-1".to_string(),
        role: Role::Guest,
        party_id: "9999".to_string(),
        task_name: "psi_0".to_string(),
        component: "psi".to_string(),
        task_id: "job-1_psi_0".to_string(),
        task_version: 1,
        status: party_status,
        party_status,
        parameters: json!({"protocol": "ecdh"}),
        inputs: json!({}),
        conf: json!({}),
        dependencies: Vec::new(),
        worker_id: None,
        run_pid: None,
        run_ip: None,
        error_report: None,
        create_time: now,
        update_time: now,
        start_time: Some(now),
        end_time: None,
        elapsed: None,
    }
}

fn create_test_job(status: JobStatus) -> Job {
    let now = chrono::Utc::now();
    Job {
        job_id: "job-1".to_string(),
        role: Role::Guest,
        party_id: "9999".to_string(),
        protocol: "fate".to_string(),
        dag: json!({}),
        parties: Vec::new(),
        initiator_party_id: "10000".to_string(),
        scheduler_party_id: "10000".to_string(),
        status,
        status_code: 0,
        progress: 0,
        priority: 0,
        error_message: None,
        create_time: now,
        update_time: now,
        start_time: Some(now),
        end_time: None,
        elapsed: None,
    }
}

fn local_engine(engine: MockEngine) -> Arc<EngineRegistry> {
    Arc::new(EngineRegistry::new(EngineDevice::Local).register(Arc::new(engine)))
}

fn controller(store: MockStore, engine: MockEngine) -> TaskController {
    TaskController::new(
        Arc::new(store),
        local_engine(engine),
        EngineConfig::default(),
        JobDefaults::default(),
    )
}

#[tokio::test]
async fn test_start_task_launches_worker() {
    let mut store = MockStore::new();
    store
        .expect_update_task()
        .withf(|u| {
            u.expected_party_status == Some(TaskStatus::Pending)
                && u.party_status == Some(TaskStatus::Ready)
        })
        .times(1)
        .returning(|_| Ok(true));
    store
        .expect_update_task()
        .withf(|u| {
            u.expected_party_status == Some(TaskStatus::Ready)
                && u.party_status == Some(TaskStatus::Running)
                && u.worker_id.as_deref() == Some("worker-1")
                && u.run_pid == Some(4242)
        })
        .times(1)
        .returning(|_| Ok(true));

    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Local);
    engine.expect_run().times(1).returning(|_, spec| {
        assert_eq!(spec.env["FATE_TASK_ID"], "job-1_psi_0");
        assert_eq!(spec.env["FATE_ROLE"], "guest");
        Ok(WorkerHandle {
            worker_id: "worker-1".to_string(),
            run_pid: Some(4242),
            run_ip: None,
        })
    });

    let status = controller(store, engine)
        .start_task(&create_test_task(TaskStatus::Pending))
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Running);
}

#[tokio::test]
async fn test_launch_failure_marks_task_failed() {
    let mut store = MockStore::new();
    store
        .expect_update_task()
        .withf(|u| u.party_status == Some(TaskStatus::Ready))
        .times(1)
        .returning(|_| Ok(true));
    store
        .expect_update_task()
        .withf(|u| {
            u.expected_party_status == Some(TaskStatus::Ready)
                && u.party_status == Some(TaskStatus::Failed)
                && u.error_report.as_deref().map_or(false, |r| r.contains("no such image"))
        })
        .times(1)
        .returning(|_| Ok(true));

    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Local);
    engine
        .expect_run()
        .times(1)
        .returning(|_, _| Err(EngineError::Launch("no such image".to_string())));

    let status = controller(store, engine)
        .start_task(&create_test_task(TaskStatus::Pending))
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_second_start_reports_current_status() {
    let mut store = MockStore::new();
    store.expect_update_task().times(1).returning(|_| Ok(false));
    store
        .expect_query_tasks()
        .times(1)
        .returning(|_| Ok(vec![create_test_task(TaskStatus::Running)]));

    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Local);
    engine.expect_run().times(0);

    let status = controller(store, engine)
        .start_task(&create_test_task(TaskStatus::Pending))
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Running);
}

#[test]
fn test_registry_without_default_device_is_invalid() {
    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Docker);
    let registry = EngineRegistry::new(EngineDevice::K8s).register(Arc::new(engine));

    assert!(matches!(registry.validate(), Err(EngineError::Unsupported(_))));
    assert!(registry.get(EngineDevice::Docker).is_ok());
}

#[test]
fn test_spark_worker_goes_through_spark_submit() {
    let task = create_test_task(TaskStatus::Pending);
    let conf = JobConf {
        computing_engine: Some(ComputingEngine::Spark),
        task_cores: Some(8),
        ..Default::default()
    }
    .resolve(&JobDefaults::default());
    let spec = WorkerSpec::for_task(&task, &conf, &EngineConfig::default());

    assert_eq!(spec.program, "spark-submit");
    assert!(spec.args.contains(&"spark.cores.max=8".to_string()));
    assert_eq!(spec.env["FATE_COMPUTING_ENGINE"], "spark");
    assert!(spec.worker_name.starts_with("fate-job-1-psi-0-1-guest-9999-"));
    assert_eq!(spec.worker_name, worker_name(&task));
}

fn detector(store: MockStore, engine: MockEngine, transport: MockTransport) -> Detector {
    let store = Arc::new(store);
    let controller = Arc::new(TaskController::new(
        store.clone(),
        local_engine(engine),
        EngineConfig::default(),
        JobDefaults::default(),
    ));
    let federation = Arc::new(FederatedScheduler::new(
        Arc::new(transport),
        FederatedConfig {
            timeout: Duration::from_millis(200),
            try_times: 1,
            retry_interval: Duration::from_millis(1),
        },
    ));
    Detector::new(
        "9999",
        store,
        controller,
        federation,
        Duration::from_millis(10),
        Duration::from_millis(1),
    )
}

#[tokio::test]
async fn test_detector_fails_lost_task_and_stops_job() {
    let mut store = MockStore::new();
    store
        .expect_query_tasks()
        .withf(|f| f.only_latest)
        .times(1)
        .returning(|_| Ok(vec![create_test_task(TaskStatus::Running)]));
    store
        .expect_query_tasks()
        .withf(|f| f.task_version == Some(1))
        .times(1)
        .returning(|_| Ok(vec![create_test_task(TaskStatus::Running)]));
    store
        .expect_query_jobs()
        .returning(|_| Ok(vec![create_test_job(JobStatus::Running)]));
    store
        .expect_update_task()
        .withf(|u| {
            u.expected_party_status == Some(TaskStatus::Running)
                && u.party_status == Some(TaskStatus::Failed)
        })
        .times(1)
        .returning(|_| Ok(true));

    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Local);
    engine.expect_is_alive().returning(|_| false);

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .withf(|party_id, command| {
            party_id == "10000"
                && matches!(
                    command,
                    FederatedCommand::StopAll(r) if r.stop_status == Some(JobStatus::Failed)
                )
        })
        .times(1)
        .returning(|_, _| Ok(ResponseEnvelope::success(None)));

    let report = detector(store, engine, transport).scan_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert_eq!(report.lost, 1);
}

#[tokio::test]
async fn test_detector_tolerates_finish_during_grace_period() {
    let mut store = MockStore::new();
    store
        .expect_query_tasks()
        .withf(|f| f.only_latest)
        .times(1)
        .returning(|_| Ok(vec![create_test_task(TaskStatus::Running)]));
    store
        .expect_query_tasks()
        .withf(|f| f.task_version == Some(1))
        .times(1)
        .returning(|_| Ok(vec![create_test_task(TaskStatus::Success)]));
    store
        .expect_query_jobs()
        .returning(|_| Ok(vec![create_test_job(JobStatus::Running)]));
    store.expect_update_task().times(0);

    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Local);
    engine.expect_is_alive().returning(|_| false);

    let mut transport = MockTransport::new();
    transport.expect_send().times(0);

    let report = detector(store, engine, transport).scan_once().await.unwrap();
    assert_eq!(report.lost, 0);
    assert_eq!(report.raced, 1);
}

#[tokio::test]
async fn test_detector_kills_tasks_of_ended_jobs() {
    let mut store = MockStore::new();
    store
        .expect_query_tasks()
        .times(1)
        .returning(|_| Ok(vec![create_test_task(TaskStatus::Running)]));
    store
        .expect_query_jobs()
        .returning(|_| Ok(vec![create_test_job(JobStatus::Canceled)]));
    store
        .expect_update_task()
        .withf(|u| u.party_status == Some(TaskStatus::Failed))
        .times(1)
        .returning(|_| Ok(true));

    let mut engine = MockEngine::new();
    engine.expect_device().return_const(EngineDevice::Local);
    engine.expect_kill().times(1).returning(|_| Ok(()));
    engine.expect_is_alive().times(0);

    let mut transport = MockTransport::new();
    transport.expect_send().times(0);

    let report = detector(store, engine, transport).scan_once().await.unwrap();
    assert_eq!(report.orphaned, 1);
}
