use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Config};
use scheduler_core::controller::{worker_name, EngineAdapter, WorkerHandle, WorkerSpec};
use scheduler_core::error::EngineError;
use std::collections::BTreeMap;
use tracing::{error, info, warn};
use types::{EngineDevice, Task};

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const JOB_ID_LABEL: &str = "fate-flow.io/job-id";
pub const TASK_ID_LABEL: &str = "fate-flow.io/task-id";
pub const ROLE_LABEL: &str = "fate-flow.io/role";
pub const PARTY_ID_LABEL: &str = "fate-flow.io/party-id";

/// Runs each worker as a batch Job in one namespace.
pub struct K8sEngine {
    jobs_api: Api<Job>,
    namespace: String,
    image: String,
}

impl K8sEngine {
    /// In-cluster config when `K8S_IN_CLUSTER=true`, the local kubeconfig otherwise.
    pub async fn new(namespace: impl Into<String>, image: impl Into<String>) -> Result<Self, EngineError> {
        let config = if std::env::var("K8S_IN_CLUSTER")
            .unwrap_or_default()
            .eq_ignore_ascii_case("true")
        {
            Config::incluster()
                .map_err(|e| EngineError::Config(format!("Failed to load in-cluster config: {}", e)))?
        } else {
            Config::from_kubeconfig(&Default::default())
                .await
                .map_err(|e| EngineError::Config(format!("Failed to load kubeconfig: {}", e)))?
        };

        let client = Client::try_from(config)
            .map_err(|e| EngineError::Config(format!("Failed to create client: {}", e)))?;
        let namespace = namespace.into();

        Ok(Self {
            jobs_api: Api::namespaced(client, &namespace),
            namespace,
            image: image.into(),
        })
    }
}

fn labels(task: &Task) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), "fate-flow".to_string());
    labels.insert(JOB_ID_LABEL.to_string(), label_value(&task.job_id));
    labels.insert(TASK_ID_LABEL.to_string(), label_value(&task.task_id));
    labels.insert(ROLE_LABEL.to_string(), task.role.to_string());
    labels.insert(PARTY_ID_LABEL.to_string(), label_value(&task.party_id));
    labels
}

/// Label values are limited to 63 alphanumeric, `-`, `_` or `.` characters.
fn label_value(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Batch Job running one task worker. Failed pods are not restarted; the
/// scheduler decides about retries.
pub fn job_manifest(namespace: &str, image: &str, task: &Task, spec: &WorkerSpec) -> Job {
    let labels = labels(task);

    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    let cpu = Quantity(spec.cores.max(1).to_string());
    let mut requests = BTreeMap::new();
    requests.insert("cpu".to_string(), cpu.clone());
    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), cpu);

    let container = Container {
        name: "worker".to_string(),
        image: Some(image.to_string()),
        command: Some(vec![spec.program.clone()]),
        args: Some(spec.args.clone()),
        env: Some(env),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            limits: Some(limits),
            ..Default::default()
        }),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(spec.worker_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(
                std::env::var("K8S_JOB_TTL_SECONDS")
                    .ok()
                    .and_then(|v| v.parse::<i32>().ok())
                    .unwrap_or(3600),
            ),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[async_trait]
impl EngineAdapter for K8sEngine {
    fn device(&self) -> EngineDevice {
        EngineDevice::K8s
    }

    async fn run(&self, task: &Task, spec: &WorkerSpec) -> Result<WorkerHandle, EngineError> {
        let manifest = job_manifest(&self.namespace, &self.image, task, spec);

        match self.jobs_api.create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                info!(
                    job_name = %spec.worker_name,
                    namespace = %self.namespace,
                    task_id = %task.task_id,
                    "Created worker job"
                );
                Ok(WorkerHandle {
                    worker_id: spec.worker_name.clone(),
                    run_pid: None,
                    run_ip: None,
                })
            }
            Err(e) => {
                error!(error = ?e, job_name = %spec.worker_name, "Failed to create worker job");
                Err(EngineError::Launch(e.to_string()))
            }
        }
    }

    async fn kill(&self, task: &Task) -> Result<(), EngineError> {
        let name = worker_name(task);
        match self.jobs_api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(job_name = %name, namespace = %self.namespace, "Deleted worker job");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => {
                error!(error = ?e, job_name = %name, "Failed to delete worker job");
                Err(EngineError::Kill(e.to_string()))
            }
        }
    }

    async fn is_alive(&self, task: &Task) -> bool {
        let name = worker_name(task);
        match self.jobs_api.get_opt(&name).await {
            Ok(Some(job)) => {
                let status = job.status.unwrap_or_default();
                status.succeeded.unwrap_or(0) == 0 && status.failed.unwrap_or(0) == 0
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = ?e, job_name = %name, "Failed to read worker job");
                true
            }
        }
    }
}
