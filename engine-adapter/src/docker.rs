use async_trait::async_trait;
use scheduler_core::controller::{worker_name, EngineAdapter, WorkerHandle, WorkerSpec};
use scheduler_core::error::EngineError;
use tracing::{info, warn};
use types::{EngineDevice, Task};

use crate::command::{local_ip, run_captured};

/// Runs each worker as a detached container through the docker CLI.
pub struct DockerEngine {
    docker: String,
    image: String,
    network: Option<String>,
}

impl DockerEngine {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            docker: "docker".to_string(),
            image: image.into(),
            network: None,
        }
    }

    pub fn with_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    /// Arguments of the `docker run` call for one worker.
    pub fn run_args(&self, spec: &WorkerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.worker_name.clone(),
            "--label".to_string(),
            "app.kubernetes.io/managed-by=fate-flow".to_string(),
            format!("--cpus={}", spec.cores.max(1)),
        ];
        if let Some(network) = &self.network {
            args.push(format!("--network={}", network));
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(self.image.clone());
        args.push(spec.program.clone());
        args.extend(spec.args.iter().cloned());
        args
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

#[async_trait]
impl EngineAdapter for DockerEngine {
    fn device(&self) -> EngineDevice {
        EngineDevice::Docker
    }

    async fn run(&self, task: &Task, spec: &WorkerSpec) -> Result<WorkerHandle, EngineError> {
        let output = run_captured(&self.docker, &self.run_args(spec))
            .await
            .map_err(|e| EngineError::Launch(format!("{}: {}", self.docker, e)))?;
        if !output.success {
            return Err(EngineError::Launch(format!(
                "docker run {} failed: {}",
                spec.worker_name, output.stderr
            )));
        }

        info!(
            task_id = %task.task_id,
            task_version = task.task_version,
            container = %output.stdout,
            "Started worker container"
        );
        Ok(WorkerHandle {
            worker_id: spec.worker_name.clone(),
            run_pid: None,
            run_ip: local_ip(),
        })
    }

    async fn kill(&self, task: &Task) -> Result<(), EngineError> {
        let name = worker_name(task);
        let args = vec!["rm".to_string(), "-f".to_string(), name.clone()];
        let output = run_captured(&self.docker, &args)
            .await
            .map_err(|e| EngineError::Kill(format!("{}: {}", self.docker, e)))?;

        if output.success || is_missing(&output.stderr) {
            info!(container = %name, "Removed worker container");
            Ok(())
        } else {
            Err(EngineError::Kill(format!("docker rm {} failed: {}", name, output.stderr)))
        }
    }

    async fn is_alive(&self, task: &Task) -> bool {
        let name = worker_name(task);
        let args = vec![
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            name.clone(),
        ];
        match run_captured(&self.docker, &args).await {
            Ok(output) if output.success => output.stdout == "true",
            Ok(output) if is_missing(&output.stderr) => false,
            Ok(output) => {
                warn!(container = %name, stderr = %output.stderr, "docker inspect failed");
                true
            }
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to run docker inspect");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use types::ComputingEngine;

    #[test]
    fn test_run_args_layout() {
        let mut env = BTreeMap::new();
        env.insert("FATE_JOB_ID".to_string(), "job-1".to_string());
        let spec = WorkerSpec {
            worker_name: "fate-job-1-reader-0-1-guest-9999".to_string(),
            program: "python".to_string(),
            args: vec!["-m".to_string(), "fate.components".to_string()],
            env,
            computing_engine: ComputingEngine::Standalone,
            cores: 4,
        };

        let args = DockerEngine::new("fate:2.0").with_network("fate").run_args(&spec);
        assert_eq!(&args[..4], &["run", "-d", "--name", "fate-job-1-reader-0-1-guest-9999"]);
        assert!(args.contains(&"--cpus=4".to_string()));
        assert!(args.contains(&"--network=fate".to_string()));
        assert!(args.contains(&"FATE_JOB_ID=job-1".to_string()));

        let image = args.iter().position(|a| a == "fate:2.0").unwrap();
        assert_eq!(&args[image + 1..], &["python", "-m", "fate.components"]);
    }

    #[test]
    fn test_missing_container_detection() {
        assert!(is_missing("Error: No such container: fate-x"));
        assert!(!is_missing("permission denied"));
    }
}
