use async_trait::async_trait;
use scheduler_core::controller::{worker_name, EngineAdapter, WorkerHandle, WorkerSpec};
use scheduler_core::error::EngineError;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use types::{EngineDevice, Task};

use crate::command::{local_ip, run_captured};

/// Runs workers as child processes of this scheduler.
///
/// Children started by this process are tracked by worker name. Workers left
/// over from an earlier process are checked and killed through their pid, but
/// only while that pid still carries the task's identity in its environment.
pub struct LocalProcessEngine {
    children: Mutex<HashMap<String, Child>>,
    log_dir: Option<PathBuf>,
}

impl LocalProcessEngine {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            log_dir: None,
        }
    }

    /// Send worker stdout and stderr to `<log_dir>/<worker_name>.log`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    fn children(&self) -> MutexGuard<'_, HashMap<String, Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn output(&self, worker_name: &str) -> Result<(Stdio, Stdio), EngineError> {
        let Some(dir) = &self.log_dir else {
            return Ok((Stdio::null(), Stdio::null()));
        };
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::Launch(format!("Failed to create {}: {}", dir.display(), e)))?;
        let path = dir.join(format!("{}.log", worker_name));
        let file = std::fs::File::create(&path)
            .map_err(|e| EngineError::Launch(format!("Failed to open {}: {}", path.display(), e)))?;
        let err_file = file
            .try_clone()
            .map_err(|e| EngineError::Launch(e.to_string()))?;
        Ok((Stdio::from(file), Stdio::from(err_file)))
    }
}

/// Identity variables every worker is started with.
fn identity_vars(task: &Task) -> [String; 4] {
    [
        format!("FATE_TASK_ID={}", task.task_id),
        format!("FATE_TASK_VERSION={}", task.task_version),
        format!("FATE_ROLE={}", task.role),
        format!("FATE_PARTY_ID={}", task.party_id),
    ]
}

/// Whether a NUL-separated environment block belongs to `task`'s worker.
pub(crate) fn environ_matches(environ: &[u8], task: &Task) -> bool {
    let vars: HashSet<&[u8]> = environ.split(|b| *b == 0).collect();
    identity_vars(task)
        .iter()
        .all(|var| vars.contains(var.as_bytes()))
}

/// Whether `pid` is still the worker started for `task`.
///
/// A reused pid, an exited (zombie) process or an unreadable entry is not.
async fn owns_pid(task: &Task, pid: i32) -> bool {
    let path = format!("/proc/{}/environ", pid);
    match tokio::fs::read(&path).await {
        Ok(environ) => environ_matches(&environ, task),
        Err(e) => {
            debug!(pid, error = %e, "Worker pid not readable");
            false
        }
    }
}

impl Default for LocalProcessEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EngineAdapter for LocalProcessEngine {
    fn device(&self) -> EngineDevice {
        EngineDevice::Local
    }

    async fn run(&self, task: &Task, spec: &WorkerSpec) -> Result<WorkerHandle, EngineError> {
        let (stdout, stderr) = self.output(&spec.worker_name)?;
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| EngineError::Launch(format!("{}: {}", spec.program, e)))?;

        let run_pid = child.id().and_then(|pid| i32::try_from(pid).ok());
        info!(
            task_id = %task.task_id,
            task_version = task.task_version,
            worker = %spec.worker_name,
            pid = ?run_pid,
            "Started local worker"
        );
        self.children().insert(spec.worker_name.clone(), child);

        Ok(WorkerHandle {
            worker_id: spec.worker_name.clone(),
            run_pid,
            run_ip: local_ip(),
        })
    }

    async fn kill(&self, task: &Task) -> Result<(), EngineError> {
        let name = worker_name(task);
        let tracked = self.children().remove(&name);

        if let Some(mut child) = tracked {
            if let Ok(Some(_)) = child.try_wait() {
                debug!(worker = %name, "Local worker already exited");
                return Ok(());
            }
            child
                .start_kill()
                .map_err(|e| EngineError::Kill(format!("{}: {}", name, e)))?;
            if let Err(e) = child.wait().await {
                warn!(worker = %name, error = %e, "Failed to reap local worker");
            }
            info!(worker = %name, "Killed local worker");
            return Ok(());
        }

        let Some(pid) = task.run_pid else {
            return Ok(());
        };
        if !owns_pid(task, pid).await {
            debug!(worker = %name, pid, "Pid no longer runs this worker");
            return Ok(());
        }
        let output = run_captured("kill", &["-9".to_string(), pid.to_string()])
            .await
            .map_err(|e| EngineError::Kill(format!("pid {}: {}", pid, e)))?;
        if output.success {
            info!(worker = %name, pid, "Killed local worker by pid");
        } else {
            debug!(worker = %name, pid, stderr = %output.stderr, "Local worker already gone");
        }
        Ok(())
    }

    async fn is_alive(&self, task: &Task) -> bool {
        let name = worker_name(task);
        {
            let mut children = self.children();
            if let Some(child) = children.get_mut(&name) {
                return match child.try_wait() {
                    Ok(None) => true,
                    Ok(Some(status)) => {
                        debug!(worker = %name, status = %status, "Local worker exited");
                        children.remove(&name);
                        false
                    }
                    Err(e) => {
                        warn!(worker = %name, error = %e, "Failed to poll local worker");
                        true
                    }
                };
            }
        }

        match task.run_pid {
            Some(pid) => owns_pid(task, pid).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use types::{Role, TaskStatus};

    fn task() -> Task {
        let now = Utc::now();
        Task {
            job_id: "job-1".to_string(),
            role: Role::Guest,
            party_id: "9999".to_string(),
            task_name: "reader_0".to_string(),
            component: "reader".to_string(),
            task_id: "job-1_reader_0".to_string(),
            task_version: 2,
            status: TaskStatus::Running,
            party_status: TaskStatus::Running,
            parameters: json!({}),
            inputs: json!({}),
            conf: json!({}),
            dependencies: Vec::new(),
            worker_id: None,
            run_pid: None,
            run_ip: None,
            error_report: None,
            create_time: now,
            update_time: now,
            start_time: None,
            end_time: None,
            elapsed: None,
        }
    }

    #[test]
    fn test_environ_matches_task_identity() {
        let environ = b"PATH=/usr/bin\0FATE_TASK_ID=job-1_reader_0\0FATE_TASK_VERSION=2\0FATE_ROLE=guest\0FATE_PARTY_ID=9999\0";
        assert!(environ_matches(environ, &task()));

        let mut older = task();
        older.task_version = 1;
        assert!(!environ_matches(environ, &older));
        assert!(!environ_matches(b"PATH=/usr/bin\0", &task()));
        assert!(!environ_matches(b"", &task()));
    }
}
