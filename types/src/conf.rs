use serde::{Deserialize, Serialize};

use crate::engine::ComputingEngine;

/// How the scheduler learns task status from parties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Poll,
    Callback,
}

impl std::str::FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poll" => Ok(SyncType::Poll),
            "callback" => Ok(SyncType::Callback),
            other => Err(format!("Unknown sync type: {}", other)),
        }
    }
}

/// Job conf as written in a DAG schema; every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobConf {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_parallelism: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_cores: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retries: Option<u32>,
    /// Seconds between a failure and its automatic retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_retry_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_type: Option<SyncType>,
    /// Seconds a job may stay RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computing_engine: Option<ComputingEngine>,
}

/// Fallbacks for every [`JobConf`] field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefaults {
    pub priority: i32,
    pub task_parallelism: u32,
    pub task_cores: u32,
    pub auto_retries: u32,
    pub auto_retry_delay: u64,
    pub sync_type: SyncType,
    pub timeout: u64,
    pub computing_engine: ComputingEngine,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            priority: 0,
            task_parallelism: 1,
            task_cores: 4,
            auto_retries: 0,
            auto_retry_delay: 1,
            sync_type: SyncType::Poll,
            timeout: 3 * 24 * 60 * 60,
            computing_engine: ComputingEngine::Standalone,
        }
    }
}

/// Job conf with defaults applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveJobConf {
    pub priority: i32,
    pub task_parallelism: u32,
    pub task_cores: u32,
    pub auto_retries: u32,
    pub auto_retry_delay: u64,
    pub sync_type: SyncType,
    pub timeout: u64,
    pub computing_engine: ComputingEngine,
}

impl JobConf {
    /// Read `dag.conf` from a stored DAG document; absent conf is empty.
    pub fn from_dag_document(document: &serde_json::Value) -> serde_json::Result<Self> {
        match document.pointer("/dag/conf") {
            Some(conf) => serde_json::from_value(conf.clone()),
            None => Ok(Self::default()),
        }
    }

    pub fn resolve(&self, defaults: &JobDefaults) -> EffectiveJobConf {
        EffectiveJobConf {
            priority: self.priority.unwrap_or(defaults.priority),
            task_parallelism: self
                .task_parallelism
                .unwrap_or(defaults.task_parallelism)
                .max(1),
            task_cores: self.task_cores.unwrap_or(defaults.task_cores),
            auto_retries: self.auto_retries.unwrap_or(defaults.auto_retries),
            auto_retry_delay: self.auto_retry_delay.unwrap_or(defaults.auto_retry_delay),
            sync_type: self.sync_type.unwrap_or(defaults.sync_type),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            computing_engine: self.computing_engine.unwrap_or(defaults.computing_engine),
        }
    }
}

impl EffectiveJobConf {
    /// Cores a RUNNING job may hold at most.
    pub fn requested_cores(&self) -> u32 {
        self.task_cores * self.task_parallelism
    }
}
