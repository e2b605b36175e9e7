use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Where a task worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineDevice {
    Local,
    Docker,
    K8s,
}

impl EngineDevice {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineDevice::Local => "local",
            EngineDevice::Docker => "docker",
            EngineDevice::K8s => "k8s",
        }
    }
}

impl fmt::Display for EngineDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineDevice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(EngineDevice::Local),
            "docker" => Ok(EngineDevice::Docker),
            "k8s" => Ok(EngineDevice::K8s),
            other => Err(format!("Unknown engine device: {}", other)),
        }
    }
}

/// Compute backend the worker talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputingEngine {
    Standalone,
    Eggroll,
    Spark,
}

impl ComputingEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputingEngine::Standalone => "standalone",
            ComputingEngine::Eggroll => "eggroll",
            ComputingEngine::Spark => "spark",
        }
    }
}

impl fmt::Display for ComputingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComputingEngine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(ComputingEngine::Standalone),
            "eggroll" => Ok(ComputingEngine::Eggroll),
            "spark" => Ok(ComputingEngine::Spark),
            other => Err(format!("Unknown computing engine: {}", other)),
        }
    }
}
