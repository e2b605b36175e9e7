use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::party::{Party, Role};

/// Producer name that refers to data handed in from outside the job.
pub const PIPELINE_PRODUCER: &str = "pipeline";

/// Submitted DAG document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSchema {
    pub dag: DagSpec,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

fn default_schema_version() -> String {
    "2.0.0".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagSpec {
    pub parties: Vec<PartySpec>,
    #[serde(default)]
    pub conf: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub tasks: BTreeMap<String, TaskSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub party_tasks: BTreeMap<String, PartyTaskSpec>,
}

/// A role with one or more party ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartySpec {
    pub role: Role,
    pub party_id: Vec<String>,
}

impl PartySpec {
    pub fn parties(&self) -> impl Iterator<Item = Party> + '_ {
        self.party_id
            .iter()
            .map(move |id| Party::new(self.role, id.clone()))
    }

    pub fn contains(&self, party: &Party) -> bool {
        self.role == party.role && self.party_id.iter().any(|id| *id == party.party_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub component_ref: String,
    #[serde(default)]
    pub dependent_tasks: Vec<String>,
    /// Restricts the task to these parties; absent means every job party.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parties: Option<Vec<PartySpec>>,
    #[serde(default)]
    pub conf: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub inputs: InputSpec,
}

/// Inputs grouped by kind. Each kind resolves against its own upstream
/// output namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, ArtifactChannel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model: BTreeMap<String, ArtifactChannel>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cache: BTreeMap<String, ArtifactChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Data,
    Model,
    Cache,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Data => "data",
            ArtifactKind::Model => "model",
            ArtifactKind::Cache => "cache",
        }
    }
}

impl InputSpec {
    pub fn channels(&self) -> impl Iterator<Item = (ArtifactKind, &String, &ArtifactChannel)> {
        self.data
            .iter()
            .map(|(k, c)| (ArtifactKind::Data, k, c))
            .chain(self.model.iter().map(|(k, c)| (ArtifactKind::Model, k, c)))
            .chain(self.cache.iter().map(|(k, c)| (ArtifactKind::Cache, k, c)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactChannel {
    TaskOutputArtifact(OneOrMany<TaskOutputArtifactRef>),
    ModelWarehouse(ModelWarehouseRef),
    DataWarehouse(DataWarehouseRef),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item).iter(),
            OneOrMany::Many(items) => items.iter(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutputArtifactRef {
    pub producer_task: String,
    pub output_artifact_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Role>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelWarehouseRef {
    pub model_id: String,
    pub model_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_artifact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Role>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataWarehouseRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_task: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_artifact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<Role>>,
}

/// Per-party overrides, keyed by a free label such as `guest_9999`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartyTaskSpec {
    pub parties: Vec<PartySpec>,
    #[serde(default)]
    pub conf: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub tasks: BTreeMap<String, PartyTaskRefSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartyTaskRefSpec {
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub conf: serde_json::Map<String, serde_json::Value>,
}

impl DagSchema {
    pub fn parties(&self) -> Vec<Party> {
        self.dag.parties.iter().flat_map(|p| p.parties()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_schema_with_all_channel_kinds() {
        let schema: DagSchema = serde_json::from_value(json!({
            "dag": {
                "parties": [
                    {"role": "guest", "party_id": ["9999"]},
                    {"role": "host", "party_id": ["10000"]}
                ],
                "conf": {"auto_retries": 1},
                "tasks": {
                    "reader_0": {"component_ref": "reader"},
                    "psi_0": {
                        "component_ref": "psi",
                        "inputs": {
                            "data": {
                                "input_data": {
                                    "task_output_artifact": {
                                        "producer_task": "reader_0",
                                        "output_artifact_key": "output_data"
                                    }
                                }
                            },
                            "model": {
                                "warm_start": {
                                    "model_warehouse": {
                                        "model_id": "m1",
                                        "model_version": "0"
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }))
        .unwrap();

        assert_eq!(schema.schema_version, "2.0.0");
        assert_eq!(schema.parties().len(), 2);
        let psi = &schema.dag.tasks["psi_0"];
        let kinds: Vec<ArtifactKind> = psi.inputs.channels().map(|(k, _, _)| k).collect();
        assert_eq!(kinds, vec![ArtifactKind::Data, ArtifactKind::Model]);
        match &psi.inputs.data["input_data"] {
            ArtifactChannel::TaskOutputArtifact(refs) => {
                assert_eq!(refs.iter().next().unwrap().producer_task, "reader_0");
            }
            other => panic!("unexpected channel {:?}", other),
        }
    }
}
