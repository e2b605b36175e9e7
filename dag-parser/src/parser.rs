use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::debug;
use types::dag::{ArtifactChannel, DagSchema, TaskSpec, PIPELINE_PRODUCER};
use types::{JobConf, Party, Role};

use crate::error::{DagError, Result};
use crate::graph::{DagGraph, GraphNode, PartyTask, PartyTaskGraph};

/// A validated DAG, decomposed per party.
#[derive(Debug, Clone)]
pub struct ParsedDag {
    pub schema: DagSchema,
    pub conf: JobConf,
    pub graph: DagGraph,
    pub party_graphs: BTreeMap<Party, PartyTaskGraph>,
}

impl ParsedDag {
    pub fn parties(&self) -> Vec<Party> {
        self.schema.parties()
    }

    pub fn party_graph(&self, party: &Party) -> Option<&PartyTaskGraph> {
        self.party_graphs.get(party)
    }
}

/// Upstream edge with an optional role restriction.
struct Edge {
    producer: String,
    roles: Option<Vec<Role>>,
}

impl Edge {
    fn applies_to(&self, role: Role) -> bool {
        self.roles.as_ref().map_or(true, |roles| roles.contains(&role))
    }
}

/// Parse a DAG schema from its JSON document.
pub fn parse_value(document: &Value) -> Result<ParsedDag> {
    let schema: DagSchema = serde_json::from_value(document.clone())
        .map_err(|e| DagError::InvalidSchema(e.to_string()))?;
    parse(schema)
}

pub fn parse(schema: DagSchema) -> Result<ParsedDag> {
    let job_parties = schema.parties();
    if job_parties.is_empty() {
        return Err(DagError::InvalidSchema("DAG declares no parties".to_string()));
    }

    let conf: JobConf = serde_json::from_value(Value::Object(schema.dag.conf.clone()))
        .map_err(|e| DagError::InvalidSchema(format!("job conf: {}", e)))?;

    for (label, party_task) in &schema.dag.party_tasks {
        for task_name in party_task.tasks.keys() {
            if !schema.dag.tasks.contains_key(task_name) {
                return Err(DagError::InvalidSchema(format!(
                    "party_tasks {} overrides unknown task {}",
                    label, task_name
                )));
            }
        }
    }

    let mut edges: BTreeMap<String, Vec<Edge>> = BTreeMap::new();
    let mut nodes: BTreeMap<String, GraphNode> = BTreeMap::new();

    for (name, task) in &schema.dag.tasks {
        let parties = task_parties(name, task, &job_parties)?;
        let task_edges = resolve_edges(name, task, &schema)?;

        nodes.insert(
            name.clone(),
            GraphNode {
                name: name.clone(),
                component: task.component_ref.clone(),
                dependencies: task_edges.iter().map(|e| e.producer.clone()).collect(),
                parties,
            },
        );
        edges.insert(name.clone(), task_edges);
    }

    let graph = DagGraph::build(nodes)?;

    let mut party_graphs = BTreeMap::new();
    for party in &job_parties {
        let party_graph = decompose(party, &schema, &graph, &edges)?;
        party_graphs.insert(party.clone(), party_graph);
    }

    debug!(
        tasks = graph.len(),
        parties = party_graphs.len(),
        "Parsed DAG"
    );

    Ok(ParsedDag {
        schema,
        conf,
        graph,
        party_graphs,
    })
}

fn task_parties(name: &str, task: &TaskSpec, job_parties: &[Party]) -> Result<Vec<Party>> {
    let Some(specs) = &task.parties else {
        return Ok(job_parties.to_vec());
    };

    let mut parties = Vec::new();
    for party in specs.iter().flat_map(|s| s.parties()) {
        if !job_parties.contains(&party) {
            return Err(DagError::InvalidSchema(format!(
                "task {} runs on {} which is not a job party",
                name, party
            )));
        }
        if !parties.contains(&party) {
            parties.push(party);
        }
    }
    Ok(parties)
}

/// Declared dependencies plus one edge per task-output input.
fn resolve_edges(name: &str, task: &TaskSpec, schema: &DagSchema) -> Result<Vec<Edge>> {
    let mut edges: Vec<Edge> = Vec::new();

    for dependency in &task.dependent_tasks {
        if !schema.dag.tasks.contains_key(dependency) {
            return Err(DagError::UnknownDependency {
                task: name.to_string(),
                dependency: dependency.clone(),
            });
        }
        edges.push(Edge {
            producer: dependency.clone(),
            roles: None,
        });
    }

    for (kind, key, channel) in task.inputs.channels() {
        // Warehouse inputs come from earlier jobs and never order this one.
        let ArtifactChannel::TaskOutputArtifact(refs) = channel else {
            continue;
        };
        for artifact in refs.iter() {
            if artifact.producer_task == PIPELINE_PRODUCER {
                continue;
            }
            if !schema.dag.tasks.contains_key(&artifact.producer_task) {
                return Err(DagError::UnknownProducer {
                    task: name.to_string(),
                    kind: kind.as_str(),
                    key: key.clone(),
                    producer: artifact.producer_task.clone(),
                });
            }
            edges.push(Edge {
                producer: artifact.producer_task.clone(),
                roles: artifact.roles.clone(),
            });
        }
    }

    Ok(edges)
}

fn decompose(
    party: &Party,
    schema: &DagSchema,
    graph: &DagGraph,
    edges: &BTreeMap<String, Vec<Edge>>,
) -> Result<PartyTaskGraph> {
    let members: BTreeSet<&str> = graph
        .nodes()
        .filter(|n| n.parties.contains(party))
        .map(|n| n.name.as_str())
        .collect();

    let mut tasks = BTreeMap::new();
    for name in &members {
        let Some(spec) = schema.dag.tasks.get(*name) else {
            continue;
        };

        let mut dependencies: Vec<String> = Vec::new();
        for edge in edges.get(*name).into_iter().flatten() {
            if edge.applies_to(party.role)
                && members.contains(edge.producer.as_str())
                && !dependencies.contains(&edge.producer)
            {
                dependencies.push(edge.producer.clone());
            }
        }
        dependencies.sort();

        let mut conf = schema.dag.conf.clone();
        merge_json(&mut conf, &spec.conf);
        let mut parameters = spec.parameters.clone();

        for party_task in schema.dag.party_tasks.values() {
            if !party_task.parties.iter().any(|s| s.contains(party)) {
                continue;
            }
            merge_json(&mut conf, &party_task.conf);
            if let Some(overrides) = party_task.tasks.get(*name) {
                merge_json(&mut conf, &overrides.conf);
                merge_json(&mut parameters, &overrides.parameters);
            }
        }

        let inputs = serde_json::to_value(&spec.inputs)
            .map_err(|e| DagError::InvalidSchema(format!("inputs of {}: {}", name, e)))?;

        tasks.insert(
            name.to_string(),
            PartyTask {
                task_name: name.to_string(),
                component: spec.component_ref.clone(),
                dependencies,
                parameters,
                conf,
                inputs,
            },
        );
    }

    Ok(PartyTaskGraph::new(party.clone(), tasks, graph))
}

/// Recursive object merge; `overlay` wins on conflicts.
pub fn merge_json(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_json(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_party_dag(tasks: Value) -> Value {
        json!({
            "dag": {
                "parties": [
                    {"role": "guest", "party_id": ["9999"]},
                    {"role": "host", "party_id": ["10000"]}
                ],
                "conf": {"task_parallelism": 2},
                "tasks": tasks
            },
            "schema_version": "2.0.0"
        })
    }

    fn guest() -> Party {
        Party::new(Role::Guest, "9999")
    }

    fn host() -> Party {
        Party::new(Role::Host, "10000")
    }

    #[test]
    fn test_artifact_reference_implies_dependency() {
        let parsed = parse_value(&two_party_dag(json!({
            "reader_0": {"component_ref": "reader"},
            "psi_0": {
                "component_ref": "psi",
                "inputs": {"data": {"input_data": {"task_output_artifact": {
                    "producer_task": "reader_0", "output_artifact_key": "output_data"
                }}}}
            }
        })))
        .unwrap();

        assert_eq!(parsed.graph.topological_order(), ["reader_0", "psi_0"]);
        assert_eq!(parsed.graph.roots(), vec!["reader_0"]);
        let psi = parsed.party_graph(&guest()).unwrap().task("psi_0").unwrap();
        assert_eq!(psi.dependencies, vec!["reader_0".to_string()]);
        assert_eq!(parsed.conf.task_parallelism, Some(2));
    }

    #[test]
    fn test_pipeline_producer_creates_no_edge() {
        let parsed = parse_value(&two_party_dag(json!({
            "reader_0": {
                "component_ref": "reader",
                "inputs": {"data": {"table": {"task_output_artifact": {
                    "producer_task": "pipeline", "output_artifact_key": "input"
                }}}}
            }
        })))
        .unwrap();

        assert!(parsed.graph.dependencies("reader_0").unwrap().is_empty());
    }

    #[test]
    fn test_cycle_through_artifacts_is_rejected() {
        let err = parse_value(&two_party_dag(json!({
            "a": {
                "component_ref": "x",
                "inputs": {"model": {"m": {"task_output_artifact": {
                    "producer_task": "b", "output_artifact_key": "output_model"
                }}}}
            },
            "b": {"component_ref": "y", "dependent_tasks": ["a"]}
        })))
        .unwrap_err();

        assert!(matches!(err, DagError::Cycle(_)));
    }

    #[test]
    fn test_unknown_references_are_structural_errors() {
        let err = parse_value(&two_party_dag(json!({
            "a": {"component_ref": "x", "dependent_tasks": ["ghost"]}
        })))
        .unwrap_err();
        assert_eq!(
            err,
            DagError::UnknownDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string()
            }
        );

        let err = parse_value(&two_party_dag(json!({
            "a": {
                "component_ref": "x",
                "inputs": {"cache": {"c": {"task_output_artifact": {
                    "producer_task": "ghost", "output_artifact_key": "k"
                }}}}
            }
        })))
        .unwrap_err();
        assert!(matches!(err, DagError::UnknownProducer { kind: "cache", .. }));
    }

    #[test]
    fn test_party_graph_is_restricted_to_task_parties() {
        let parsed = parse_value(&two_party_dag(json!({
            "reader_0": {"component_ref": "reader"},
            "guest_only": {
                "component_ref": "lr",
                "dependent_tasks": ["reader_0"],
                "parties": [{"role": "guest", "party_id": ["9999"]}]
            },
            "eval_0": {"component_ref": "eval", "dependent_tasks": ["guest_only"]}
        })))
        .unwrap();

        let host_graph = parsed.party_graph(&host()).unwrap();
        assert!(!host_graph.contains("guest_only"));
        assert_eq!(host_graph.task_names(), ["reader_0", "eval_0"]);
        // Upstream outside the party graph is not a local dependency.
        assert!(host_graph.task("eval_0").unwrap().dependencies.is_empty());

        for graph in parsed.party_graphs.values() {
            for task in graph.tasks() {
                for dep in &task.dependencies {
                    assert!(graph.contains(dep));
                }
            }
        }
    }

    #[test]
    fn test_role_restricted_edge_applies_only_to_that_role() {
        let parsed = parse_value(&two_party_dag(json!({
            "reader_0": {"component_ref": "reader"},
            "lr_0": {
                "component_ref": "lr",
                "inputs": {"data": {"train": {"task_output_artifact": {
                    "producer_task": "reader_0",
                    "output_artifact_key": "output_data",
                    "roles": ["guest"]
                }}}}
            }
        })))
        .unwrap();

        let guest_lr = parsed.party_graph(&guest()).unwrap().task("lr_0").unwrap();
        let host_lr = parsed.party_graph(&host()).unwrap().task("lr_0").unwrap();
        assert_eq!(guest_lr.dependencies, vec!["reader_0".to_string()]);
        assert!(host_lr.dependencies.is_empty());
        // The global graph keeps the edge.
        assert!(parsed.graph.dependencies("lr_0").unwrap().contains("reader_0"));
    }

    #[test]
    fn test_party_overrides_win() {
        let mut document = two_party_dag(json!({
            "lr_0": {
                "component_ref": "lr",
                "parameters": {"epochs": 10, "optimizer": {"method": "sgd", "alpha": 0.1}},
                "conf": {"task_cores": 2}
            }
        }));
        document["dag"]["party_tasks"] = json!({
            "guest_9999": {
                "parties": [{"role": "guest", "party_id": ["9999"]}],
                "tasks": {
                    "lr_0": {
                        "parameters": {"optimizer": {"alpha": 0.5}},
                        "conf": {"task_cores": 8}
                    }
                }
            }
        });
        let parsed = parse_value(&document).unwrap();

        let guest_lr = parsed.party_graph(&guest()).unwrap().task("lr_0").unwrap();
        assert_eq!(guest_lr.parameters["epochs"], json!(10));
        assert_eq!(guest_lr.parameters["optimizer"], json!({"method": "sgd", "alpha": 0.5}));
        assert_eq!(guest_lr.conf["task_cores"], json!(8));
        assert_eq!(guest_lr.conf["task_parallelism"], json!(2));

        let host_lr = parsed.party_graph(&host()).unwrap().task("lr_0").unwrap();
        assert_eq!(host_lr.parameters["optimizer"]["alpha"], json!(0.1));
        assert_eq!(host_lr.conf["task_cores"], json!(2));
    }

    #[test]
    fn test_schema_without_parties_is_rejected() {
        let err = parse_value(&json!({"dag": {"parties": [], "tasks": {}}})).unwrap_err();
        assert!(matches!(err, DagError::InvalidSchema(_)));
    }

    #[test]
    fn test_empty_task_set_is_valid() {
        let parsed = parse_value(&two_party_dag(json!({}))).unwrap();
        assert!(parsed.graph.is_empty());
        assert!(parsed.party_graph(&guest()).unwrap().is_empty());
    }
}
