// DAG documents and submission requests

use serde_json::{json, Value};
use types::CreateAllRequest;

use super::{HOST_PARTY, SCHEDULER_PARTY};

/// Guest on the scheduler party, host on the other one.
pub fn two_party_dag(tasks: Value, conf: Value) -> Value {
    json!({
        "dag": {
            "parties": [
                {"role": "guest", "party_id": [SCHEDULER_PARTY]},
                {"role": "host", "party_id": [HOST_PARTY]}
            ],
            "conf": conf,
            "tasks": tasks
        },
        "schema_version": "2.0.0"
    })
}

/// `reader_0 -> psi_0`, both on every party.
pub fn reader_psi_dag(conf: Value) -> Value {
    two_party_dag(
        json!({
            "reader_0": {"component_ref": "reader"},
            "psi_0": {
                "component_ref": "psi",
                "inputs": {"data": {"input_data": {"task_output_artifact": {
                    "producer_task": "reader_0", "output_artifact_key": "output_data"
                }}}}
            }
        }),
        conf,
    )
}

pub fn single_task_dag(conf: Value) -> Value {
    two_party_dag(json!({"reader_0": {"component_ref": "reader"}}), conf)
}

pub fn submit_request(job_id: &str, dag: Value) -> CreateAllRequest {
    CreateAllRequest {
        dag,
        config: json!({}),
        flow_id: None,
        job_id: Some(job_id.to_string()),
    }
}
