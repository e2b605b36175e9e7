use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DagError {
    #[error("Invalid DAG schema: {0}")]
    InvalidSchema(String),

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Task {task} reads {kind} input {key} from unknown producer {producer}")]
    UnknownProducer {
        task: String,
        kind: &'static str,
        key: String,
        producer: String,
    },

    #[error("Dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),
}

pub type Result<T> = std::result::Result<T, DagError>;
