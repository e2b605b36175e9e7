pub mod error;
pub mod graph;
pub mod parser;

pub use error::{DagError, Result};
pub use graph::{DagGraph, GraphNode, PartyTask, PartyTaskGraph};
pub use parser::{merge_json, parse, parse_value, ParsedDag};
