use std::collections::{BTreeMap, BTreeSet};

use types::Party;

use crate::error::{DagError, Result};

/// One task of the global graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub name: String,
    pub component: String,
    /// Declared and artifact-implied upstream tasks, for any party.
    pub dependencies: BTreeSet<String>,
    pub parties: Vec<Party>,
}

/// Acyclic task graph with a deterministic topological order.
#[derive(Debug, Clone, PartialEq)]
pub struct DagGraph {
    nodes: BTreeMap<String, GraphNode>,
    order: Vec<String>,
}

impl DagGraph {
    /// Validate edges and reject cycles.
    pub fn build(nodes: BTreeMap<String, GraphNode>) -> Result<Self> {
        for node in nodes.values() {
            for dependency in &node.dependencies {
                if !nodes.contains_key(dependency) {
                    return Err(DagError::UnknownDependency {
                        task: node.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        if let Some(cycle) = find_cycle(&nodes) {
            return Err(DagError::Cycle(cycle));
        }

        let order = topological_order(&nodes);
        Ok(Self { nodes, order })
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.nodes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Task names, upstream before downstream, ties broken by name.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().filter_map(move |name| self.nodes.get(name))
    }

    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.nodes.get(name).map(|n| &n.dependencies)
    }

    pub fn roots(&self) -> Vec<&str> {
        self.nodes()
            .filter(|n| n.dependencies.is_empty())
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Direct dependents of `name`.
    pub fn downstream(&self, name: &str) -> Vec<&str> {
        self.nodes()
            .filter(|n| n.dependencies.contains(name))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// `names` plus every task that transitively depends on one of them.
    pub fn downstream_closure<S: AsRef<str>>(&self, names: &[S]) -> BTreeSet<String> {
        let mut closure: BTreeSet<String> = names
            .iter()
            .map(|n| n.as_ref().to_string())
            .filter(|n| self.nodes.contains_key(n))
            .collect();

        // Topological order guarantees a single pass sees every upstream first.
        for node in self.nodes() {
            if node.dependencies.iter().any(|d| closure.contains(d)) {
                closure.insert(node.name.clone());
            }
        }
        closure
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS colouring. Returns the offending path when a back edge is found.
fn find_cycle(nodes: &BTreeMap<String, GraphNode>) -> Option<Vec<String>> {
    let mut colors: BTreeMap<&str, Color> =
        nodes.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    for name in nodes.keys() {
        if colors.get(name.as_str()) == Some(&Color::White) {
            if let Some(cycle) = visit(name, nodes, &mut colors, &mut stack) {
                return Some(cycle);
            }
        }
    }
    None
}

fn visit<'a>(
    name: &'a str,
    nodes: &'a BTreeMap<String, GraphNode>,
    colors: &mut BTreeMap<&'a str, Color>,
    stack: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    colors.insert(name, Color::Gray);
    stack.push(name);

    if let Some(node) = nodes.get(name) {
        for dependency in &node.dependencies {
            match colors.get(dependency.as_str()).copied() {
                Some(Color::Gray) => {
                    let start = stack
                        .iter()
                        .position(|n| *n == dependency.as_str())
                        .unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dependency.clone());
                    return Some(cycle);
                }
                Some(Color::White) => {
                    if let Some(cycle) = visit(dependency, nodes, colors, stack) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
    }

    stack.pop();
    colors.insert(name, Color::Black);
    None
}

/// Kahn's algorithm over an acyclic graph; the ready set is ordered by name.
fn topological_order(nodes: &BTreeMap<String, GraphNode>) -> Vec<String> {
    let mut remaining: BTreeMap<&str, usize> = nodes
        .values()
        .map(|n| (n.name.as_str(), n.dependencies.len()))
        .collect();
    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(name) = ready.pop_first() {
        remaining.remove(name);
        order.push(name.to_string());
        for node in nodes.values() {
            if node.dependencies.contains(name) {
                if let Some(count) = remaining.get_mut(node.name.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(node.name.as_str());
                    }
                }
            }
        }
    }
    order
}

/// A task as instantiated for one party.
#[derive(Debug, Clone, PartialEq)]
pub struct PartyTask {
    pub task_name: String,
    pub component: String,
    /// Upstream tasks inside the same party graph.
    pub dependencies: Vec<String>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub conf: serde_json::Map<String, serde_json::Value>,
    pub inputs: serde_json::Value,
}

/// The subset of the DAG one party executes.
#[derive(Debug, Clone, PartialEq)]
pub struct PartyTaskGraph {
    pub party: Party,
    tasks: BTreeMap<String, PartyTask>,
    order: Vec<String>,
}

impl PartyTaskGraph {
    pub(crate) fn new(party: Party, tasks: BTreeMap<String, PartyTask>, global: &DagGraph) -> Self {
        let order = global
            .topological_order()
            .iter()
            .filter(|name| tasks.contains_key(*name))
            .cloned()
            .collect();
        Self { party, tasks, order }
    }

    pub fn task(&self, name: &str) -> Option<&PartyTask> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Tasks in topological order.
    pub fn tasks(&self) -> impl Iterator<Item = &PartyTask> {
        self.order.iter().filter_map(move |name| self.tasks.get(name))
    }

    pub fn task_names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> (String, GraphNode) {
        (
            name.to_string(),
            GraphNode {
                name: name.to_string(),
                component: "c".to_string(),
                dependencies: deps.iter().map(|d| d.to_string()).collect(),
                parties: Vec::new(),
            },
        )
    }

    #[test]
    fn test_topological_order_is_deterministic() {
        let graph = DagGraph::build(
            vec![
                node("z_root", &[]),
                node("a_root", &[]),
                node("join", &["z_root", "a_root"]),
                node("m_mid", &["a_root"]),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();

        assert_eq!(graph.topological_order(), ["a_root", "m_mid", "z_root", "join"]);
        assert_eq!(graph.roots(), vec!["a_root", "z_root"]);
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = DagGraph::build(
            vec![node("a", &["c"]), node("b", &["a"]), node("c", &["b"])]
                .into_iter()
                .collect(),
        )
        .unwrap_err();

        match err {
            DagError::Cycle(path) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DagGraph::build(vec![node("a", &["a"])].into_iter().collect()).unwrap_err();
        assert_eq!(err, DagError::Cycle(vec!["a".to_string(), "a".to_string()]));
    }

    #[test]
    fn test_downstream_closure() {
        let graph = DagGraph::build(
            vec![
                node("reader", &[]),
                node("psi", &["reader"]),
                node("lr", &["psi"]),
                node("eval", &["lr"]),
                node("stats", &["reader"]),
            ]
            .into_iter()
            .collect(),
        )
        .unwrap();

        let closure = graph.downstream_closure(&["psi"]);
        let expected: BTreeSet<String> = ["psi", "lr", "eval"].iter().map(|s| s.to_string()).collect();
        assert_eq!(closure, expected);
        assert_eq!(graph.downstream("reader"), vec!["psi", "stats"]);
        assert!(graph.downstream_closure(&["missing"]).is_empty());
    }
}
