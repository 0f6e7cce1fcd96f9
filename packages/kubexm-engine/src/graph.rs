use crate::action::{Action, RetryPolicy};
use crate::error::{EngineError, Result};
use kubexm_api::Host;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Stable node identifier, unique within one pipeline plan. Lexicographic
/// ordering of ids drives every deterministic iteration in the planner
/// and executor, so plans are reproducible and logs diffable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Atomic unit of the execution graph: one action bound to its target
/// hosts, dependencies and failure policy. An empty host set means "run
/// once on the control node".
#[derive(Clone)]
pub struct ExecutionNode {
    pub id: NodeId,
    pub name: String,
    pub action: Arc<dyn Action>,
    pub hosts: Vec<Host>,
    pub dependencies: BTreeSet<NodeId>,
    pub retry: RetryPolicy,
    pub timeout: Option<Duration>,
    pub ignore_failure: bool,
    /// Cache-scope labels; actions resolve their module/task caches at
    /// run time through these.
    pub module: String,
    pub task: String,
}

impl ExecutionNode {
    pub fn new(id: impl Into<NodeId>, name: impl Into<String>, action: Arc<dyn Action>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action,
            hosts: Vec::new(),
            dependencies: BTreeSet::new(),
            retry: RetryPolicy::default(),
            timeout: None,
            ignore_failure: false,
            module: String::new(),
            task: String::new(),
        }
    }

    pub fn on_hosts(mut self, hosts: Vec<Host>) -> Self {
        self.hosts = hosts;
        self
    }

    pub fn after<I>(mut self, deps: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<NodeId>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ignoring_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    pub fn in_scope(mut self, module: impl Into<String>, task: impl Into<String>) -> Self {
        self.module = module.into();
        self.task = task.into();
        self
    }

    pub fn host_names(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }

    /// Structural equality used for merge deduplication: same action
    /// (shared instance or identical description), same host sequence,
    /// same retry policy.
    pub fn structurally_equal(&self, other: &Self) -> bool {
        let same_action = Arc::ptr_eq(&self.action, &other.action)
            || self.action.describe() == other.action.describe();
        same_action
            && self.host_names() == other.host_names()
            && self.retry == other.retry
    }
}

impl fmt::Debug for ExecutionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("action", &self.action.describe())
            .field("hosts", &self.host_names())
            .field("dependencies", &self.dependencies)
            .field("retry", &self.retry)
            .field("ignore_failure", &self.ignore_failure)
            .finish()
    }
}

/// A partial execution graph with declared entry/exit frontiers. Emitted
/// by tasks, composed by modules and the pipeline, frozen once the
/// pipeline plan is returned.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFragment {
    pub nodes: BTreeMap<NodeId, ExecutionNode>,
    pub entry_nodes: BTreeSet<NodeId>,
    pub exit_nodes: BTreeSet<NodeId>,
}

impl ExecutionFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn get(&self, id: &NodeId) -> Option<&ExecutionNode> {
        self.nodes.get(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    /// Insert a node. A duplicate id is accepted only when the node is
    /// structurally equal to the one already present.
    pub fn add_node(&mut self, node: ExecutionNode) -> Result<()> {
        if let Some(existing) = self.nodes.get(&node.id) {
            if !existing.structurally_equal(&node) {
                return Err(EngineError::DuplicateNodeMismatch(node.id.to_string()));
            }
            return Ok(());
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Union of two fragments. Shared ids must be structurally equal;
    /// frontiers are NOT combined - callers recompute them with
    /// `calculate_frontiers` after composition.
    pub fn merge(a: Self, b: Self) -> Result<Self> {
        let mut merged = a;
        for (id, node) in b.nodes {
            if let Some(existing) = merged.nodes.get(&id) {
                if !existing.structurally_equal(&node) {
                    return Err(EngineError::DuplicateNodeMismatch(id.to_string()));
                }
                // Keep the first emission; union the dependency sets so a
                // node duplicated across tasks retains every edge.
                let deps: Vec<NodeId> = node.dependencies.iter().cloned().collect();
                merged
                    .nodes
                    .get_mut(&id)
                    .expect("checked above")
                    .dependencies
                    .extend(deps);
            } else {
                merged.nodes.insert(id, node);
            }
        }
        Ok(merged)
    }

    /// Add every predecessor to the dependency set of every successor.
    pub fn link(
        &mut self,
        predecessors: &BTreeSet<NodeId>,
        successors: &BTreeSet<NodeId>,
    ) -> Result<()> {
        for pred in predecessors {
            if !self.nodes.contains_key(pred) {
                return Err(EngineError::UnknownPredecessor(pred.to_string()));
            }
        }
        for succ in successors {
            if !self.nodes.contains_key(succ) {
                return Err(EngineError::UnknownSuccessor(succ.to_string()));
            }
        }
        for succ in successors {
            let node = self.nodes.get_mut(succ).expect("checked above");
            node.dependencies.extend(predecessors.iter().cloned());
        }
        Ok(())
    }

    /// Recompute the entry/exit frontiers from the node map. Entries are
    /// nodes with no dependency inside the fragment (external ids do not
    /// count); exits are nodes no other node depends on. Idempotent.
    pub fn calculate_frontiers(&mut self) {
        let ids: BTreeSet<NodeId> = self.nodes.keys().cloned().collect();

        self.entry_nodes = self
            .nodes
            .values()
            .filter(|n| n.dependencies.iter().all(|d| !ids.contains(d)))
            .map(|n| n.id.clone())
            .collect();

        let mut depended_on: BTreeSet<NodeId> = BTreeSet::new();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                depended_on.insert(dep.clone());
            }
        }
        self.exit_nodes = ids.difference(&depended_on).cloned().collect();
    }

    /// Final structural check before the executor may receive the graph.
    /// Unknown dependencies and cycles are fatal; nodes unreachable from
    /// any entry are allowed but logged.
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                if !self.nodes.contains_key(dep) {
                    return Err(EngineError::DanglingDependency {
                        node: node.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
            }
        }

        // DFS colouring: white = unvisited, grey = on stack, black = done.
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }
        let mut colour: BTreeMap<&NodeId, Colour> =
            self.nodes.keys().map(|id| (id, Colour::White)).collect();

        for start in self.nodes.keys() {
            if colour[start] != Colour::White {
                continue;
            }
            // Iterative DFS over dependency edges.
            let mut stack: Vec<(&NodeId, bool)> = vec![(start, false)];
            while let Some((id, children_done)) = stack.pop() {
                if children_done {
                    colour.insert(id, Colour::Black);
                    continue;
                }
                match colour[id] {
                    Colour::Black => continue,
                    Colour::Grey => continue,
                    Colour::White => {}
                }
                colour.insert(id, Colour::Grey);
                stack.push((id, true));
                for dep in &self.nodes[id].dependencies {
                    match colour[dep] {
                        Colour::White => stack.push((dep, false)),
                        Colour::Grey => {
                            return Err(EngineError::CycleDetected(format!(
                                "{} -> {}",
                                id, dep
                            )));
                        }
                        Colour::Black => {}
                    }
                }
            }
        }

        // Orphans: nodes unreachable from any entry, walking forward.
        if !self.entry_nodes.is_empty() {
            let mut downstream: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
            for node in self.nodes.values() {
                for dep in &node.dependencies {
                    downstream.entry(dep).or_default().push(&node.id);
                }
            }
            let mut reached: BTreeSet<&NodeId> = BTreeSet::new();
            let mut queue: Vec<&NodeId> = self.entry_nodes.iter().collect();
            while let Some(id) = queue.pop() {
                if !reached.insert(id) {
                    continue;
                }
                if let Some(next) = downstream.get(id) {
                    queue.extend(next.iter().copied());
                }
            }
            for id in self.nodes.keys() {
                if !reached.contains(id) {
                    warn!(node = %id, "node is unreachable from any entry node");
                }
            }
        }

        Ok(())
    }

    /// Deterministic Kahn layering: each layer holds the nodes whose
    /// dependencies are all satisfied by earlier layers, in lexicographic
    /// id order. Fails on cycles.
    pub fn topo_order(&self) -> Result<Vec<Vec<NodeId>>> {
        let mut indegree: BTreeMap<&NodeId, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id, n.dependencies.len()))
            .collect();
        let mut downstream: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for node in self.nodes.values() {
            for dep in &node.dependencies {
                downstream.entry(dep).or_default().push(&node.id);
            }
        }

        let mut layers = Vec::new();
        let mut done = 0usize;
        let mut ready: Vec<&NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        while !ready.is_empty() {
            ready.sort();
            let layer: Vec<NodeId> = ready.iter().map(|id| (*id).clone()).collect();
            let mut next = Vec::new();
            for id in ready {
                done += 1;
                if let Some(dependents) = downstream.get(id) {
                    for dep in dependents {
                        let d = indegree.get_mut(dep).expect("dependent is a node");
                        *d -= 1;
                        if *d == 0 {
                            next.push(*dep);
                        }
                    }
                }
            }
            layers.push(layer);
            ready = next;
        }

        if done < self.nodes.len() {
            return Err(EngineError::CycleDetected(
                "graph has no topological order".to_string(),
            ));
        }
        Ok(layers)
    }

    /// Human-readable plan listing, one phase per topological layer.
    pub fn render(&self) -> Result<String> {
        let layers = self.topo_order()?;
        let lines: Vec<String> = layers
            .iter()
            .enumerate()
            .map(|(i, layer)| {
                let names: Vec<&str> = layer.iter().map(|id| id.as_str()).collect();
                if names.len() > 1 {
                    format!("Phase {}: {} (parallel)", i + 1, names.join(" | "))
                } else {
                    format!("Phase {}: {}", i + 1, names[0])
                }
            })
            .collect();
        Ok(lines.join("\n"))
    }
}
