//! Build Graph - arena-backed graph of file nodes and build rules
//!
//! - Node: a file path, produced by at most one rule, consumed by many
//! - Rule: command turning input nodes into output nodes
//! - Graph: owns every node and rule, cross-linked by index handles
//!
//! The node/rule topology is cyclic from the point of view of references
//! (node -> producer rule -> input nodes -> ...), so nodes and rules live in
//! stable vectors and everything links through `NodeId` / `RuleId`.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use crate::error::FalconError;

/// Handle to a node in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Handle to a rule in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(pub(crate) usize);

/// Build state of a node or rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    UpToDate,
    OutOfDate,
}

/// A file in the build graph.
#[derive(Debug)]
pub struct Node {
    path: String,
    /// Rule that generates this node. `None` for source files.
    producer: Option<RuleId>,
    /// Rules that take this node as an input. Empty for root nodes.
    consumers: Vec<RuleId>,
    state: State,
    hash: Option<String>,
    previous_hash: Option<String>,
    mtime: Option<u64>,
    previous_mtime: Option<u64>,
}

impl Node {
    fn new(path: String) -> Self {
        Self {
            path,
            producer: None,
            consumers: Vec::new(),
            state: State::OutOfDate,
            hash: None,
            previous_hash: None,
            mtime: None,
            previous_mtime: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn producer(&self) -> Option<RuleId> {
        self.producer
    }

    pub fn consumers(&self) -> &[RuleId] {
        &self.consumers
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == State::OutOfDate
    }

    /// True when no rule produces this node.
    pub fn is_source(&self) -> bool {
        self.producer.is_none()
    }

    /// True when no rule consumes this node.
    pub fn is_root(&self) -> bool {
        self.consumers.is_empty()
    }

    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    pub fn previous_hash(&self) -> Option<&str> {
        self.previous_hash.as_deref()
    }

    /// Record a newly observed content hash, keeping the old one around.
    pub fn update_hash(&mut self, hash: String) {
        self.previous_hash = self.hash.take();
        self.hash = Some(hash);
    }

    /// Seed the previous hash from persistent storage at scan time.
    pub fn set_previous_hash(&mut self, hash: Option<String>) {
        self.previous_hash = hash;
    }

    pub fn mtime(&self) -> Option<u64> {
        self.mtime
    }

    pub fn update_mtime(&mut self, mtime: u64) {
        self.previous_mtime = self.mtime.take();
        self.mtime = Some(mtime);
    }

    pub fn previous_mtime(&self) -> Option<u64> {
        self.previous_mtime
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

/// A build edge: inputs, outputs, and the command linking them.
#[derive(Debug)]
pub struct Rule {
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
    /// Command to execute. Empty string means a phony rule: it only groups
    /// dependencies and propagates state.
    command: String,
    /// Optional path of a Makefile-style file listing implicit inputs.
    depfile: Option<String>,
    /// UpToDate iff every output is UpToDate.
    state: State,
}

impl Rule {
    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn is_phony(&self) -> bool {
        self.command.is_empty()
    }

    pub fn depfile(&self) -> Option<&str> {
        self.depfile.as_deref()
    }

    pub fn is_input(&self, node: NodeId) -> bool {
        self.inputs.contains(&node)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.state == State::OutOfDate
    }
}

/// Visitor over every element of a graph, in stable arena order.
pub trait GraphVisitor {
    fn visit_graph(&mut self, graph: &Graph);
    fn visit_node(&mut self, graph: &Graph, id: NodeId, node: &Node);
    fn visit_rule(&mut self, graph: &Graph, id: RuleId, rule: &Rule);
}

/// The dependency graph: owns all nodes and rules.
#[derive(Debug, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    rules: Vec<Rule>,
    by_path: HashMap<String, NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node for `path`, or return the existing one.
    pub fn add_node(&mut self, path: &str) -> NodeId {
        if let Some(&id) = self.by_path.get(path) {
            return id;
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node::new(path.to_string()));
        self.by_path.insert(path.to_string(), id);
        id
    }

    /// Add a rule and wire the producer/consumer links.
    ///
    /// Fails if one of the outputs already has a producing rule.
    pub fn add_rule(
        &mut self,
        inputs: Vec<NodeId>,
        outputs: Vec<NodeId>,
        command: String,
        depfile: Option<String>,
    ) -> Result<RuleId, FalconError> {
        let id = RuleId(self.rules.len());
        for &out in &outputs {
            if self.nodes[out.0].producer.is_some() {
                return Err(FalconError::GraphInconsistent(format!(
                    "node '{}' is generated by more than one rule",
                    self.nodes[out.0].path
                )));
            }
        }
        for &out in &outputs {
            self.nodes[out.0].producer = Some(id);
        }
        for &inp in &inputs {
            self.nodes[inp.0].consumers.push(id);
        }
        self.rules.push(Rule {
            inputs,
            outputs,
            command,
            depfile,
            state: State::OutOfDate,
        });
        Ok(id)
    }

    /// Attach an extra implicit input discovered in a depfile.
    pub fn attach_input(&mut self, rule: RuleId, node: NodeId) {
        if self.rules[rule.0].inputs.contains(&node) {
            return;
        }
        self.rules[rule.0].inputs.push(node);
        self.nodes[node.0].consumers.push(rule);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0]
    }

    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0]
    }

    pub fn node_by_path(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn rules(&self) -> impl Iterator<Item = (RuleId, &Rule)> {
        self.rules.iter().enumerate().map(|(i, r)| (RuleId(i), r))
    }

    /// Nodes no rule consumes. Typically the final targets.
    pub fn roots(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.is_root())
            .map(|(id, _)| id)
            .collect()
    }

    /// Nodes no rule produces: the source files.
    pub fn sources(&self) -> Vec<NodeId> {
        self.nodes()
            .filter(|(_, n)| n.is_source())
            .map(|(id, _)| id)
            .collect()
    }

    /// Mark a node out-of-date and propagate to every transitive dependent.
    ///
    /// Terminates because the graph is acyclic; already-dirty nodes are not
    /// revisited.
    pub fn mark_dirty(&mut self, id: NodeId) {
        self.nodes[id.0].state = State::OutOfDate;
        let mut stack: Vec<RuleId> = self.nodes[id.0].consumers.clone();
        while let Some(r) = stack.pop() {
            self.rules[r.0].state = State::OutOfDate;
            for out in self.rules[r.0].outputs.clone() {
                if self.nodes[out.0].state == State::OutOfDate {
                    continue;
                }
                self.nodes[out.0].state = State::OutOfDate;
                stack.extend(self.nodes[out.0].consumers.iter().copied());
            }
        }
    }

    /// Mark a rule out-of-date along with all of its outputs.
    pub fn mark_rule_dirty(&mut self, id: RuleId) {
        self.rules[id.0].state = State::OutOfDate;
        for out in self.rules[id.0].outputs.clone() {
            self.mark_dirty(out);
        }
    }

    /// Mark a node up-to-date. Its producing rule becomes up-to-date once
    /// every sibling output is.
    pub fn mark_up_to_date(&mut self, id: NodeId) {
        self.nodes[id.0].state = State::UpToDate;
        if let Some(r) = self.nodes[id.0].producer {
            let all_clean = self.rules[r.0]
                .outputs
                .iter()
                .all(|o| self.nodes[o.0].state == State::UpToDate);
            if all_clean {
                self.rules[r.0].state = State::UpToDate;
            }
        }
    }

    pub fn set_rule_state(&mut self, id: RuleId, state: State) {
        self.rules[id.0].state = state;
    }

    /// Walk the graph, then every node, then every rule, in arena order.
    pub fn accept(&self, visitor: &mut dyn GraphVisitor) {
        visitor.visit_graph(self);
        for (id, node) in self.nodes() {
            visitor.visit_node(self, id, node);
        }
        for (id, rule) in self.rules() {
            visitor.visit_rule(self, id, rule);
        }
    }

    /// Verify the graph is a DAG over producer -> input edges.
    pub fn check_consistency(&self) -> Result<(), FalconError> {
        let mut dag = DiGraph::<NodeId, ()>::new();
        let indices: Vec<_> = self.nodes().map(|(id, _)| dag.add_node(id)).collect();
        for rule in &self.rules {
            for &inp in &rule.inputs {
                for &out in &rule.outputs {
                    dag.add_edge(indices[inp.0], indices[out.0], ());
                }
            }
        }
        match toposort(&dag, None) {
            Ok(_) => Ok(()),
            Err(cycle) => {
                let node = dag[cycle.node_id()];
                Err(FalconError::GraphInconsistent(format!(
                    "dependency cycle through '{}'",
                    self.nodes[node.0].path
                )))
            }
        }
    }

    /// Rules ordered so that every rule appears after the producers of its
    /// inputs. Used by the dependency scanner.
    pub fn rules_topological(&self) -> Result<Vec<RuleId>, FalconError> {
        let mut dag = DiGraph::<RuleId, ()>::new();
        let indices: Vec<_> = self.rules().map(|(id, _)| dag.add_node(id)).collect();
        for (i, rule) in self.rules.iter().enumerate() {
            for &out in &rule.outputs {
                for &consumer in &self.nodes[out.0].consumers {
                    dag.add_edge(indices[i], indices[consumer.0], ());
                }
            }
        }
        match toposort(&dag, None) {
            Ok(sorted) => Ok(sorted.into_iter().map(|idx| dag[idx]).collect()),
            Err(_) => Err(FalconError::GraphInconsistent(
                "rule dependency cycle".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// x -> R1 -> y -> R2 -> z
    fn chain() -> (Graph, NodeId, NodeId, NodeId, RuleId, RuleId) {
        let mut g = Graph::new();
        let x = g.add_node("x");
        let y = g.add_node("y");
        let z = g.add_node("z");
        let r1 = g
            .add_rule(vec![x], vec![y], "cp x y".to_string(), None)
            .unwrap();
        let r2 = g
            .add_rule(vec![y], vec![z], "cp y z".to_string(), None)
            .unwrap();
        (g, x, y, z, r1, r2)
    }

    fn mark_all_clean(g: &mut Graph) {
        let ids: Vec<_> = g.nodes().map(|(id, _)| id).collect();
        for id in ids {
            g.mark_up_to_date(id);
        }
    }

    #[test]
    fn test_dirty_propagates_to_dependents() {
        let (mut g, x, y, z, r1, r2) = chain();
        mark_all_clean(&mut g);

        g.mark_dirty(x);

        assert!(g.node(x).is_dirty());
        assert!(g.node(y).is_dirty());
        assert!(g.node(z).is_dirty());
        assert!(g.rule(r1).is_dirty());
        assert!(g.rule(r2).is_dirty());
    }

    #[test]
    fn test_rule_state_follows_outputs() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let r = g
            .add_rule(vec![a], vec![b, c], "gen".to_string(), None)
            .unwrap();

        g.mark_up_to_date(b);
        assert!(g.rule(r).is_dirty(), "one output still dirty");

        g.mark_up_to_date(c);
        assert!(!g.rule(r).is_dirty(), "all outputs clean");
    }

    #[test]
    fn test_mark_round_trip_restores_state() {
        let (mut g, x, y, z, r1, r2) = chain();
        mark_all_clean(&mut g);

        g.mark_dirty(x);
        g.mark_up_to_date(x);
        g.mark_up_to_date(y);
        g.mark_up_to_date(z);

        assert!(!g.node(x).is_dirty());
        assert!(!g.node(y).is_dirty());
        assert!(!g.node(z).is_dirty());
        assert!(!g.rule(r1).is_dirty());
        assert!(!g.rule(r2).is_dirty());
    }

    #[test]
    fn test_mark_dirty_is_idempotent() {
        let (mut g, x, _, z, _, _) = chain();
        mark_all_clean(&mut g);
        g.mark_dirty(x);
        g.mark_dirty(x);
        assert!(g.node(z).is_dirty());
    }

    #[test]
    fn test_roots_and_sources() {
        let (g, x, _, z, _, _) = chain();
        assert_eq!(g.sources(), vec![x]);
        assert_eq!(g.roots(), vec![z]);
    }

    #[test]
    fn test_phony_rule_detection() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let all = g.add_node("all");
        let r = g.add_rule(vec![a], vec![all], String::new(), None).unwrap();
        assert!(g.rule(r).is_phony());
    }

    #[test]
    fn test_second_producer_rejected() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_rule(vec![a], vec![b], "one".to_string(), None).unwrap();
        let err = g.add_rule(vec![a], vec![b], "two".to_string(), None);
        assert!(matches!(err, Err(FalconError::GraphInconsistent(_))));
    }

    #[test]
    fn test_cycle_detected() {
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        g.add_rule(vec![a], vec![b], "fwd".to_string(), None).unwrap();
        g.add_rule(vec![b], vec![a], "back".to_string(), None).unwrap();
        assert!(g.check_consistency().is_err());
    }

    #[test]
    fn test_rules_topological_order() {
        let (g, _, _, _, r1, r2) = chain();
        let order = g.rules_topological().unwrap();
        let p1 = order.iter().position(|&r| r == r1).unwrap();
        let p2 = order.iter().position(|&r| r == r2).unwrap();
        assert!(p1 < p2);
    }

    #[test]
    fn test_add_node_dedups_by_path() {
        let mut g = Graph::new();
        let a = g.add_node("same");
        let b = g.add_node("same");
        assert_eq!(a, b);
        assert_eq!(g.node_count(), 1);
    }
}
