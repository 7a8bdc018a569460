use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use weft_core::template;
use weft_core::{AgentKind, NodeId, NodeStatus, Position, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    AgentCall,
    Checkpoint,
}

/// A unit of work or a pause point in the execution graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Canonical agent id. Empty for checkpoints.
    pub agent_ref: String,
    /// Instruction template, `{var}` markers unresolved.
    pub instruction: String,
    pub output_var: Option<String>,
    pub status: NodeStatus,
    pub pos: Position,
    pub label: Option<String>,
    /// Operator-facing text shown at a checkpoint.
    pub prompt: Option<String>,
    pub model: Option<String>,
    /// Name of the temp agent this node invokes, if any.
    pub temp_agent: Option<String>,
}

impl Node {
    pub fn agent(id: NodeId, agent_ref: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            id,
            kind: NodeKind::AgentCall,
            agent_ref: agent_ref.into(),
            instruction: instruction.into(),
            output_var: None,
            status: NodeStatus::Pending,
            pos: Position::default(),
            label: None,
            prompt: None,
            model: None,
            temp_agent: None,
        }
    }

    pub fn checkpoint(id: NodeId, label: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::Checkpoint,
            label: Some(label.into()),
            ..Self::agent(id, "", "")
        }
    }

    pub fn with_output(mut self, var: impl Into<String>) -> Self {
        self.output_var = Some(var.into());
        self
    }

    pub fn at(mut self, pos: Position) -> Self {
        self.pos = pos;
        self
    }

    pub fn is_checkpoint(&self) -> bool {
        self.kind == NodeKind::Checkpoint
    }

    /// Variables the instruction interpolates.
    pub fn references(&self) -> Vec<String> {
        template::references(&self.instruction)
    }

    /// Short human-readable name: `@label` or the agent id.
    pub fn display_name(&self) -> String {
        match (&self.kind, &self.label) {
            (NodeKind::Checkpoint, Some(label)) => format!("@{}", label),
            _ => self.agent_ref.clone(),
        }
    }
}

/// Gate on an edge. `negate` inverts the test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    Unconditional,
    IfVar { name: String, negate: bool },
    IfAllSuccess { branches: Vec<NodeId>, negate: bool },
    IfAnySuccess { branches: Vec<NodeId>, negate: bool },
    IfLiteral { text: String, negate: bool },
}

impl Predicate {
    pub fn is_unconditional(&self) -> bool {
        matches!(self, Self::Unconditional)
    }

    /// Variable the predicate reads, if any.
    pub fn var(&self) -> Option<&str> {
        match self {
            Self::IfVar { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        let bang = |negate: &bool| if *negate { "!" } else { "" };
        match self {
            Self::Unconditional => "always".to_string(),
            Self::IfVar { name, negate } => format!("if {}{{{}}}", bang(negate), name),
            Self::IfAllSuccess { negate, .. } => format!("if {}all success", bang(negate)),
            Self::IfAnySuccess { negate, .. } => format!("if {}any success", bang(negate)),
            Self::IfLiteral { text, negate } => format!("if {}{}", bang(negate), text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub predicate: Predicate,
    /// Conditional edge returning to an earlier checkpoint (a retry loop).
    #[serde(default)]
    pub back_edge: bool,
}

impl Edge {
    pub fn unconditional(from: NodeId, to: NodeId) -> Self {
        Self {
            from,
            to,
            predicate: Predicate::Unconditional,
            back_edge: false,
        }
    }

    pub fn conditional(from: NodeId, to: NodeId, predicate: Predicate) -> Self {
        Self {
            from,
            to,
            predicate,
            back_edge: false,
        }
    }
}

/// `src (cond):var ~>` stores the condition's outcome in `var` once every
/// source is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionBinding {
    pub sources: Vec<NodeId>,
    pub predicate: Predicate,
    pub var: String,
}

/// A parallel block followed by `->`: successors wait for every branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPoint {
    pub branches: Vec<NodeId>,
    pub successors: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempAgent {
    pub name: String,
    pub base: AgentKind,
    pub prompt: String,
    pub model: Option<String>,
    pub agent_ref: String,
}

/// The executable form of a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: BTreeMap<NodeId, Node>,
    pub edges: Vec<Edge>,
    pub temp_agents: BTreeMap<String, TempAgent>,
    pub declared_vars: BTreeSet<String>,
    pub roots: Vec<NodeId>,
    pub bindings: Vec<ConditionBinding>,
    pub joins: Vec<JoinPoint>,
    pub subgraphs: Vec<Span>,
    pub labels: BTreeMap<String, NodeId>,
    next_id: NodeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::starting_at(NodeId(0))
    }
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: NodeId) -> Self {
        Self {
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            temp_agents: BTreeMap::new(),
            declared_vars: BTreeSet::new(),
            roots: Vec::new(),
            bindings: Vec::new(),
            joins: Vec::new(),
            subgraphs: Vec::new(),
            labels: BTreeMap::new(),
            next_id: first,
        }
    }

    /// Id the next inserted node will get.
    pub fn next_id(&self) -> NodeId {
        self.next_id
    }

    pub fn allocate_id(&mut self) -> NodeId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    /// Insert a node, keeping id allocation ahead of it.
    pub fn insert_node(&mut self, node: Node) -> NodeId {
        let id = node.id;
        if id >= self.next_id {
            self.next_id = id.next();
        }
        if let Some(var) = &node.output_var {
            self.declared_vars.insert(var.clone());
        }
        if let (NodeKind::Checkpoint, Some(label)) = (&node.kind, &node.label) {
            self.labels.entry(label.clone()).or_insert(id);
        }
        self.nodes.insert(id, node);
        id
    }

    /// Add an edge unless an identical one exists.
    pub fn add_edge(&mut self, edge: Edge) {
        if !self.edges.contains(&edge) {
            self.edges.push(edge);
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All edges into `id`, back-edges included.
    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn forward_incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.incoming(id).filter(|e| !e.back_edge)
    }

    pub fn forward_outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.outgoing(id).filter(|e| !e.back_edge)
    }

    /// Sources of forward edges into `id`, ascending, no duplicates.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self.forward_incoming(id).map(|e| e.from).collect();
        set.into_iter().collect()
    }

    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let set: BTreeSet<NodeId> = self.forward_outgoing(id).map(|e| e.to).collect();
        set.into_iter().collect()
    }

    /// Nodes that reach `id` through forward edges, excluding `id`.
    pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.walk(id, |g, n| g.predecessors(n))
    }

    /// Nodes reachable from `id` through forward edges, excluding `id`.
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.walk(id, |g, n| g.successors(n))
    }

    fn walk<F>(&self, start: NodeId, next: F) -> BTreeSet<NodeId>
    where
        F: Fn(&Self, NodeId) -> Vec<NodeId>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = next(self, start).into();
        while let Some(n) = queue.pop_front() {
            if n != start && seen.insert(n) {
                queue.extend(next(self, n));
            }
        }
        seen
    }

    /// The join point `id` waits on, if it follows a parallel block.
    pub fn join_into(&self, id: NodeId) -> Option<&JoinPoint> {
        self.joins.iter().find(|j| j.successors.contains(&id))
    }

    /// Nodes without forward incoming edges.
    pub fn entry_points(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .copied()
            .filter(|id| self.forward_incoming(*id).next().is_none())
            .collect()
    }

    /// Nodes whose output is bound to `var`.
    pub fn producers(&self, var: &str) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.output_var.as_deref() == Some(var))
            .map(|n| n.id)
            .collect()
    }

    pub fn checkpoint_by_label(&self, label: &str) -> Option<NodeId> {
        self.labels.get(label).copied()
    }

    /// Forward edges in a deterministic topological order of their nodes.
    /// Returns `None` when forward edges contain a cycle.
    pub fn topological_order(&self) -> Option<Vec<NodeId>> {
        let mut indegree: BTreeMap<NodeId, usize> =
            self.nodes.keys().map(|id| (*id, 0)).collect();
        for edge in self.edges.iter().filter(|e| !e.back_edge) {
            if let Some(d) = indegree.get_mut(&edge.to) {
                *d += 1;
            }
        }
        let mut ready: BTreeSet<NodeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id);
            for edge in self.forward_outgoing(id) {
                if let Some(d) = indegree.get_mut(&edge.to) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(edge.to);
                    }
                }
            }
        }
        (order.len() == self.nodes.len()).then_some(order)
    }

    /// Replace `old` in every all/any branch set and binding source list.
    pub fn substitute_branch(&mut self, old: NodeId, replacements: &[NodeId]) {
        let swap = |set: &mut Vec<NodeId>| {
            if let Some(idx) = set.iter().position(|id| *id == old) {
                set.splice(idx..=idx, replacements.iter().copied());
            }
        };
        for edge in &mut self.edges {
            match &mut edge.predicate {
                Predicate::IfAllSuccess { branches, .. }
                | Predicate::IfAnySuccess { branches, .. } => swap(branches),
                _ => {}
            }
        }
        for binding in &mut self.bindings {
            swap(&mut binding.sources);
            match &mut binding.predicate {
                Predicate::IfAllSuccess { branches, .. }
                | Predicate::IfAnySuccess { branches, .. } => swap(branches),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph {
        // 0 -> 1 -> 2, 0 -> 3
        let mut g = Graph::new();
        for i in 0..4 {
            let id = g.allocate_id();
            g.insert_node(Node::agent(id, "explore", format!("step {}", i)));
        }
        g.add_edge(Edge::unconditional(NodeId(0), NodeId(1)));
        g.add_edge(Edge::unconditional(NodeId(1), NodeId(2)));
        g.add_edge(Edge::unconditional(NodeId(0), NodeId(3)));
        g
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let g = chain();
        assert_eq!(
            g.ancestors(NodeId(2)),
            BTreeSet::from([NodeId(0), NodeId(1)])
        );
        assert_eq!(
            g.descendants(NodeId(0)),
            BTreeSet::from([NodeId(1), NodeId(2), NodeId(3)])
        );
        assert!(g.ancestors(NodeId(0)).is_empty());
    }

    #[test]
    fn test_back_edges_ignored_for_reachability() {
        let mut g = chain();
        g.add_edge(Edge {
            back_edge: true,
            ..Edge::conditional(
                NodeId(2),
                NodeId(0),
                Predicate::IfLiteral {
                    text: "failed".into(),
                    negate: false,
                },
            )
        });
        assert!(g.ancestors(NodeId(0)).is_empty());
        assert_eq!(g.entry_points(), vec![NodeId(0)]);
        assert!(g.topological_order().is_some());
    }

    #[test]
    fn test_duplicate_edges_collapse() {
        let mut g = chain();
        g.add_edge(Edge::unconditional(NodeId(0), NodeId(1)));
        assert_eq!(g.edges.len(), 3);
    }

    #[test]
    fn test_topological_order_detects_cycle() {
        let mut g = chain();
        assert_eq!(
            g.topological_order(),
            Some(vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)])
        );
        g.add_edge(Edge::unconditional(NodeId(2), NodeId(0)));
        assert!(g.topological_order().is_none());
    }

    #[test]
    fn test_substitute_branch() {
        let mut g = chain();
        g.add_edge(Edge::conditional(
            NodeId(1),
            NodeId(3),
            Predicate::IfAllSuccess {
                branches: vec![NodeId(1), NodeId(2)],
                negate: false,
            },
        ));
        g.substitute_branch(NodeId(1), &[NodeId(7), NodeId(8)]);
        let last = g.edges.last().unwrap();
        assert_eq!(
            last.predicate,
            Predicate::IfAllSuccess {
                branches: vec![NodeId(7), NodeId(8), NodeId(2)],
                negate: false,
            }
        );
    }

    #[test]
    fn test_insert_tracks_ids_and_vars() {
        let mut g = Graph::starting_at(NodeId(10));
        let id = g.allocate_id();
        assert_eq!(id, NodeId(10));
        g.insert_node(Node::agent(NodeId(15), "plan", "p").with_output("plan"));
        assert_eq!(g.next_id(), NodeId(16));
        assert!(g.declared_vars.contains("plan"));
        assert_eq!(g.producers("plan"), vec![NodeId(15)]);
    }
}
