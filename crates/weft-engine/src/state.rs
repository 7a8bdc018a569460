use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use weft_core::event::EventBus;
use weft_core::steering::{NodeOutput, NodeSpec};
use weft_core::{
    NodeId, NodeStatus, Registry, RunId, RunStatus, RuntimeError, TraceEntry,
    TraceEvent,
};
use weft_graph::{Edge, Graph, Node, Predicate};

use crate::vars::VariableStore;

/// Where the run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    /// Waiting on the operator at a checkpoint.
    Paused,
    /// Waiting on the operator after a node failure.
    Failed,
    Completed,
    Aborted,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// One node failure, kept even after the node is retried or skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node: NodeId,
    pub agent: String,
    pub error: String,
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub vars: BTreeMap<String, String>,
    pub completed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub skipped: Vec<NodeId>,
    /// Nodes that never became runnable (untaken branches, jump bypasses).
    pub unreached: Vec<NodeId>,
    pub outputs: BTreeMap<NodeId, String>,
    pub failures: Vec<NodeFailure>,
    pub trace: Vec<TraceEntry>,
    /// Why a run ended `Aborted` or `Failed`.
    pub reason: Option<String>,
}

impl RunResult {
    pub fn summary(&self) -> String {
        format!(
            "{}: {} completed, {} failed, {} skipped, {} unreached, {} failure(s) recorded",
            self.status,
            self.completed.len(),
            self.failed.len(),
            self.skipped.len(),
            self.unreached.len(),
            self.failures.len()
        )
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Everything the scheduler knows about a run in progress.
pub struct ExecutionState {
    run_id: RunId,
    graph: Graph,
    vars: VariableStore,
    phase: RunPhase,
    outputs: BTreeMap<NodeId, String>,
    frontier: BTreeSet<NodeId>,
    /// Pending nodes a jump stepped over; they count as satisfied sources.
    bypassed: BTreeSet<NodeId>,
    /// Jump targets, runnable regardless of incoming edges.
    forced: BTreeSet<NodeId>,
    /// Literal condition verdicts per (source node, condition text).
    verdicts: HashMap<(NodeId, String), bool>,
    /// Indices into `graph.bindings` already evaluated.
    bound: HashSet<usize>,
    loop_counts: HashMap<(NodeId, NodeId), u32>,
    attempts: HashMap<NodeId, u32>,
    /// Terminal nodes from graphs replaced by an edit.
    retired: BTreeMap<NodeId, Node>,
    failures: Vec<NodeFailure>,
    trace: Vec<TraceEntry>,
    event_bus: Option<Arc<EventBus>>,
}

impl ExecutionState {
    pub fn new(graph: Graph, vars: VariableStore) -> Self {
        Self {
            run_id: RunId::new(),
            graph,
            vars,
            phase: RunPhase::Idle,
            outputs: BTreeMap::new(),
            frontier: BTreeSet::new(),
            bypassed: BTreeSet::new(),
            forced: BTreeSet::new(),
            verdicts: HashMap::new(),
            bound: HashSet::new(),
            loop_counts: HashMap::new(),
            attempts: HashMap::new(),
            retired: BTreeMap::new(),
            failures: Vec::new(),
            trace: Vec::new(),
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    // ── Accessors ─────────────────────────────────────────────────

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn vars(&self) -> &VariableStore {
        &self.vars
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub(crate) fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
    }

    pub fn frontier(&self) -> &BTreeSet<NodeId> {
        &self.frontier
    }

    pub(crate) fn set_frontier(&mut self, frontier: BTreeSet<NodeId>) {
        self.frontier = frontier;
    }

    pub fn output(&self, id: NodeId) -> Option<&str> {
        self.outputs.get(&id).map(String::as_str)
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    pub fn failures(&self) -> &[NodeFailure] {
        &self.failures
    }

    pub fn status(&self, id: NodeId) -> Option<NodeStatus> {
        self.graph.node(id).map(|n| n.status)
    }

    pub fn attempts(&self, id: NodeId) -> u32 {
        self.attempts.get(&id).copied().unwrap_or(0)
    }

    pub fn is_bypassed(&self, id: NodeId) -> bool {
        self.bypassed.contains(&id)
    }

    pub fn is_forced(&self, id: NodeId) -> bool {
        self.forced.contains(&id)
    }

    pub fn completed(&self) -> BTreeSet<NodeId> {
        self.with_status(NodeStatus::Completed)
    }

    pub fn failed(&self) -> BTreeSet<NodeId> {
        self.with_status(NodeStatus::Failed)
    }

    pub fn skipped(&self) -> BTreeSet<NodeId> {
        self.with_status(NodeStatus::Skipped)
    }

    fn with_status(&self, status: NodeStatus) -> BTreeSet<NodeId> {
        self.graph
            .nodes
            .values()
            .chain(self.retired.values())
            .filter(|n| n.status == status)
            .map(|n| n.id)
            .collect()
    }

    /// Terminal, or stepped over by a jump.
    pub fn is_settled(&self, id: NodeId) -> bool {
        self.bypassed.contains(&id) || self.status(id).is_some_and(|s| s.is_terminal())
    }

    /// Completed upstream outputs, ascending by node.
    pub fn reachable_outputs(&self, id: NodeId) -> Vec<NodeOutput> {
        self.graph
            .ancestors(id)
            .into_iter()
            .filter_map(|n| {
                let node = self.graph.node(n)?;
                let output = self.outputs.get(&n)?;
                Some(NodeOutput {
                    node: n,
                    agent: node.display_name(),
                    output: output.clone(),
                })
            })
            .collect()
    }

    pub(crate) fn verdict(&self, source: NodeId, text: &str) -> Option<bool> {
        self.verdicts.get(&(source, text.to_string())).copied()
    }

    pub(crate) fn store_verdict(&mut self, source: NodeId, text: &str, verdict: bool) {
        self.verdicts.insert((source, text.to_string()), verdict);
    }

    pub(crate) fn is_bound(&self, binding: usize) -> bool {
        self.bound.contains(&binding)
    }

    pub(crate) fn mark_bound(&mut self, binding: usize) {
        self.bound.insert(binding);
    }

    pub(crate) fn bind_condition(&mut self, name: &str, outcome: bool) {
        self.vars.bind_condition(name, outcome);
    }

    /// Count one traversal of a back-edge; returns the new count.
    pub(crate) fn count_loop(&mut self, from: NodeId, to: NodeId) -> u32 {
        let count = self.loop_counts.entry((from, to)).or_insert(0);
        *count += 1;
        *count
    }

    // ── Trace ─────────────────────────────────────────────────────

    /// Append to the trace and publish on the event bus.
    pub fn record(&mut self, node: Option<NodeId>, event: TraceEvent) {
        let entry = TraceEntry {
            seq: self.trace.len(),
            at: Utc::now(),
            node,
            event,
        };
        if let Some(bus) = &self.event_bus {
            bus.publish(&self.run_id, entry.clone());
        }
        self.trace.push(entry);
    }

    // ── Node transitions ──────────────────────────────────────────

    fn set_status(&mut self, id: NodeId, status: NodeStatus) {
        if let Some(node) = self.graph.node_mut(id) {
            node.status = status;
        }
    }

    pub(crate) fn mark_running(&mut self, id: NodeId) -> u32 {
        self.set_status(id, NodeStatus::Running);
        let attempt = self.attempts.entry(id).or_insert(0);
        *attempt += 1;
        *attempt
    }

    /// Record a node's output and bind its output variable.
    pub(crate) fn complete(&mut self, id: NodeId, output: String) -> Result<(), RuntimeError> {
        let var = self.graph.node(id).and_then(|n| n.output_var.clone());
        if let Some(var) = var {
            self.vars.bind(&var, output.clone(), id)?;
            self.record(
                Some(id),
                TraceEvent::VariableBound {
                    name: var,
                    value: output.clone(),
                },
            );
        }
        self.set_status(id, NodeStatus::Completed);
        self.forced.remove(&id);
        self.record(Some(id), TraceEvent::NodeCompleted { output: output.clone() });
        self.outputs.insert(id, output);
        Ok(())
    }

    /// A checkpoint the operator let through.
    pub(crate) fn pass_checkpoint(&mut self, id: NodeId) {
        self.set_status(id, NodeStatus::Completed);
        self.forced.remove(&id);
    }

    pub(crate) fn fail(&mut self, id: NodeId, error: &RuntimeError) {
        let agent = self
            .graph
            .node(id)
            .map(|n| n.agent_ref.clone())
            .unwrap_or_default();
        self.set_status(id, NodeStatus::Failed);
        self.failures.push(NodeFailure {
            node: id,
            agent,
            error: error.to_string(),
            attempt: self.attempts(id),
            at: Utc::now(),
        });
        self.record(
            Some(id),
            TraceEvent::NodeFailed {
                error: error.to_string(),
            },
        );
    }

    pub(crate) fn retry(&mut self, id: NodeId, automatic: bool) {
        self.set_status(id, NodeStatus::Pending);
        let attempt = self.attempts(id) + 1;
        self.record(Some(id), TraceEvent::NodeRetried { attempt, automatic });
    }

    /// Skip a failed node. Its output variable stays unbound.
    pub(crate) fn skip(&mut self, id: NodeId) {
        self.set_status(id, NodeStatus::Skipped);
        self.forced.remove(&id);
        self.record(Some(id), TraceEvent::NodeSkipped);
    }

    /// Put `root` and everything forward-reachable from it back to Pending.
    pub(crate) fn reset_region(&mut self, root: NodeId) -> BTreeSet<NodeId> {
        let mut region = self.graph.descendants(root);
        region.insert(root);
        for id in &region {
            self.set_status(*id, NodeStatus::Pending);
            self.outputs.remove(id);
            self.bypassed.remove(id);
        }
        self.verdicts.retain(|(source, _), _| !region.contains(source));
        let stale: Vec<usize> = self
            .graph
            .bindings
            .iter()
            .enumerate()
            .filter(|(_, b)| b.sources.iter().any(|s| region.contains(s)))
            .map(|(idx, _)| idx)
            .collect();
        for idx in stale {
            self.bound.remove(&idx);
        }
        region
    }

    // ── Steering operations ───────────────────────────────────────

    /// Leave `checkpoint` and make `target` the next thing to run.
    pub(crate) fn jump(&mut self, checkpoint: NodeId, target: NodeId) {
        self.pass_checkpoint(checkpoint);
        if self.status(target) != Some(NodeStatus::Pending) {
            self.reset_region(target);
        }
        self.forced.insert(target);
        let pending: Vec<NodeId> = self
            .graph
            .ancestors(target)
            .into_iter()
            .filter(|id| self.status(*id) == Some(NodeStatus::Pending))
            .collect();
        self.bypassed.extend(pending);
    }

    /// Re-run whatever led into `checkpoint`. Returns the reset predecessors.
    pub(crate) fn repeat(&mut self, checkpoint: NodeId) -> Vec<NodeId> {
        let preds = self.graph.predecessors(checkpoint);
        for pred in &preds {
            self.reset_region(*pred);
        }
        preds
    }

    /// Swap in an edited graph, keeping variables it still uses.
    pub(crate) fn replace_graph(&mut self, graph: Graph) {
        let keep = graph_variables(&graph);
        self.vars.retain(|name| keep.contains(name));

        let old = std::mem::replace(&mut self.graph, graph);
        self.retired.extend(
            old.nodes
                .into_iter()
                .filter(|(_, n)| n.status.is_terminal()),
        );
        self.frontier.clear();
        self.bypassed.clear();
        self.forced.clear();
        self.verdicts.clear();
        self.bound.clear();
        self.loop_counts.clear();
        let nodes = self.graph.len();
        self.record(None, TraceEvent::GraphReplaced { nodes });
    }

    /// Replace a failed node with parallel alternatives wired to its edges.
    pub(crate) fn fork(
        &mut self,
        failed: NodeId,
        specs: &[NodeSpec],
        registry: &Registry,
    ) -> Vec<NodeId> {
        let inherited = self.graph.node(failed).and_then(|n| n.output_var.clone());
        let incoming: Vec<NodeId> = self.graph.predecessors(failed);
        let outgoing: Vec<Edge> = self.graph.outgoing(failed).cloned().collect();
        let was_root = incoming.is_empty();
        let was_forced = self.forced.contains(&failed);

        let mut created = Vec::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            let output_var = spec
                .output_var
                .clone()
                .or_else(|| if i == 0 { inherited.clone() } else { None });
            let id = self.insert_spec(spec, output_var, registry);
            for from in &incoming {
                self.graph.add_edge(Edge::unconditional(*from, id));
            }
            for edge in &outgoing {
                self.graph.add_edge(Edge {
                    from: id,
                    ..edge.clone()
                });
            }
            if was_root {
                self.graph.roots.push(id);
            }
            if was_forced {
                self.forced.insert(id);
            }
            created.push(id);
        }

        self.graph.edges.retain(|e| e.from != failed);
        self.graph.substitute_branch(failed, &created);
        self.skip(failed);
        created
    }

    /// Insert a node that runs before `failed`, then retry `failed`.
    pub(crate) fn insert_before(
        &mut self,
        failed: NodeId,
        spec: &NodeSpec,
        registry: &Registry,
    ) -> NodeId {
        let incoming = self.graph.predecessors(failed);
        let id = self.insert_spec(spec, spec.output_var.clone(), registry);
        for from in &incoming {
            self.graph.add_edge(Edge::unconditional(*from, id));
        }
        if incoming.is_empty() {
            self.graph.roots.push(id);
        }
        self.graph.add_edge(Edge::unconditional(id, failed));
        if self.forced.remove(&failed) {
            self.forced.insert(id);
        }
        self.retry(failed, false);
        id
    }

    fn insert_spec(
        &mut self,
        spec: &NodeSpec,
        output_var: Option<String>,
        registry: &Registry,
    ) -> NodeId {
        let id = self.graph.allocate_id();
        let agent_ref = registry.resolve(&spec.agent);
        let mut node = Node::agent(id, agent_ref.clone(), spec.instruction.clone());
        node.output_var = output_var;
        if let Some(temp) = self
            .graph
            .temp_agents
            .values()
            .find(|t| t.agent_ref == agent_ref)
        {
            node.model = temp.model.clone();
            node.temp_agent = Some(temp.name.clone());
        }
        self.graph.insert_node(node);
        id
    }

    // ── Result ────────────────────────────────────────────────────

    pub(crate) fn into_result(self, status: RunStatus, reason: Option<String>) -> RunResult {
        let unreached = self
            .graph
            .nodes
            .values()
            .filter(|n| !n.status.is_terminal())
            .map(|n| n.id)
            .collect();
        RunResult {
            completed: self.completed().into_iter().collect(),
            failed: self.failed().into_iter().collect(),
            skipped: self.skipped().into_iter().collect(),
            unreached,
            run_id: self.run_id,
            status,
            vars: self.vars.snapshot(),
            outputs: self.outputs,
            failures: self.failures,
            trace: self.trace,
            reason,
        }
    }
}

/// Variables a graph produces or reads.
fn graph_variables(graph: &Graph) -> BTreeSet<String> {
    let mut names = graph.declared_vars.clone();
    for node in graph.nodes.values() {
        names.extend(node.references());
    }
    let predicates = graph
        .edges
        .iter()
        .map(|e| &e.predicate)
        .chain(graph.bindings.iter().map(|b| &b.predicate));
    for predicate in predicates {
        if let Predicate::IfVar { name, .. } = predicate {
            names.insert(name.clone());
        }
    }
    names
}
