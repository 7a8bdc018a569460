//! Static checks run on a built graph before anything executes.
//!
//! Every rule runs independently and every problem is reported, so a single
//! pass shows all of a workflow's mistakes.

use std::collections::{BTreeSet, HashMap};

use weft_core::{NodeId, Registry, ValidationError};

use crate::graph::{Edge, Graph, NodeKind, Predicate};

/// What a rule can look at.
pub struct RuleContext<'a> {
    pub graph: &'a Graph,
    pub registry: &'a Registry,
    /// Variables that exist before the graph runs.
    pub seeds: &'a BTreeSet<String>,
}

/// One independent check.
pub trait GraphRule: Send + Sync {
    fn id(&self) -> &'static str;

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError>;
}

/// Runs every registered rule and concatenates their findings.
pub struct Validator {
    rules: Vec<Box<dyn GraphRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(UnclosedSubgraphRule),
                Box::new(DanglingEdgeRule),
                Box::new(OrphanedNodeRule),
                Box::new(UnknownAgentRule),
                Box::new(IllegalCycleRule),
                Box::new(UndefinedVariableRule),
                Box::new(VariableNotGuaranteedRule),
                Box::new(DuplicateProducerRule),
            ],
        }
    }

    pub fn validate(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        self.rules.iter().flat_map(|rule| rule.check(ctx)).collect()
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.rules.iter().map(|r| r.id())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a graph with no pre-existing variables.
pub fn validate(graph: &Graph, registry: &Registry) -> Vec<ValidationError> {
    validate_with_seeds(graph, registry, &BTreeSet::new())
}

/// Validate a graph where `seeds` are already bound (an edited running graph).
pub fn validate_with_seeds(
    graph: &Graph,
    registry: &Registry,
    seeds: &BTreeSet<String>,
) -> Vec<ValidationError> {
    let ctx = RuleContext {
        graph,
        registry,
        seeds,
    };
    Validator::new().validate(&ctx)
}

struct UnclosedSubgraphRule;

impl GraphRule for UnclosedSubgraphRule {
    fn id(&self) -> &'static str {
        "unclosed-subgraph"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        ctx.graph
            .subgraphs
            .iter()
            .filter(|span| span.end.is_none())
            .map(|span| ValidationError::UnclosedSubgraph { start: span.start })
            .collect()
    }
}

struct DanglingEdgeRule;

impl GraphRule for DanglingEdgeRule {
    fn id(&self) -> &'static str {
        "dangling-edge"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        ctx.graph
            .edges
            .iter()
            .filter(|e| !ctx.graph.contains(e.from) || !ctx.graph.contains(e.to))
            .map(|e| ValidationError::DanglingEdge {
                from: e.from,
                to: e.to,
            })
            .collect()
    }
}

struct OrphanedNodeRule;

impl GraphRule for OrphanedNodeRule {
    fn id(&self) -> &'static str {
        "orphaned-node"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        let graph = ctx.graph;
        if graph.len() <= 1 {
            return Vec::new();
        }
        graph
            .entry_points()
            .into_iter()
            .filter(|id| !graph.roots.contains(id))
            .map(|node| ValidationError::OrphanedNode { node })
            .collect()
    }
}

struct UnknownAgentRule;

impl GraphRule for UnknownAgentRule {
    fn id(&self) -> &'static str {
        "unknown-agent"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        ctx.graph
            .nodes
            .values()
            .filter(|n| n.kind == NodeKind::AgentCall)
            .filter(|n| !is_callable(ctx.graph, ctx.registry, &n.agent_ref))
            .map(|n| ValidationError::UnknownAgent {
                node: n.id,
                agent: n.agent_ref.clone(),
            })
            .collect()
    }
}

/// Known to the registry or defined as a temp agent in this graph.
pub fn is_callable(graph: &Graph, registry: &Registry, agent_ref: &str) -> bool {
    registry.is_known(agent_ref)
        || graph
            .temp_agents
            .values()
            .any(|t| t.agent_ref == agent_ref)
}

struct IllegalCycleRule;

impl IllegalCycleRule {
    /// Conditional edge into an earlier checkpoint.
    fn is_legal_back_edge(graph: &Graph, edge: &Edge) -> bool {
        edge.back_edge
            && !edge.predicate.is_unconditional()
            && edge.to <= edge.from
            && graph
                .node(edge.to)
                .is_some_and(|n| n.kind == NodeKind::Checkpoint)
    }
}

impl GraphRule for IllegalCycleRule {
    fn id(&self) -> &'static str {
        "illegal-cycle"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        let graph = ctx.graph;
        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for edge in &graph.edges {
            if !Self::is_legal_back_edge(graph, edge) {
                adjacency.entry(edge.from).or_default().push(edge.to);
            }
        }
        for targets in adjacency.values_mut() {
            targets.sort();
            targets.dedup();
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        let mut marks: HashMap<NodeId, Mark> =
            graph.nodes.keys().map(|id| (*id, Mark::Unvisited)).collect();
        let mut errors = Vec::new();

        for start in graph.nodes.keys().copied() {
            if marks[&start] != Mark::Unvisited {
                continue;
            }
            // Iterative DFS: (node, index of next child to visit).
            let mut stack: Vec<(NodeId, usize)> = vec![(start, 0)];
            marks.insert(start, Mark::OnStack);
            while let Some((node, child_idx)) = stack.last().copied() {
                let children = adjacency.get(&node).map(Vec::as_slice).unwrap_or(&[]);
                if child_idx >= children.len() {
                    marks.insert(node, Mark::Done);
                    stack.pop();
                    continue;
                }
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let child = children[child_idx];
                match marks.get(&child).copied() {
                    Some(Mark::Unvisited) => {
                        marks.insert(child, Mark::OnStack);
                        stack.push((child, 0));
                    }
                    Some(Mark::OnStack) => {
                        let from = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                        let mut path: Vec<NodeId> = stack[from..].iter().map(|(n, _)| *n).collect();
                        path.push(child);
                        errors.push(ValidationError::IllegalCycle { path });
                    }
                    // Done, or an edge to a missing node (reported elsewhere).
                    _ => {}
                }
            }
        }
        errors
    }
}

struct UndefinedVariableRule;

impl GraphRule for UndefinedVariableRule {
    fn id(&self) -> &'static str {
        "undefined-variable"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        let known = |name: &str| ctx.graph.declared_vars.contains(name) || ctx.seeds.contains(name);
        consumers(ctx.graph)
            .into_iter()
            .filter(|c| !known(&c.name))
            .map(|c| ValidationError::UndefinedVariable {
                name: c.name,
                node: c.node,
            })
            .collect()
    }
}

struct VariableNotGuaranteedRule;

impl GraphRule for VariableNotGuaranteedRule {
    fn id(&self) -> &'static str {
        "variable-not-guaranteed"
    }

    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        let graph = ctx.graph;
        let mut ancestors: HashMap<NodeId, BTreeSet<NodeId>> = HashMap::new();
        let mut errors = Vec::new();

        for consumer in consumers(graph) {
            if ctx.seeds.contains(&consumer.name) || !graph.declared_vars.contains(&consumer.name) {
                continue;
            }
            let before = ancestors
                .entry(consumer.node)
                .or_insert_with(|| graph.ancestors(consumer.node));
            // A predicate is read after its source completes, so the source
            // itself counts as already run.
            let ran = |id: &NodeId| before.contains(id) || (consumer.after_node && *id == consumer.node);

            let produced = graph.producers(&consumer.name).iter().any(|p| ran(p));
            let bound = graph
                .bindings
                .iter()
                .filter(|b| b.var == consumer.name)
                .any(|b| !b.sources.is_empty() && b.sources.iter().all(|s| ran(s)));

            if !produced && !bound {
                errors.push(ValidationError::VariableNotGuaranteed {
                    name: consumer.name,
                    node: consumer.node,
                });
            }
        }
        errors
    }
}

struct DuplicateProducerRule;

impl GraphRule for DuplicateProducerRule {
    fn id(&self) -> &'static str {
        "duplicate-producer"
    }

    /// Node outputs and condition bindings each create a variable; a name may
    /// be created once per run, and seeds count as already created.
    fn check(&self, ctx: &RuleContext<'_>) -> Vec<ValidationError> {
        let graph = ctx.graph;
        let outputs = graph
            .nodes
            .values()
            .filter_map(|n| n.output_var.as_deref().map(|v| (v, n.id)));
        let bindings = graph
            .bindings
            .iter()
            .filter_map(|b| b.sources.iter().copied().max().map(|s| (b.var.as_str(), s)));

        let mut producers: Vec<(&str, NodeId)> = outputs.chain(bindings).collect();
        producers.sort_by_key(|(_, id)| *id);

        let mut first: HashMap<&str, NodeId> = HashMap::new();
        let mut errors = Vec::new();
        for (name, node) in producers {
            let owner = if ctx.seeds.contains(name) {
                Some(None)
            } else {
                first.get(name).map(|id| Some(*id))
            };
            match owner {
                Some(owner) => errors.push(ValidationError::DuplicateProducer {
                    name: name.to_string(),
                    node,
                    owner,
                }),
                None => {
                    first.insert(name, node);
                }
            }
        }
        errors
    }
}

/// A place that reads a variable.
struct Consumer {
    name: String,
    node: NodeId,
    /// Read once `node` has completed (predicates) rather than before it runs.
    after_node: bool,
}

fn consumers(graph: &Graph) -> Vec<Consumer> {
    let mut out = Vec::new();
    for node in graph.nodes.values() {
        for name in node.references() {
            out.push(Consumer {
                name,
                node: node.id,
                after_node: false,
            });
        }
    }

    let mut seen: BTreeSet<(NodeId, String)> = BTreeSet::new();
    let edge_reads = graph
        .edges
        .iter()
        .filter_map(|e| e.predicate.var().map(|v| (e.from, v)));
    let binding_reads = graph.bindings.iter().filter_map(|b| match &b.predicate {
        Predicate::IfVar { name, .. } => b.sources.first().map(|s| (*s, name.as_str())),
        _ => None,
    });
    for (from, name) in edge_reads.chain(binding_reads) {
        if seen.insert((from, name.to_string())) {
            out.push(Consumer {
                name: name.to_string(),
                node: from,
                after_node: true,
            });
        }
    }
    out
}
