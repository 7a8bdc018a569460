use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use weft_core::{NodeId, Registry, ValidationError};
use weft_dsl::{AgentTarget, AstNode, Condition, ConditionKind, TempAgentDef, Workflow};

use crate::graph::{
    ConditionBinding, Edge, Graph, JoinPoint, Node, NodeKind, Predicate, TempAgent,
};

/// Build a graph from a parsed workflow, numbering nodes from 0.
pub fn build(workflow: &Workflow, registry: &Registry) -> Result<Graph, ValidationError> {
    GraphBuilder::new(registry).build(workflow)
}

/// Entry and exit nodes of a built sub-expression.
#[derive(Debug, Clone, Default)]
struct Fragment {
    sources: Vec<NodeId>,
    sinks: Vec<NodeId>,
}

impl Fragment {
    fn single(id: NodeId) -> Self {
        Self {
            sources: vec![id],
            sinks: vec![id],
        }
    }
}

/// Lowers a [`Workflow`] into a [`Graph`].
///
/// Node ids follow source order, so the same text always produces the same
/// graph.
pub struct GraphBuilder<'r> {
    registry: &'r Registry,
    graph: Graph,
    /// Variables produced so far in program order, plus seeds.
    declared: BTreeSet<String>,
    temp_defs: HashMap<String, TempAgentDef>,
}

impl<'r> GraphBuilder<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            graph: Graph::new(),
            declared: BTreeSet::new(),
            temp_defs: HashMap::new(),
        }
    }

    /// Continue numbering from `first` (used when a running graph is edited).
    pub fn starting_at(mut self, first: NodeId) -> Self {
        self.graph = Graph::starting_at(first);
        self
    }

    /// Names that already exist outside the workflow text.
    pub fn with_seeds(mut self, seeds: impl IntoIterator<Item = String>) -> Self {
        self.declared.extend(seeds);
        self
    }

    pub fn build(mut self, workflow: &Workflow) -> Result<Graph, ValidationError> {
        for def in &workflow.definitions {
            let agent_ref = self.registry.resolve(&format!("${}", def.name));
            self.graph.temp_agents.insert(
                def.name.clone(),
                TempAgent {
                    name: def.name.clone(),
                    base: def.base,
                    prompt: def.prompt.clone(),
                    model: def.model.clone(),
                    agent_ref,
                },
            );
            self.temp_defs.insert(def.name.clone(), def.clone());
        }

        let top = self.lower(&workflow.body)?;
        self.graph.roots = top.sources;
        debug!(
            nodes = self.graph.len(),
            edges = self.graph.edges.len(),
            "Built workflow graph"
        );
        Ok(self.graph)
    }

    fn lower(&mut self, node: &AstNode) -> Result<Fragment, ValidationError> {
        match node {
            AstNode::AgentCall(call) => {
                let id = self.graph.allocate_id();
                let mut node = Node::agent(id, "", call.instruction.clone()).at(call.pos);
                match &call.agent {
                    AgentTarget::Named(name) => {
                        node.agent_ref = self.registry.resolve(name);
                    }
                    AgentTarget::Temp(name) => {
                        let def = self.temp_defs.get(name).ok_or_else(|| {
                            ValidationError::UndefinedTempAgent {
                                name: name.clone(),
                                pos: call.pos,
                            }
                        })?;
                        node.agent_ref = self.registry.resolve(&format!("${}", name));
                        node.model = def.model.clone();
                        node.temp_agent = Some(name.clone());
                    }
                }
                if let Some(var) = &call.output_var {
                    node.output_var = Some(var.clone());
                    self.declared.insert(var.clone());
                }
                self.graph.insert_node(node);
                Ok(Fragment::single(id))
            }

            AstNode::Checkpoint { label, prompt, pos } => {
                if let Some(existing) = self.graph.checkpoint_by_label(label) {
                    if let (Some(prompt), Some(node)) = (prompt, self.graph.node_mut(existing)) {
                        node.prompt.get_or_insert_with(|| prompt.clone());
                    }
                    return Ok(Fragment::single(existing));
                }
                let id = self.graph.allocate_id();
                let mut node = Node::checkpoint(id, label.clone()).at(*pos);
                node.prompt = prompt.clone();
                self.graph.insert_node(node);
                Ok(Fragment::single(id))
            }

            AstNode::Sequence { left, right } => {
                let lhs = self.lower(left)?;
                let rhs = self.lower(right)?;
                for from in &lhs.sinks {
                    for to in &rhs.sources {
                        self.graph.add_edge(Edge::unconditional(*from, *to));
                    }
                }
                if lhs.sinks.len() > 1 && ends_in_parallel(left) {
                    self.graph.joins.push(JoinPoint {
                        branches: lhs.sinks.clone(),
                        successors: rhs.sources.clone(),
                    });
                }
                Ok(Fragment {
                    sources: lhs.sources,
                    sinks: rhs.sinks,
                })
            }

            AstNode::Parallel { branches } => {
                let mut fragment = Fragment::default();
                for branch in branches {
                    let f = self.lower(branch)?;
                    fragment.sources.extend(f.sources);
                    fragment.sinks.extend(f.sinks);
                }
                Ok(fragment)
            }

            AstNode::Subgraph { body, span } => {
                self.graph.subgraphs.push(*span);
                self.lower(body)
            }

            AstNode::Conditional {
                source,
                condition,
                bind_var,
                target,
            } => {
                let src = self.lower(source)?;
                let predicate = self.predicate(condition, &src.sinks);

                if let Some(var) = bind_var {
                    self.graph.bindings.push(ConditionBinding {
                        sources: src.sinks.clone(),
                        predicate: predicate.clone(),
                        var: var.clone(),
                    });
                    self.graph.declared_vars.insert(var.clone());
                    self.declared.insert(var.clone());
                }

                let Some(target) = target else {
                    return Ok(src);
                };
                let dst = self.lower(target)?;
                for from in &src.sinks {
                    for to in &dst.sources {
                        let back_edge = self.is_back_edge(*from, *to);
                        self.graph.add_edge(Edge {
                            from: *from,
                            to: *to,
                            predicate: predicate.clone(),
                            back_edge,
                        });
                    }
                }
                Ok(Fragment {
                    sources: src.sources,
                    sinks: dst.sinks,
                })
            }
        }
    }

    fn predicate(&self, condition: &Condition, sinks: &[NodeId]) -> Predicate {
        let negate = condition.negate;
        match &condition.kind {
            ConditionKind::Named(name) if self.declared.contains(name) => Predicate::IfVar {
                name: name.clone(),
                negate,
            },
            ConditionKind::Named(text) | ConditionKind::Literal(text) => Predicate::IfLiteral {
                text: text.clone(),
                negate,
            },
            ConditionKind::Var(name) => Predicate::IfVar {
                name: name.clone(),
                negate,
            },
            ConditionKind::AllSuccess => Predicate::IfAllSuccess {
                branches: sinks.to_vec(),
                negate,
            },
            ConditionKind::AnySuccess => Predicate::IfAnySuccess {
                branches: sinks.to_vec(),
                negate,
            },
        }
    }

    /// A conditional edge back to a checkpoint created earlier.
    fn is_back_edge(&self, from: NodeId, to: NodeId) -> bool {
        to <= from
            && self
                .graph
                .node(to)
                .is_some_and(|n| n.kind == NodeKind::Checkpoint)
    }
}

/// Whether the last step of `node` is a parallel block.
fn ends_in_parallel(node: &AstNode) -> bool {
    match node {
        AstNode::Parallel { .. } => true,
        AstNode::Subgraph { body, .. } => ends_in_parallel(body),
        AstNode::Sequence { right, .. } => ends_in_parallel(right),
        AstNode::Conditional {
            target: Some(target),
            ..
        } => ends_in_parallel(target),
        AstNode::Conditional { source, .. } => ends_in_parallel(source),
        AstNode::AgentCall(_) | AstNode::Checkpoint { .. } => false,
    }
}
