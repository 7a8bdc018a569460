//! Workflow text to validated execution graph.
//!
//! `compile` chains the lexer, parser, graph builder and validator. It fails
//! on the first lex or parse error, and reports every validation error at
//! once.

pub mod builder;
pub mod graph;
pub mod validate;

use std::collections::BTreeSet;

pub use builder::{build, GraphBuilder};
pub use graph::{ConditionBinding, Edge, Graph, JoinPoint, Node, NodeKind, Predicate, TempAgent};
pub use validate::{is_callable, validate, validate_with_seeds, Validator};

use weft_core::{CompileError, NodeId, Registry};

/// Compile workflow source into a validated graph.
pub fn compile(source: &str, registry: &Registry) -> Result<Graph, CompileError> {
    compile_with(source, registry, NodeId(0), &BTreeSet::new())
}

/// Compile with node ids starting at `first` and `seeds` treated as bound.
pub fn compile_with(
    source: &str,
    registry: &Registry,
    first: NodeId,
    seeds: &BTreeSet<String>,
) -> Result<Graph, CompileError> {
    let workflow = weft_dsl::parse_source(source)?;
    let graph = GraphBuilder::new(registry)
        .starting_at(first)
        .with_seeds(seeds.iter().cloned())
        .build(&workflow)?;
    let errors = validate_with_seeds(&graph, registry, seeds);
    if errors.is_empty() {
        tracing::debug!(nodes = graph.len(), "Workflow compiled");
        Ok(graph)
    } else {
        Err(CompileError::Invalid(errors))
    }
}
