use thiserror::Error;

use crate::types::{NodeId, Position};

/// A failure while turning source text into tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lex error at {pos}: {reason}")]
pub struct LexError {
    pub pos: Position,
    pub reason: String,
}

impl LexError {
    pub fn new(pos: Position, reason: impl Into<String>) -> Self {
        Self {
            pos,
            reason: reason.into(),
        }
    }
}

/// A failure while building the syntax tree from tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("parse error at {pos}: expected {expected}, found {found}")]
    Unexpected {
        pos: Position,
        expected: String,
        found: String,
    },

    #[error("undefined temp agent ${name} at {pos}")]
    UndefinedTempAgent { pos: Position, name: String },

    #[error("invalid identifier '{ident}' at {pos}")]
    InvalidIdentifier { pos: Position, ident: String },

    #[error("temp agent ${name} defined twice (second definition at {pos})")]
    DuplicateTempAgent { pos: Position, name: String },

    #[error("invalid definition of temp agent ${name} at {pos}: {reason}")]
    InvalidTempAgent {
        pos: Position,
        name: String,
        reason: String,
    },
}

impl ParseError {
    pub fn position(&self) -> Position {
        match self {
            Self::Unexpected { pos, .. }
            | Self::UndefinedTempAgent { pos, .. }
            | Self::InvalidIdentifier { pos, .. }
            | Self::DuplicateTempAgent { pos, .. }
            | Self::InvalidTempAgent { pos, .. } => *pos,
        }
    }
}

/// Structural and data-flow problems found before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("subgraph opened at {start} is never closed")]
    UnclosedSubgraph { start: Position },

    #[error("node {node} is unreachable: no incoming edge and not an entry point")]
    OrphanedNode { node: NodeId },

    #[error("node {node} references unknown agent '{agent}'")]
    UnknownAgent { node: NodeId, agent: String },

    #[error("illegal cycle: {}", format_path(.path))]
    IllegalCycle { path: Vec<NodeId> },

    #[error("variable '{name}' used by node {node} is never produced")]
    UndefinedVariable { name: String, node: NodeId },

    #[error("variable '{name}' used by node {node} is not guaranteed to exist when it runs")]
    VariableNotGuaranteed { name: String, node: NodeId },

    #[error("undefined temp agent ${name} at {pos}")]
    UndefinedTempAgent { name: String, pos: Position },

    #[error("edge {from} -> {to} points at a missing node")]
    DanglingEdge { from: NodeId, to: NodeId },

    /// `owner` is `None` when the variable is bound before the graph runs.
    #[error("variable '{name}' produced by node {node} {}", format_owner(.owner))]
    DuplicateProducer {
        name: String,
        node: NodeId,
        owner: Option<NodeId>,
    },
}

fn format_owner(owner: &Option<NodeId>) -> String {
    match owner {
        Some(id) => format!("is already produced by node {}", id),
        None => "is already bound".to_string(),
    }
}

fn format_path(path: &[NodeId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Everything that can stop a workflow before it runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("workflow failed validation with {} error(s)", .0.len())]
    Invalid(Vec<ValidationError>),
}

impl CompileError {
    /// One human-readable line per problem.
    pub fn diagnostics(&self) -> Vec<String> {
        match self {
            Self::Lex(e) => vec![e.to_string()],
            Self::Parse(e) => vec![e.to_string()],
            Self::Invalid(errors) => errors.iter().map(|e| e.to_string()).collect(),
        }
    }
}

impl From<ValidationError> for CompileError {
    fn from(err: ValidationError) -> Self {
        Self::Invalid(vec![err])
    }
}

/// Node-level failures raised while a workflow executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("node {node} ({agent}) failed: {message}")]
    AgentFailed {
        node: NodeId,
        agent: String,
        message: String,
    },

    #[error("node {node} ({agent}) timed out after {timeout_secs}s")]
    Timeout {
        node: NodeId,
        agent: String,
        timeout_secs: u64,
    },

    #[error("node {node} needs variable '{name}' which is not available")]
    VariableUnavailable { node: NodeId, name: String },

    #[error("node {node} cannot bind '{name}': already produced by node {owner}")]
    VariableAlreadyBound {
        node: NodeId,
        name: String,
        owner: NodeId,
    },
}

impl RuntimeError {
    pub fn node(&self) -> NodeId {
        match self {
            Self::AgentFailed { node, .. }
            | Self::Timeout { node, .. }
            | Self::VariableUnavailable { node, .. }
            | Self::VariableAlreadyBound { node, .. } => *node,
        }
    }
}

/// A steering command that cannot be applied. The operator is re-prompted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SteeringError {
    #[error("'{command}' is not available {state}")]
    NotAllowed { command: String, state: String },

    #[error("no node with id {0}")]
    UnknownNode(NodeId),

    #[error("node {0} has no output yet")]
    NoOutput(NodeId),

    #[error("checkpoint {0} has no predecessor to repeat")]
    NothingToRepeat(NodeId),

    #[error("cannot jump from checkpoint {0} to itself")]
    JumpToSelf(NodeId),

    #[error("edited workflow rejected: {}", .diagnostics.join("; "))]
    EditRejected { diagnostics: Vec<String> },

    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    #[error("invalid fork: {0}")]
    InvalidFork(String),
}

#[derive(Debug, Error)]
pub enum WeftError {
    // Language errors
    #[error(transparent)]
    Compile(#[from] CompileError),

    // Execution errors
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Steering(#[from] SteeringError),

    #[error("Agent execution failed: {agent}: {message}")]
    AgentExecution { agent: String, message: String },

    #[error("Agent timeout after {timeout_secs}s: {agent}")]
    AgentTimeout { agent: String, timeout_secs: u64 },

    #[error("Run cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LexError> for WeftError {
    fn from(err: LexError) -> Self {
        Self::Compile(CompileError::Lex(err))
    }
}

impl From<ParseError> for WeftError {
    fn from(err: ParseError) -> Self {
        Self::Compile(CompileError::Parse(err))
    }
}

pub type Result<T> = std::result::Result<T, WeftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_path() {
        let err = ValidationError::IllegalCycle {
            path: vec![NodeId(1), NodeId(2), NodeId(1)],
        };
        assert_eq!(err.to_string(), "illegal cycle: 1 -> 2 -> 1");
    }

    #[test]
    fn test_duplicate_producer_message() {
        let err = ValidationError::DuplicateProducer {
            name: "r".into(),
            node: NodeId(1),
            owner: Some(NodeId(0)),
        };
        assert_eq!(
            err.to_string(),
            "variable 'r' produced by node 1 is already produced by node 0"
        );
        let seeded = ValidationError::DuplicateProducer {
            name: "r".into(),
            node: NodeId(2),
            owner: None,
        };
        assert_eq!(seeded.to_string(), "variable 'r' produced by node 2 is already bound");
    }

    #[test]
    fn test_compile_diagnostics_one_per_error() {
        let err = CompileError::Invalid(vec![
            ValidationError::OrphanedNode { node: NodeId(3) },
            ValidationError::UnknownAgent {
                node: NodeId(4),
                agent: "nope".into(),
            },
        ]);
        let lines = err.diagnostics();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("nope"));
    }

    #[test]
    fn test_parse_error_position() {
        let pos = Position::new(4, 1, 5);
        let err = ParseError::Unexpected {
            pos,
            expected: "']'".into(),
            found: "end of input".into(),
        };
        assert_eq!(err.position(), pos);
        assert!(err.to_string().contains("1:5"));
    }

    #[test]
    fn test_lex_error_converts_into_weft_error() {
        let err: WeftError = LexError::new(Position::start(), "unterminated string").into();
        assert!(matches!(err, WeftError::Compile(CompileError::Lex(_))));
    }
}
