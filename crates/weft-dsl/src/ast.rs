use serde::{Deserialize, Serialize};

use weft_core::{AgentKind, Position, Span};

/// A parsed workflow: temp agent definitions followed by one expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub definitions: Vec<TempAgentDef>,
    pub body: AstNode,
}

/// `$name := { base: explore, prompt: "...", model: "..." }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempAgentDef {
    pub name: String,
    pub base: AgentKind,
    pub prompt: String,
    pub model: Option<String>,
    pub pos: Position,
}

/// Who an agent call invokes, before namespace resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum AgentTarget {
    /// Builtin or `ns:agent`.
    Named(String),
    /// `$name`, defined earlier in the same workflow.
    Temp(String),
}

impl AgentTarget {
    /// The name as written, `$` included for temp agents.
    pub fn source_name(&self) -> String {
        match self {
            Self::Named(name) => name.clone(),
            Self::Temp(name) => format!("${}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentCall {
    pub agent: AgentTarget,
    /// Instruction text with `{var}` markers left in place.
    pub instruction: String,
    pub output_var: Option<String>,
    pub pos: Position,
}

/// What a condition tests, as far as the parser can tell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConditionKind {
    /// `(if ok)`: a variable if one named `ok` exists by then, else literal text.
    Named(String),
    /// `(if {ok})`: always a variable.
    Var(String),
    /// Free text for the condition interpreter.
    Literal(String),
    AllSuccess,
    AnySuccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    /// Written as `(if !...)`.
    pub negate: bool,
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum AstNode {
    AgentCall(AgentCall),
    Sequence {
        left: Box<AstNode>,
        right: Box<AstNode>,
    },
    Parallel {
        branches: Vec<AstNode>,
    },
    /// `source (cond)[:bind] ~> [target]`. `target` is absent only for a
    /// binding step, whose result is stored in `bind_var`.
    Conditional {
        source: Box<AstNode>,
        condition: Condition,
        bind_var: Option<String>,
        target: Option<Box<AstNode>>,
    },
    Checkpoint {
        label: String,
        prompt: Option<String>,
        pos: Position,
    },
    Subgraph {
        body: Box<AstNode>,
        span: Span,
    },
}

impl AstNode {
    /// Where the node starts in source.
    pub fn position(&self) -> Position {
        match self {
            Self::AgentCall(call) => call.pos,
            Self::Sequence { left, .. } => left.position(),
            Self::Parallel { branches } => branches
                .first()
                .map(AstNode::position)
                .unwrap_or_default(),
            Self::Conditional { source, .. } => source.position(),
            Self::Checkpoint { pos, .. } => *pos,
            Self::Subgraph { span, .. } => span.start,
        }
    }
}
