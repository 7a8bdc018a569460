use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A node the operator wants inserted into a running graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Agent name as the operator wrote it; resolved through the registry.
    pub agent: String,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
}

impl NodeSpec {
    pub fn new(agent: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            instruction: instruction.into(),
            output_var: None,
        }
    }

    pub fn with_output(mut self, var: impl Into<String>) -> Self {
        self.output_var = Some(var.into());
        self
    }
}

/// Operator commands. Which ones apply depends on why the run paused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "arg", rename_all = "snake_case")]
pub enum SteeringCommand {
    // Checkpoint commands
    Continue,
    Jump(NodeId),
    Repeat,
    Edit(String),
    ViewOutput(NodeId),
    // Failure commands
    Retry,
    Skip,
    Fork(Vec<NodeSpec>),
    Debug(NodeSpec),
    // Both
    Quit,
}

impl SteeringCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Jump(_) => "jump",
            Self::Repeat => "repeat",
            Self::Edit(_) => "edit",
            Self::ViewOutput(_) => "view_output",
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Fork(_) => "fork",
            Self::Debug(_) => "debug",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for SteeringCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jump(id) | Self::ViewOutput(id) => write!(f, "{} {}", self.name(), id),
            Self::Fork(branches) => write!(f, "fork x{}", branches.len()),
            Self::Debug(spec) => write!(f, "debug {}", spec.agent),
            _ => f.write_str(self.name()),
        }
    }
}

/// Output of a completed node, as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub node: NodeId,
    pub agent: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPause {
    pub node: NodeId,
    pub label: String,
    pub prompt: Option<String>,
    /// Outputs of completed nodes upstream of the checkpoint.
    pub reachable_outputs: Vec<NodeOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePause {
    pub node: NodeId,
    pub agent: String,
    pub instruction: String,
    pub error: String,
    pub attempts: u32,
}

/// Why the scheduler is waiting for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pause {
    Checkpoint(CheckpointPause),
    Failure(FailurePause),
}

impl Pause {
    pub fn node(&self) -> NodeId {
        match self {
            Self::Checkpoint(p) => p.node,
            Self::Failure(p) => p.node,
        }
    }
}

/// Information sent back to the operator between prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SteeringNotice {
    Output(NodeOutput),
    Rejected { command: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_display() {
        assert_eq!(SteeringCommand::Jump(NodeId(4)).to_string(), "jump 4");
        assert_eq!(SteeringCommand::Continue.to_string(), "continue");
        let fork = SteeringCommand::Fork(vec![
            NodeSpec::new("explore", "a"),
            NodeSpec::new("code", "b"),
        ]);
        assert_eq!(fork.to_string(), "fork x2");
    }

    #[test]
    fn test_command_json_shape() {
        let json = serde_json::to_value(SteeringCommand::Jump(NodeId(2))).unwrap();
        assert_eq!(json["command"], "jump");
        assert_eq!(json["arg"], 2);
        let parsed: SteeringCommand =
            serde_json::from_value(serde_json::json!({"command": "retry"})).unwrap();
        assert_eq!(parsed, SteeringCommand::Retry);
    }
}
