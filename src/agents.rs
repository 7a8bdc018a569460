use std::process::Stdio;

use futures::future::BoxFuture;
use tracing::debug;

use weft_core::config::AgentCommandConfig;
use weft_core::error::{Result, WeftError};
use weft_core::steering::{
    CheckpointPause, FailurePause, NodeSpec, Pause, SteeringCommand, SteeringNotice,
};
use weft_core::traits::{ConditionInterpreter, Executor, SteeringHandler};
use weft_core::{AgentRequest, ConditionContext, NodeId};

/// Runs an agent as an external process and returns its stdout.
pub struct CommandExecutor {
    config: AgentCommandConfig,
}

impl CommandExecutor {
    pub fn new(config: AgentCommandConfig) -> Self {
        Self { config }
    }

    fn args(&self, request: &AgentRequest) -> Vec<String> {
        let model = request
            .model
            .as_deref()
            .or(self.config.model.as_deref())
            .unwrap_or_default();
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{instruction}", &request.instruction)
                    .replace("{agent}", &request.agent_ref)
                    .replace("{model}", model)
                    .replace("{prompt}", request.prompt.as_deref().unwrap_or_default())
            })
            .collect()
    }
}

impl Executor for CommandExecutor {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let args = self.args(&request);
            debug!(command = %self.config.command, agent = %request.agent_ref, "Spawning agent command");
            let output = tokio::process::Command::new(&self.config.command)
                .args(&args)
                .envs(&self.config.env)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| WeftError::AgentExecution {
                    agent: request.agent_ref.clone(),
                    message: format!("failed to start '{}': {}", self.config.command, e),
                })?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
                let message = if stderr.is_empty() {
                    format!("exited with {}", output.status)
                } else {
                    stderr
                };
                Err(WeftError::AgentExecution {
                    agent: request.agent_ref,
                    message,
                })
            }
        })
    }
}

/// Dry-run executor: every agent "succeeds" by echoing its request.
pub struct EchoExecutor;

impl Executor for EchoExecutor {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            Ok(format!(
                "[dry-run] {}: {}",
                request.agent_ref, request.instruction
            ))
        })
    }
}

/// Interactive steering on the terminal.
pub struct TerminalSteering;

impl SteeringHandler for TerminalSteering {
    fn decide(&self, pause: Pause) -> BoxFuture<'_, Option<SteeringCommand>> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || match pause {
                Pause::Checkpoint(p) => checkpoint_menu(&p),
                Pause::Failure(p) => failure_menu(&p),
            })
            .await
            .ok()
            .flatten()
        })
    }

    fn notify(&self, notice: SteeringNotice) -> BoxFuture<'_, ()> {
        match notice {
            SteeringNotice::Output(out) => {
                eprintln!("\n--- #{} {} ---\n{}\n", out.node, out.agent, out.output);
            }
            SteeringNotice::Rejected { command, error } => {
                eprintln!("[rejected: {}] {}", command, error);
            }
        }
        Box::pin(async {})
    }
}

fn checkpoint_menu(pause: &CheckpointPause) -> Option<SteeringCommand> {
    eprintln!("\n[CHECKPOINT @{}] (node #{})", pause.label, pause.node);
    if let Some(prompt) = &pause.prompt {
        eprintln!("{}", prompt);
    }
    for out in &pause.reachable_outputs {
        eprintln!("  #{} {}: {}", out.node, out.agent, truncate(&out.output, 80));
    }

    let items = [
        "Continue",
        "Jump to node",
        "Repeat previous step",
        "Edit workflow",
        "View output",
        "Quit",
    ];
    let choice = dialoguer::Select::new()
        .with_prompt("Next")
        .items(&items)
        .default(0)
        .interact()
        .ok()?;

    match choice {
        0 => Some(SteeringCommand::Continue),
        1 => Some(SteeringCommand::Jump(ask_node("Jump to node")?)),
        2 => Some(SteeringCommand::Repeat),
        3 => {
            let source: String = dialoguer::Input::new()
                .with_prompt("New workflow")
                .interact_text()
                .ok()?;
            Some(SteeringCommand::Edit(source))
        }
        4 => Some(SteeringCommand::ViewOutput(ask_node("Show output of node")?)),
        _ => Some(SteeringCommand::Quit),
    }
}

fn failure_menu(pause: &FailurePause) -> Option<SteeringCommand> {
    eprintln!(
        "\n[FAILED] node #{} ({}) after {} attempt(s)\n  {}",
        pause.node, pause.agent, pause.attempts, pause.error
    );

    let items = [
        "Retry",
        "Skip",
        "Fork into alternatives",
        "Debug (insert a step before it)",
        "Quit",
    ];
    let choice = dialoguer::Select::new()
        .with_prompt("Recover")
        .items(&items)
        .default(0)
        .interact()
        .ok()?;

    match choice {
        0 => Some(SteeringCommand::Retry),
        1 => Some(SteeringCommand::Skip),
        2 => {
            let mut specs = Vec::new();
            loop {
                let line: String = dialoguer::Input::new()
                    .with_prompt("Alternative (agent instruction, empty to finish)")
                    .allow_empty(true)
                    .interact_text()
                    .ok()?;
                match parse_node_spec(&line) {
                    Some(spec) => specs.push(spec),
                    None if line.trim().is_empty() => break,
                    None => eprintln!("expected: <agent> <instruction>"),
                }
            }
            Some(SteeringCommand::Fork(specs))
        }
        3 => {
            let line: String = dialoguer::Input::new()
                .with_prompt("Debug step (agent instruction)")
                .interact_text()
                .ok()?;
            parse_node_spec(&line).map(SteeringCommand::Debug)
        }
        _ => Some(SteeringCommand::Quit),
    }
}

fn ask_node(prompt: &str) -> Option<NodeId> {
    let text: String = dialoguer::Input::new()
        .with_prompt(prompt)
        .interact_text()
        .ok()?;
    text.trim().parse().ok()
}

/// `agent instruction text` with the instruction optionally quoted.
pub fn parse_node_spec(line: &str) -> Option<NodeSpec> {
    let (agent, instruction) = line.trim().split_once(char::is_whitespace)?;
    let instruction = instruction.trim();
    let instruction = instruction
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(instruction);
    if agent.is_empty() || instruction.is_empty() {
        return None;
    }
    Some(NodeSpec::new(agent, instruction))
}

/// Asks the operator to decide literal conditions.
pub struct AskInterpreter;

impl ConditionInterpreter for AskInterpreter {
    fn evaluate(&self, condition: String, ctx: ConditionContext) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if let Some(node) = ctx.node {
                    eprintln!("\n[CONDITION] after node #{}:", node);
                }
                eprintln!("{}", truncate(&ctx.last_output, 400));
                dialoguer::Confirm::new()
                    .with_prompt(format!("Does \"{}\" hold?", condition))
                    .default(false)
                    .interact()
                    .unwrap_or(false)
            })
            .await
            .unwrap_or(false)
        })
    }
}

/// Longest prefix of `s` within `max` bytes that ends on a char boundary.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
