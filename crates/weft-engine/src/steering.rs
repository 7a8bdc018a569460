use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

use weft_core::steering::{NodeOutput, NodeSpec, Pause, SteeringCommand, SteeringNotice};
use weft_core::traits::SteeringHandler;
use weft_core::{NodeId, Registry, SteeringError, TraceEvent};
use weft_graph::is_callable;

use crate::state::ExecutionState;

/// What the scheduler does after a command is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// Leave the pause and keep scheduling.
    Resume,
    /// Stay paused; hand this to the operator and ask again.
    Notice(SteeringNotice),
    /// Stop the run.
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseState {
    Idle,
    AtCheckpoint(NodeId),
    AtFailure(NodeId),
}

impl PauseState {
    fn describe(&self) -> &'static str {
        match self {
            Self::Idle => "while the run is not paused",
            Self::AtCheckpoint(_) => "at a checkpoint",
            Self::AtFailure(_) => "after a node failure",
        }
    }
}

/// Checks steering commands against the current pause and applies them to
/// the execution state.
pub struct SteeringController {
    registry: Registry,
    state: PauseState,
}

impl SteeringController {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            state: PauseState::Idle,
        }
    }

    pub fn enter(&mut self, pause: &Pause) {
        self.state = match pause {
            Pause::Checkpoint(p) => PauseState::AtCheckpoint(p.node),
            Pause::Failure(p) => PauseState::AtFailure(p.node),
        };
    }

    pub fn leave(&mut self) {
        self.state = PauseState::Idle;
    }

    pub fn is_paused(&self) -> bool {
        self.state != PauseState::Idle
    }

    /// Apply `command`, recording the outcome in the trace. A rejected
    /// command leaves the state untouched and the pause in place.
    pub fn handle(
        &mut self,
        command: &SteeringCommand,
        exec: &mut ExecutionState,
    ) -> Result<Applied, SteeringError> {
        let node = match self.state {
            PauseState::AtCheckpoint(n) | PauseState::AtFailure(n) => Some(n),
            PauseState::Idle => None,
        };
        match self.apply(command, exec) {
            Ok(applied) => {
                info!(command = %command, node = ?node, "Steering command applied");
                exec.record(
                    node,
                    TraceEvent::Steered {
                        command: command.to_string(),
                    },
                );
                if !matches!(applied, Applied::Notice(_)) {
                    self.leave();
                }
                Ok(applied)
            }
            Err(e) => {
                warn!(command = %command, error = %e, "Steering command rejected");
                exec.record(
                    node,
                    TraceEvent::SteeringRejected {
                        command: command.to_string(),
                        error: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    fn apply(
        &self,
        command: &SteeringCommand,
        exec: &mut ExecutionState,
    ) -> Result<Applied, SteeringError> {
        match (self.state, command) {
            (PauseState::Idle, _) => Err(self.not_allowed(command)),
            (_, SteeringCommand::Quit) => Ok(Applied::Quit),

            (PauseState::AtCheckpoint(cp), SteeringCommand::Continue) => {
                exec.pass_checkpoint(cp);
                Ok(Applied::Resume)
            }
            (PauseState::AtCheckpoint(cp), SteeringCommand::Jump(target)) => {
                if !exec.graph().contains(*target) {
                    return Err(SteeringError::UnknownNode(*target));
                }
                if *target == cp {
                    return Err(SteeringError::JumpToSelf(cp));
                }
                exec.jump(cp, *target);
                Ok(Applied::Resume)
            }
            (PauseState::AtCheckpoint(cp), SteeringCommand::Repeat) => {
                if exec.graph().predecessors(cp).is_empty() {
                    return Err(SteeringError::NothingToRepeat(cp));
                }
                exec.repeat(cp);
                Ok(Applied::Resume)
            }
            (PauseState::AtCheckpoint(cp), SteeringCommand::Edit(source)) => {
                let seeds = exec.vars().names();
                let graph = weft_graph::compile_with(
                    source,
                    &self.registry,
                    exec.graph().next_id(),
                    &seeds,
                )
                .map_err(|e| SteeringError::EditRejected {
                    diagnostics: e.diagnostics(),
                })?;
                exec.pass_checkpoint(cp);
                exec.replace_graph(graph);
                Ok(Applied::Resume)
            }
            (PauseState::AtCheckpoint(_), SteeringCommand::ViewOutput(id)) => {
                let node = exec
                    .graph()
                    .node(*id)
                    .ok_or(SteeringError::UnknownNode(*id))?;
                let output = exec.output(*id).ok_or(SteeringError::NoOutput(*id))?;
                Ok(Applied::Notice(SteeringNotice::Output(NodeOutput {
                    node: *id,
                    agent: node.display_name(),
                    output: output.to_string(),
                })))
            }

            (PauseState::AtFailure(node), SteeringCommand::Retry) => {
                exec.retry(node, false);
                Ok(Applied::Resume)
            }
            (PauseState::AtFailure(node), SteeringCommand::Skip) => {
                exec.skip(node);
                Ok(Applied::Resume)
            }
            (PauseState::AtFailure(node), SteeringCommand::Fork(specs)) => {
                if specs.is_empty() {
                    return Err(SteeringError::InvalidFork(
                        "at least one alternative is required".into(),
                    ));
                }
                for spec in specs {
                    self.check_spec(spec, node, exec)?;
                }
                exec.fork(node, specs, &self.registry);
                Ok(Applied::Resume)
            }
            (PauseState::AtFailure(node), SteeringCommand::Debug(spec)) => {
                self.check_spec(spec, node, exec)?;
                exec.insert_before(node, spec, &self.registry);
                Ok(Applied::Resume)
            }

            _ => Err(self.not_allowed(command)),
        }
    }

    fn check_spec(
        &self,
        spec: &NodeSpec,
        failed: NodeId,
        exec: &ExecutionState,
    ) -> Result<(), SteeringError> {
        let agent_ref = self.registry.resolve(&spec.agent);
        if !is_callable(exec.graph(), &self.registry, &agent_ref) {
            return Err(SteeringError::UnknownAgent(agent_ref));
        }
        if let Some(var) = &spec.output_var {
            let taken = exec
                .graph()
                .producers(var)
                .into_iter()
                .any(|id| id != failed);
            if taken {
                return Err(SteeringError::InvalidFork(format!(
                    "variable '{}' already has a producer",
                    var
                )));
            }
        }
        Ok(())
    }

    fn not_allowed(&self, command: &SteeringCommand) -> SteeringError {
        SteeringError::NotAllowed {
            command: command.name().to_string(),
            state: self.state.describe().to_string(),
        }
    }
}

// ── Handlers ──────────────────────────────────────────────────────

/// Continues through every checkpoint. Failures either stop the run or,
/// with `skip_failures`, are skipped.
#[derive(Debug, Clone, Default)]
pub struct AutoSteering {
    skip_failures: bool,
}

impl AutoSteering {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip_failures() -> Self {
        Self {
            skip_failures: true,
        }
    }
}

impl SteeringHandler for AutoSteering {
    fn decide(&self, pause: Pause) -> BoxFuture<'_, Option<SteeringCommand>> {
        let decision = match pause {
            Pause::Checkpoint(_) => Some(SteeringCommand::Continue),
            Pause::Failure(_) if self.skip_failures => Some(SteeringCommand::Skip),
            Pause::Failure(_) => None,
        };
        Box::pin(async move { decision })
    }
}

/// Message sent to whatever front end drives a [`ChannelSteering`].
#[derive(Debug, Clone)]
pub enum SteeringMessage {
    Paused { id: String, pause: Pause },
    Notice(SteeringNotice),
}

/// Steering driven from another task: pauses are announced on a channel
/// and answered with [`ChannelSteering::respond`].
pub struct ChannelSteering {
    pending: Mutex<HashMap<String, (Pause, oneshot::Sender<SteeringCommand>)>>,
    tx: mpsc::UnboundedSender<SteeringMessage>,
    seq: AtomicU64,
}

impl ChannelSteering {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SteeringMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let steering = Self {
            pending: Mutex::new(HashMap::new()),
            tx,
            seq: AtomicU64::new(0),
        };
        (steering, rx)
    }

    /// Answer a pending pause. Returns true if it was found.
    pub async fn respond(&self, pause_id: &str, command: SteeringCommand) -> bool {
        let entry = self.pending.lock().await.remove(pause_id);
        if let Some((_pause, tx)) = entry {
            // Ignore send error (run may have been cancelled)
            let _ = tx.send(command);
            true
        } else {
            false
        }
    }

    pub async fn pending(&self) -> Vec<(String, Pause)> {
        let mut list: Vec<(String, Pause)> = self
            .pending
            .lock()
            .await
            .iter()
            .map(|(id, (pause, _))| (id.clone(), pause.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }
}

impl SteeringHandler for ChannelSteering {
    fn decide(&self, pause: Pause) -> BoxFuture<'_, Option<SteeringCommand>> {
        Box::pin(async move {
            let id = format!("pause-{}", self.seq.fetch_add(1, Ordering::Relaxed));
            let (tx, rx) = oneshot::channel();
            self.pending
                .lock()
                .await
                .insert(id.clone(), (pause.clone(), tx));
            if self.tx.send(SteeringMessage::Paused { id: id.clone(), pause }).is_err() {
                self.pending.lock().await.remove(&id);
                return None;
            }
            rx.await.ok()
        })
    }

    fn notify(&self, notice: SteeringNotice) -> BoxFuture<'_, ()> {
        let _ = self.tx.send(SteeringMessage::Notice(notice));
        Box::pin(async {})
    }
}
