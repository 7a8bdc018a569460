use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use weft_core::config::EngineConfig;
use weft_core::error::{Result, WeftError};
use weft_core::event::EventBus;
use weft_core::steering::{CheckpointPause, FailurePause, Pause, SteeringCommand, SteeringNotice};
use weft_core::traits::{ConditionInterpreter, Executor, SteeringHandler};
use weft_core::{
    AgentRequest, CompileError, ConditionContext, NodeId, NodeStatus, Registry, RunStatus,
    RuntimeError, TraceEvent,
};
use weft_graph::{validate_with_seeds, Edge, Graph, NodeKind, Predicate};

use crate::condition::ExpressionInterpreter;
use crate::executor::TimeoutExecutor;
use crate::state::{ExecutionState, RunPhase, RunResult};
use crate::steering::{Applied, AutoSteering, SteeringController};
use crate::vars::VariableStore;

/// How a pause ended.
enum Steered {
    /// `passed` is set when the paused node was left with `continue`.
    Resumed { passed: bool },
    Quit,
    /// The handler had no answer.
    Undecided,
    Cancelled,
}

/// Runs compiled workflow graphs.
///
/// Each iteration resolves conditions, computes the frontier of runnable
/// nodes, then either pauses at a checkpoint or dispatches every runnable
/// agent node as one wave and waits for all of them.
pub struct Engine {
    executor: Arc<dyn Executor>,
    registry: Registry,
    conditions: Arc<dyn ConditionInterpreter>,
    steering: Arc<dyn SteeringHandler>,
    config: EngineConfig,
    event_bus: Option<Arc<EventBus>>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(executor: Arc<dyn Executor>, registry: Registry) -> Self {
        Self {
            executor,
            registry,
            conditions: Arc::new(ExpressionInterpreter),
            steering: Arc::new(AutoSteering::new()),
            config: EngineConfig::default(),
            event_bus: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionInterpreter>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_steering(mut self, steering: Arc<dyn SteeringHandler>) -> Self {
        self.steering = steering;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts the current run when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Compile source with this engine's registry.
    pub fn compile(&self, source: &str) -> std::result::Result<Graph, CompileError> {
        weft_graph::compile(source, &self.registry)
    }

    /// Compile and run. Compile errors are returned before anything executes.
    pub async fn run_source(&self, source: &str) -> Result<RunResult> {
        let graph = self.compile(source)?;
        self.run(graph).await
    }

    pub async fn run(&self, graph: Graph) -> Result<RunResult> {
        self.run_with_vars(graph, BTreeMap::new()).await
    }

    /// Run with variables that exist before the first node.
    ///
    /// Errors only when the graph does not validate; every runtime outcome
    /// is reported through the returned [`RunResult`].
    pub async fn run_with_vars(
        &self,
        graph: Graph,
        seeds: BTreeMap<String, String>,
    ) -> Result<RunResult> {
        let seed_names: BTreeSet<String> = seeds.keys().cloned().collect();
        let errors = validate_with_seeds(&graph, &self.registry, &seed_names);
        if !errors.is_empty() {
            return Err(WeftError::Compile(CompileError::Invalid(errors)));
        }

        let mut state = ExecutionState::new(graph, VariableStore::with_seeds(seeds));
        if let Some(bus) = &self.event_bus {
            state = state.with_event_bus(bus.clone());
        }
        Ok(self.drive(state).await)
    }

    async fn drive(&self, mut state: ExecutionState) -> RunResult {
        let start = Instant::now();
        let executor = self.executor();
        let mut controller = SteeringController::new(self.registry.clone());

        info!(run_id = %state.run_id(), nodes = state.graph().len(), "Run started");
        state.set_phase(RunPhase::Running);
        state.record(None, TraceEvent::RunStarted);

        let (status, reason) = loop {
            if self.cancel.is_cancelled() {
                break (RunStatus::Aborted, Some("cancelled".to_string()));
            }

            self.resolve_conditions(&mut state).await;
            let frontier = compute_frontier(&state);
            state.set_frontier(frontier.clone());

            if frontier.is_empty() {
                if state.graph().nodes.values().any(|n| n.status == NodeStatus::Failed) {
                    break (RunStatus::Failed, Some("unrecovered node failure".to_string()));
                }
                break (RunStatus::Completed, None);
            }

            let checkpoint = frontier
                .iter()
                .copied()
                .find(|id| state.graph().node(*id).is_some_and(|n| n.is_checkpoint()));

            if let Some(cp) = checkpoint {
                let pause = checkpoint_pause(&mut state, cp);
                state.set_phase(RunPhase::Paused);
                match self.steer(&mut state, &mut controller, pause).await {
                    Steered::Resumed { passed } => {
                        state.set_phase(RunPhase::Running);
                        if passed {
                            self.follow_back_edges(&mut state, cp).await;
                        }
                    }
                    Steered::Quit => {
                        break (RunStatus::Aborted, Some("quit at checkpoint".to_string()))
                    }
                    Steered::Undecided => {
                        break (
                            RunStatus::Aborted,
                            Some(format!("no steering decision at checkpoint {}", cp)),
                        )
                    }
                    Steered::Cancelled => {
                        break (RunStatus::Aborted, Some("cancelled".to_string()))
                    }
                }
                continue;
            }

            let wave: Vec<NodeId> = frontier.into_iter().collect();
            let Some(failed) = self.dispatch_wave(&mut state, &executor, &wave).await else {
                break (RunStatus::Aborted, Some("cancelled".to_string()));
            };

            if let Some(outcome) = self.handle_failures(&mut state, &mut controller, failed).await {
                break outcome;
            }
        };

        state.set_phase(match status {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Aborted => RunPhase::Aborted,
            RunStatus::Failed => RunPhase::Failed,
        });
        state.record(None, TraceEvent::RunFinished { status });

        let result = state.into_result(status, reason);
        info!(
            run_id = %result.run_id,
            status = %result.status,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "{}",
            result.summary()
        );
        if !result.unreached.is_empty() && result.status == RunStatus::Completed {
            debug!(unreached = ?result.unreached, "Nodes never became runnable");
        }
        result
    }

    fn executor(&self) -> Arc<dyn Executor> {
        match self.config.node_timeout_secs {
            Some(secs) => Arc::new(TimeoutExecutor::new(
                self.executor.clone(),
                Duration::from_secs(secs),
            )),
            None => self.executor.clone(),
        }
    }

    // ── Conditions ────────────────────────────────────────────────

    /// Evaluate literal edge conditions whose source has completed and
    /// condition bindings whose sources are all done.
    async fn resolve_conditions(&self, state: &mut ExecutionState) {
        let literals: Vec<(NodeId, String)> = state
            .graph()
            .edges
            .iter()
            .filter(|e| state.status(e.from) == Some(NodeStatus::Completed))
            .filter_map(|e| match &e.predicate {
                Predicate::IfLiteral { text, .. } => Some((e.from, text.clone())),
                _ => None,
            })
            .collect();
        for (source, text) in literals {
            self.literal_verdict(state, source, &text).await;
        }

        let ready: Vec<usize> = state
            .graph()
            .bindings
            .iter()
            .enumerate()
            .filter(|(idx, b)| {
                !state.is_bound(*idx)
                    && !b.sources.is_empty()
                    && b.sources.iter().all(|s| state.is_settled(*s))
            })
            .map(|(idx, _)| idx)
            .collect();
        for idx in ready {
            let binding = state.graph().bindings[idx].clone();
            let Some(source) = binding.sources.iter().copied().max() else {
                continue;
            };
            let outcome = match &binding.predicate {
                Predicate::Unconditional => true,
                Predicate::IfVar { name, negate } => {
                    state.vars().is_truthy(name).unwrap_or(false) != *negate
                }
                Predicate::IfLiteral { text, negate } => {
                    self.literal_verdict(state, source, text).await != *negate
                }
                Predicate::IfAllSuccess { branches, negate } => {
                    branches.iter().all(|b| state.status(*b) == Some(NodeStatus::Completed))
                        != *negate
                }
                Predicate::IfAnySuccess { branches, negate } => {
                    branches.iter().any(|b| state.status(*b) == Some(NodeStatus::Completed))
                        != *negate
                }
            };
            info!(
                var = %binding.var,
                condition = %binding.predicate.describe(),
                outcome,
                "Condition bound"
            );
            state.bind_condition(&binding.var, outcome);
            state.mark_bound(idx);
            state.record(
                Some(source),
                TraceEvent::VariableBound {
                    name: binding.var.clone(),
                    value: outcome.to_string(),
                },
            );
        }
    }

    async fn literal_verdict(&self, state: &mut ExecutionState, source: NodeId, text: &str) -> bool {
        if let Some(verdict) = state.verdict(source, text) {
            return verdict;
        }
        let ctx = ConditionContext {
            node: Some(source),
            last_output: state.output(source).unwrap_or_default().to_string(),
            vars: state.vars().snapshot(),
        };
        let verdict = self.conditions.evaluate(text.to_string(), ctx).await;
        debug!(node_id = %source, condition = %text, verdict, "Condition evaluated");
        state.store_verdict(source, text, verdict);
        verdict
    }

    // ── Waves ─────────────────────────────────────────────────────

    /// Run one wave of agent nodes. Returns the nodes that failed, or
    /// `None` if the run was cancelled mid-wave.
    async fn dispatch_wave(
        &self,
        state: &mut ExecutionState,
        executor: &Arc<dyn Executor>,
        wave: &[NodeId],
    ) -> Option<Vec<(NodeId, RuntimeError)>> {
        let mut failed = Vec::new();
        let mut requests = Vec::with_capacity(wave.len());

        for id in wave {
            let Some(node) = state.graph().node(*id).cloned() else {
                continue;
            };
            let instruction = match state.vars().render(&node.instruction, *id) {
                Ok(text) => text,
                Err(e) => {
                    warn!(node_id = %id, error = %e, "Node cannot start");
                    failed.push((*id, e));
                    continue;
                }
            };
            let prompt = node
                .temp_agent
                .as_ref()
                .and_then(|name| state.graph().temp_agents.get(name))
                .map(|t| t.prompt.clone());
            if let Some(join) = state.graph().join_into(*id) {
                debug!(node_id = %id, branches = ?join.branches, "Barrier released");
            }
            let attempt = state.mark_running(*id);
            info!(
                node_id = %id,
                agent = %node.agent_ref,
                attempt,
                "Dispatching node"
            );
            state.record(
                Some(*id),
                TraceEvent::NodeDispatched {
                    agent: node.agent_ref.clone(),
                    instruction: instruction.clone(),
                },
            );
            requests.push(AgentRequest {
                node: *id,
                agent_ref: node.agent_ref,
                instruction,
                model: node.model,
                prompt,
            });
        }

        let limit = match self.config.max_concurrency {
            0 => requests.len().max(1),
            n => n,
        };
        let calls = requests.into_iter().map(|request| {
            let executor = executor.clone();
            async move {
                let node = request.node;
                let agent = request.agent_ref.clone();
                let started = Instant::now();
                let result = executor.run(request).await;
                (node, agent, started.elapsed(), result)
            }
        });
        let wave_future = futures::stream::iter(calls)
            .buffer_unordered(limit)
            .collect::<Vec<_>>();

        let mut results = tokio::select! {
            results = wave_future => results,
            _ = self.cancel.cancelled() => {
                warn!("Run cancelled, discarding in-flight nodes");
                return None;
            }
        };
        results.sort_by_key(|(node, ..)| *node);

        let mut completed = Vec::new();
        for (id, agent, elapsed, result) in results {
            let elapsed_ms = elapsed.as_millis() as u64;
            let outcome = match result {
                Ok(output) => state.complete(id, output),
                Err(e) => Err(runtime_error(id, agent, e)),
            };
            match outcome {
                Ok(()) => {
                    debug!(node_id = %id, elapsed_ms, "Node completed");
                    completed.push(id);
                }
                Err(e) => {
                    error!(node_id = %id, elapsed_ms, error = %e, "Node failed");
                    failed.push((id, e));
                }
            }
        }

        for id in completed {
            self.follow_back_edges(state, id).await;
        }

        failed.sort_by_key(|(id, _)| *id);
        Some(failed)
    }

    /// Take the first back-edge out of a completed agent node or a passed
    /// checkpoint whose condition holds.
    async fn follow_back_edges(&self, state: &mut ExecutionState, id: NodeId) {
        let back_edges: Vec<Edge> = state
            .graph()
            .outgoing(id)
            .filter(|e| e.back_edge)
            .cloned()
            .collect();
        for edge in back_edges {
            if state.status(id) != Some(NodeStatus::Completed) {
                return;
            }
            let holds = match &edge.predicate {
                Predicate::IfLiteral { text, negate } => {
                    self.literal_verdict(state, id, text).await != *negate
                }
                Predicate::IfVar { name, negate } => state
                    .vars()
                    .is_truthy(name)
                    .is_some_and(|v| v != *negate),
                _ => false,
            };
            if !holds {
                continue;
            }

            let iteration = state.count_loop(edge.from, edge.to);
            let limit = self.config.max_loop_iterations;
            if iteration > limit {
                warn!(
                    from = %edge.from,
                    to = %edge.to,
                    limit,
                    "Loop limit reached, not taking back-edge"
                );
                state.record(Some(id), TraceEvent::LoopLimitReached { to: edge.to, limit });
                continue;
            }
            info!(from = %edge.from, to = %edge.to, iteration, "Taking back-edge");
            state.reset_region(edge.to);
            state.record(
                Some(id),
                TraceEvent::BackEdgeTaken {
                    to: edge.to,
                    iteration,
                },
            );
            return;
        }
    }

    // ── Failures and steering ─────────────────────────────────────

    /// Retry or steer each failure in turn. Returns the final outcome when
    /// the run cannot continue.
    async fn handle_failures(
        &self,
        state: &mut ExecutionState,
        controller: &mut SteeringController,
        failures: Vec<(NodeId, RuntimeError)>,
    ) -> Option<(RunStatus, Option<String>)> {
        for (id, err) in &failures {
            state.fail(*id, err);
        }

        for (id, err) in failures {
            if state.status(id) != Some(NodeStatus::Failed) {
                continue;
            }
            let retryable = matches!(
                err,
                RuntimeError::AgentFailed { .. } | RuntimeError::Timeout { .. }
            );
            if retryable && state.attempts(id) <= self.config.max_auto_retries {
                info!(node_id = %id, attempt = state.attempts(id), "Retrying failed node");
                state.retry(id, true);
                continue;
            }

            let pause = failure_pause(state, id, &err);
            state.set_phase(RunPhase::Failed);
            match self.steer(state, controller, pause).await {
                Steered::Resumed { .. } => state.set_phase(RunPhase::Running),
                Steered::Quit => {
                    return Some((RunStatus::Aborted, Some(format!("quit after {}", err))))
                }
                Steered::Undecided => return Some((RunStatus::Failed, Some(err.to_string()))),
                Steered::Cancelled => {
                    return Some((RunStatus::Aborted, Some("cancelled".to_string())))
                }
            }
        }
        None
    }

    /// Ask the handler until a command resumes or stops the run.
    async fn steer(
        &self,
        state: &mut ExecutionState,
        controller: &mut SteeringController,
        pause: Pause,
    ) -> Steered {
        controller.enter(&pause);
        loop {
            let decision = tokio::select! {
                decision = self.steering.decide(pause.clone()) => decision,
                _ = self.cancel.cancelled() => {
                    controller.leave();
                    return Steered::Cancelled;
                }
            };
            let Some(command) = decision else {
                warn!(node_id = %pause.node(), "No steering decision");
                controller.leave();
                return Steered::Undecided;
            };
            match controller.handle(&command, state) {
                Ok(Applied::Resume) => {
                    return Steered::Resumed {
                        passed: matches!(command, SteeringCommand::Continue),
                    }
                }
                Ok(Applied::Quit) => {
                    controller.leave();
                    return Steered::Quit;
                }
                Ok(Applied::Notice(notice)) => self.steering.notify(notice).await,
                Err(e) => {
                    self.steering
                        .notify(SteeringNotice::Rejected {
                            command: command.to_string(),
                            error: e.to_string(),
                        })
                        .await
                }
            }
        }
    }
}

/// Pending nodes that may run now, ascending.
fn compute_frontier(state: &ExecutionState) -> BTreeSet<NodeId> {
    let graph = state.graph();
    graph
        .nodes
        .values()
        .filter(|n| n.status == NodeStatus::Pending && !state.is_bypassed(n.id))
        .filter(|n| {
            state.is_forced(n.id)
                || graph
                    .forward_incoming(n.id)
                    .all(|edge| edge_satisfied(state, edge))
        })
        .map(|n| n.id)
        .collect()
}

fn edge_satisfied(state: &ExecutionState, edge: &Edge) -> bool {
    let source = state.status(edge.from);
    let completed = source == Some(NodeStatus::Completed);
    match &edge.predicate {
        Predicate::Unconditional => {
            completed || source == Some(NodeStatus::Skipped) || state.is_bypassed(edge.from)
        }
        Predicate::IfVar { name, negate } => {
            completed && state.vars().is_truthy(name).is_some_and(|v| v != *negate)
        }
        Predicate::IfLiteral { text, negate } => {
            completed && state.verdict(edge.from, text).is_some_and(|v| v != *negate)
        }
        Predicate::IfAllSuccess { branches, negate } => {
            branches.iter().all(|b| state.is_settled(*b))
                && branches
                    .iter()
                    .all(|b| state.status(*b) == Some(NodeStatus::Completed))
                    != *negate
        }
        Predicate::IfAnySuccess { branches, negate } => {
            branches.iter().all(|b| state.is_settled(*b))
                && branches
                    .iter()
                    .any(|b| state.status(*b) == Some(NodeStatus::Completed))
                    != *negate
        }
    }
}

fn checkpoint_pause(state: &mut ExecutionState, id: NodeId) -> Pause {
    let (label, prompt) = state
        .graph()
        .node(id)
        .filter(|n| n.kind == NodeKind::Checkpoint)
        .map(|n| (n.label.clone().unwrap_or_default(), n.prompt.clone()))
        .unwrap_or_default();
    info!(node_id = %id, label = %label, "Paused at checkpoint");
    state.record(Some(id), TraceEvent::CheckpointReached { label: label.clone() });
    Pause::Checkpoint(CheckpointPause {
        node: id,
        label,
        prompt,
        reachable_outputs: state.reachable_outputs(id),
    })
}

fn failure_pause(state: &ExecutionState, id: NodeId, err: &RuntimeError) -> Pause {
    let node = state.graph().node(id);
    Pause::Failure(FailurePause {
        node: id,
        agent: node.map(|n| n.agent_ref.clone()).unwrap_or_default(),
        instruction: node.map(|n| n.instruction.clone()).unwrap_or_default(),
        error: err.to_string(),
        attempts: state.attempts(id),
    })
}

fn runtime_error(node: NodeId, agent: String, err: WeftError) -> RuntimeError {
    match err {
        WeftError::AgentTimeout { timeout_secs, .. } => RuntimeError::Timeout {
            node,
            agent,
            timeout_secs,
        },
        WeftError::AgentExecution { message, .. } => RuntimeError::AgentFailed {
            node,
            agent,
            message,
        },
        WeftError::Runtime(e) => e,
        other => RuntimeError::AgentFailed {
            node,
            agent,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::steering::SteeringCommand;
    use weft_test_utils::{shared_executor, MockExecutor, ScriptedSteering, StaticInterpreter};

    fn engine(exec: Arc<dyn Executor>) -> Engine {
        Engine::new(exec, Registry::default())
    }

    #[tokio::test]
    async fn test_sequence_passes_output() {
        let (mock, exec) = shared_executor(
            MockExecutor::new()
                .respond("explore", "3 bugs")
                .respond("code", "fixed"),
        );
        let result = engine(exec)
            .run_source(r#"explore:"find bugs":bugs -> code:"fix {bugs}""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.vars.get("bugs").map(String::as_str), Some("3 bugs"));
        let calls = mock.calls();
        assert_eq!(calls[1].instruction, "fix 3 bugs");
        assert_eq!(mock.called_nodes(), vec![NodeId(0), NodeId(1)]);
    }

    #[tokio::test]
    async fn test_parallel_block_is_a_barrier() {
        let (mock, exec) = shared_executor(
            MockExecutor::new().with_delay(Duration::from_millis(20)),
        );
        let result = engine(exec)
            .run_source(r#"[explore:"a" || review:"b" || test:"c"] -> code:"d""#)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(mock.peak_concurrency(), 3);
        assert_eq!(mock.called_nodes().last(), Some(&NodeId(3)));
    }

    #[tokio::test]
    async fn test_default_config_runs_wide_wave_at_once() {
        let (mock, exec) = shared_executor(
            MockExecutor::new().with_delay(Duration::from_millis(20)),
        );
        engine(exec)
            .with_config(EngineConfig::default())
            .run_source(
                r#"[explore:"a" || review:"b" || test:"c" || plan:"d" || code:"e" || general-purpose:"f"]"#,
            )
            .await
            .unwrap();
        assert_eq!(mock.peak_concurrency(), 6);
    }

    #[tokio::test]
    async fn test_max_concurrency_bounds_wave() {
        let (mock, exec) = shared_executor(
            MockExecutor::new().with_delay(Duration::from_millis(20)),
        );
        let config = EngineConfig {
            max_concurrency: 2,
            ..EngineConfig::default()
        };
        engine(exec)
            .with_config(config)
            .run_source(r#"[explore:"a" || review:"b" || test:"c"]"#)
            .await
            .unwrap();
        assert_eq!(mock.peak_concurrency(), 2);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_literal_condition_false_skips_target() {
        let (mock, exec) = shared_executor(MockExecutor::new().respond("test", "2 failing"));
        let result = engine(exec)
            .run_source(r#"test:"run" (if all green)~> code:"ship""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.unreached, vec![NodeId(1)]);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_negated_literal_uses_interpreter_once() {
        let (mock, exec) = shared_executor(MockExecutor::new());
        let interp = Arc::new(StaticInterpreter::new().with("ready", false));
        let result = engine(exec)
            .with_conditions(interp.clone())
            .run_source(r#"plan:"p" (if !ready)~> review:"later""#)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(mock.call_count(), 2);
        let asked = interp.asked();
        assert_eq!(asked.len(), 1);
        assert_eq!(asked[0].1.last_output, "plan done");
        assert_eq!(asked[0].1.node, Some(NodeId(0)));
    }

    #[tokio::test]
    async fn test_binding_false_path_completes() {
        let (mock, exec) = shared_executor(MockExecutor::new().respond("test", "1 failed"));
        let result = engine(exec)
            .run_source(r#"test:"run" (if passed):ok ~> (if ok)~> code:"deploy""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.vars.get("ok").map(String::as_str), Some("false"));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_skipped_producer_leaves_variable_undefined() {
        let (mock, exec) = shared_executor(MockExecutor::new().fail("plan", "no idea"));
        let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Skip]));
        let result = engine(exec)
            .with_steering(steering.clone())
            .run_source(r#"plan:"p":plan -> code:"follow {plan}""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.skipped, vec![NodeId(0)]);
        assert_eq!(result.failed, vec![NodeId(1)]);
        assert!(!result.vars.contains_key("plan"));
        assert!(result.failures[1].error.contains("variable 'plan'"));
        // The consumer was failed before dispatch.
        assert_eq!(mock.call_count(), 1);
        assert_eq!(steering.pauses().len(), 2);
    }

    #[tokio::test]
    async fn test_unseeded_run_is_rejected() {
        let (mock, exec) = shared_executor(MockExecutor::new());
        let graph = weft_graph::compile_with(
            r#"code:"use {given}""#,
            &Registry::default(),
            NodeId(0),
            &BTreeSet::from(["given".to_string()]),
        )
        .unwrap();
        let err = engine(exec).run(graph).await.unwrap_err();
        assert!(matches!(err, WeftError::Compile(CompileError::Invalid(_))));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_without_steering_fails_run() {
        let (_, exec) = shared_executor(MockExecutor::new().fail("code", "compile error"));
        let result = engine(exec)
            .run_source(r#"code:"fix" -> test:"run""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failed, vec![NodeId(0)]);
        assert_eq!(result.unreached, vec![NodeId(1)]);
        assert_eq!(result.failures[0].error, "node 0 (code) failed: compile error");
    }

    #[tokio::test]
    async fn test_auto_retry() {
        let (mock, exec) = shared_executor(
            MockExecutor::new()
                .fail("code", "flaky")
                .respond("code", "ok"),
        );
        let config = EngineConfig {
            max_auto_retries: 1,
            ..EngineConfig::default()
        };
        let result = engine(exec)
            .with_config(config)
            .run_source(r#"code:"fix""#)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(mock.call_count(), 2);
        assert_eq!(result.failures.len(), 1);
        assert!(result.trace.iter().any(|e| matches!(
            e.event,
            TraceEvent::NodeRetried {
                automatic: true,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let (_, exec) = shared_executor(
            MockExecutor::new().with_delay(Duration::from_millis(1500)),
        );
        let config = EngineConfig {
            node_timeout_secs: Some(1),
            ..EngineConfig::default()
        };
        let result = engine(exec)
            .with_config(config)
            .run_source(r#"explore:"slow""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.failures[0].error.contains("timed out after 1s"));
    }

    #[tokio::test]
    async fn test_retry_loop_until_condition_clears() {
        let (mock, exec) = shared_executor(
            MockExecutor::new()
                .respond("test", "2 tests fail")
                .respond("test", "all green"),
        );
        let steering = Arc::new(ScriptedSteering::new([
            SteeringCommand::Continue,
            SteeringCommand::Continue,
        ]));
        let result = engine(exec)
            .with_steering(steering.clone())
            .run_source(r#"@review -> code:"fix" -> test:"run" (if tests fail)~> @review"#)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(steering.pauses().len(), 2);
        assert_eq!(mock.call_count(), 4);
        assert!(result
            .trace
            .iter()
            .any(|e| matches!(e.event, TraceEvent::BackEdgeTaken { iteration: 1, .. })));
    }

    #[tokio::test]
    async fn test_loop_limit_stops_back_edge() {
        let (mock, exec) = shared_executor(MockExecutor::new().respond("test", "tests fail"));
        let config = EngineConfig {
            max_loop_iterations: 2,
            ..EngineConfig::default()
        };
        let result = engine(exec)
            .with_config(config)
            .run_source(r#"@review -> test:"run" (if tests fail)~> @review"#)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(mock.call_count(), 3);
        assert!(result
            .trace
            .iter()
            .any(|e| matches!(e.event, TraceEvent::LoopLimitReached { limit: 2, .. })));
    }

    #[tokio::test]
    async fn test_checkpoint_without_decision_aborts() {
        let (mock, exec) = shared_executor(MockExecutor::new());
        let steering = Arc::new(ScriptedSteering::new([]));
        let result = engine(exec)
            .with_steering(steering)
            .run_source(r#"explore:"x" -> @approve -> code:"y""#)
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(result.completed, vec![NodeId(0)]);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_command_reprompts() {
        let (_, exec) = shared_executor(MockExecutor::new());
        let steering = Arc::new(ScriptedSteering::new([
            SteeringCommand::Skip,
            SteeringCommand::Continue,
        ]));
        let result = engine(exec)
            .with_steering(steering.clone())
            .run_source(r#"explore:"x" -> @approve -> code:"y""#)
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(steering.pauses().len(), 2);
        assert!(matches!(
            steering.notices().as_slice(),
            [SteeringNotice::Rejected { command, .. }] if command == "skip"
        ));
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_wave() {
        let (_, exec) = shared_executor(
            MockExecutor::new().with_delay(Duration::from_secs(30)),
        );
        let engine = engine(exec);
        let token = engine.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let result = engine.run_source(r#"explore:"x""#).await.unwrap();
        assert_eq!(result.status, RunStatus::Aborted);
        assert_eq!(result.reason.as_deref(), Some("cancelled"));
        assert!(result.completed.is_empty());
    }

    #[tokio::test]
    async fn test_events_published() {
        let (_, exec) = shared_executor(MockExecutor::new());
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let result = engine(exec)
            .with_event_bus(bus)
            .run_source(r#"explore:"x""#)
            .await
            .unwrap();
        let first = events.next().await.unwrap();
        assert_eq!(first.run_id, result.run_id);
        assert_eq!(first.entry.event, TraceEvent::RunStarted);
        let mut seen = 1;
        let mut last = first;
        // The bus is dropped with the engine, so the subscription drains and ends.
        while let Some(event) = events.next().await {
            seen += 1;
            last = event;
        }
        assert!(last.is_finished());
        assert_eq!(seen, result.trace.len());
        assert_eq!(events.missed(), 0);
    }
}
