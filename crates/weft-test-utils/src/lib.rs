//! Mocks and fixtures shared by the weft test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use weft_core::error::{Result, WeftError};
use weft_core::steering::{Pause, SteeringCommand, SteeringNotice};
use weft_core::traits::{ConditionInterpreter, Executor, SteeringHandler};
use weft_core::{AgentRequest, ConditionContext, NodeId};

type Reply = std::result::Result<String, String>;

#[derive(Default)]
struct Script {
    by_node: HashMap<NodeId, VecDeque<Reply>>,
    by_agent: HashMap<String, VecDeque<Reply>>,
}

impl Script {
    /// Next scripted reply; the last one repeats once a queue runs dry.
    fn next(&mut self, request: &AgentRequest) -> Option<Reply> {
        let queue = match self.by_node.get_mut(&request.node) {
            Some(q) if !q.is_empty() => q,
            _ => self.by_agent.get_mut(&request.agent_ref)?,
        };
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// Executor with scripted replies per node or per agent.
///
/// Unscripted calls succeed with `"<agent> done"`.
#[derive(Default)]
pub struct MockExecutor {
    script: Mutex<Script>,
    calls: Mutex<Vec<AgentRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, agent: &str, output: &str) -> Self {
        self.push_agent(agent, Ok(output.to_string()))
    }

    pub fn fail(self, agent: &str, message: &str) -> Self {
        self.push_agent(agent, Err(message.to_string()))
    }

    pub fn respond_node(self, node: u64, output: &str) -> Self {
        self.push_node(node, Ok(output.to_string()))
    }

    pub fn fail_node(self, node: u64, message: &str) -> Self {
        self.push_node(node, Err(message.to_string()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn push_agent(self, agent: &str, reply: Reply) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script
                .by_agent
                .entry(agent.to_string())
                .or_default()
                .push_back(reply);
        }
        self
    }

    fn push_node(self, node: u64, reply: Reply) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script
                .by_node
                .entry(NodeId(node))
                .or_default()
                .push_back(reply);
        }
        self
    }

    pub fn calls(&self) -> Vec<AgentRequest> {
        self.calls.lock().unwrap().clone()
    }

    /// Node ids in dispatch order.
    pub fn called_nodes(&self) -> Vec<NodeId> {
        self.calls().iter().map(|r| r.node).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Most calls observed running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl Executor for MockExecutor {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(request.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let reply = self.script.lock().unwrap().next(&request);
            match reply {
                Some(Ok(output)) => Ok(output),
                Some(Err(message)) => Err(WeftError::AgentExecution {
                    agent: request.agent_ref,
                    message,
                }),
                None => Ok(format!("{} done", request.agent_ref)),
            }
        })
    }
}

/// Steering handler that replays a fixed list of commands.
///
/// Returns `None` once the list is exhausted.
#[derive(Default)]
pub struct ScriptedSteering {
    commands: Mutex<VecDeque<SteeringCommand>>,
    pauses: Mutex<Vec<Pause>>,
    notices: Mutex<Vec<SteeringNotice>>,
}

impl ScriptedSteering {
    pub fn new(commands: impl IntoIterator<Item = SteeringCommand>) -> Self {
        Self {
            commands: Mutex::new(commands.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn pauses(&self) -> Vec<Pause> {
        self.pauses.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<SteeringNotice> {
        self.notices.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.commands.lock().unwrap().len()
    }
}

impl SteeringHandler for ScriptedSteering {
    fn decide(&self, pause: Pause) -> BoxFuture<'_, Option<SteeringCommand>> {
        self.pauses.lock().unwrap().push(pause);
        let next = self.commands.lock().unwrap().pop_front();
        Box::pin(async move { next })
    }

    fn notify(&self, notice: SteeringNotice) -> BoxFuture<'_, ()> {
        self.notices.lock().unwrap().push(notice);
        Box::pin(async {})
    }
}

/// Condition interpreter with fixed verdicts per condition text.
///
/// Conditions with a queue of verdicts consume them in order and repeat
/// the last one. Unknown conditions are false.
#[derive(Default)]
pub struct StaticInterpreter {
    verdicts: Mutex<HashMap<String, VecDeque<bool>>>,
    asked: Mutex<Vec<(String, ConditionContext)>>,
}

impl StaticInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, condition: &str, verdict: bool) -> Self {
        self.verdicts
            .lock()
            .unwrap()
            .entry(condition.to_string())
            .or_default()
            .push_back(verdict);
        self
    }

    pub fn asked(&self) -> Vec<(String, ConditionContext)> {
        self.asked.lock().unwrap().clone()
    }
}

impl ConditionInterpreter for StaticInterpreter {
    fn evaluate(&self, condition: String, ctx: ConditionContext) -> BoxFuture<'_, bool> {
        let verdict = {
            let mut verdicts = self.verdicts.lock().unwrap();
            match verdicts.get_mut(&condition) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(false),
                Some(queue) => queue.front().copied().unwrap_or(false),
                None => false,
            }
        };
        self.asked.lock().unwrap().push((condition, ctx));
        Box::pin(async move { verdict })
    }
}

/// Write `content` to a temp `weft.toml` and return the dir and path.
pub fn temp_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weft.toml");
    std::fs::write(&path, content).unwrap();
    (dir, path)
}

/// A shared `MockExecutor` plus the trait object the engine takes.
pub fn shared_executor(mock: MockExecutor) -> (Arc<MockExecutor>, Arc<dyn Executor>) {
    let mock = Arc::new(mock);
    let exec: Arc<dyn Executor> = mock.clone();
    (mock, exec)
}
