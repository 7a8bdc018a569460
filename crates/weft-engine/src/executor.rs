use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use weft_core::error::{Result, WeftError};
use weft_core::traits::Executor;
use weft_core::AgentRequest;

/// Fails any invocation that runs longer than `timeout`.
pub struct TimeoutExecutor {
    inner: Arc<dyn Executor>,
    timeout: Duration,
}

impl TimeoutExecutor {
    pub fn new(inner: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

impl Executor for TimeoutExecutor {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let agent = request.agent_ref.clone();
            match tokio::time::timeout(self.timeout, self.inner.run(request)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(agent = %agent, timeout_secs = self.timeout.as_secs(), "Agent timed out");
                    Err(WeftError::AgentTimeout {
                        agent,
                        timeout_secs: self.timeout.as_secs(),
                    })
                }
            }
        })
    }
}

/// Sends each request to the executor registered for its agent, falling
/// back to a default.
pub struct RoutingExecutor {
    routes: HashMap<String, Arc<dyn Executor>>,
    fallback: Option<Arc<dyn Executor>>,
}

impl RoutingExecutor {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: None,
        }
    }

    pub fn route(mut self, agent_ref: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        self.routes.insert(agent_ref.into(), executor);
        self
    }

    pub fn fallback(mut self, executor: Arc<dyn Executor>) -> Self {
        self.fallback = Some(executor);
        self
    }

    pub fn routes(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl Default for RoutingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for RoutingExecutor {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, Result<String>> {
        let target = self
            .routes
            .get(&request.agent_ref)
            .or(self.fallback.as_ref())
            .cloned();
        Box::pin(async move {
            match target {
                Some(executor) => executor.run(request).await,
                None => Err(WeftError::AgentExecution {
                    agent: request.agent_ref,
                    message: "no executor configured for this agent".into(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::NodeId;
    use weft_test_utils::MockExecutor;

    fn request(agent: &str) -> AgentRequest {
        AgentRequest {
            node: NodeId(0),
            agent_ref: agent.into(),
            instruction: "do it".into(),
            model: None,
            prompt: None,
        }
    }

    #[tokio::test]
    async fn test_timeout_fires() {
        let slow = Arc::new(MockExecutor::new().with_delay(Duration::from_millis(200)));
        let exec = TimeoutExecutor::new(slow, Duration::from_millis(10));
        let err = exec.run(request("explore")).await.unwrap_err();
        assert!(matches!(err, WeftError::AgentTimeout { ref agent, .. } if agent == "explore"));
    }

    #[tokio::test]
    async fn test_timeout_passes_fast_results() {
        let fast = Arc::new(MockExecutor::new().respond("explore", "found it"));
        let exec = TimeoutExecutor::new(fast, Duration::from_secs(5));
        assert_eq!(exec.run(request("explore")).await.unwrap(), "found it");
    }

    #[tokio::test]
    async fn test_routing() {
        let a = Arc::new(MockExecutor::new().respond("weft:lint", "lint ok"));
        let b = Arc::new(MockExecutor::new().respond("code", "patched"));
        let router = RoutingExecutor::new().route("weft:lint", a).fallback(b);
        assert_eq!(router.run(request("weft:lint")).await.unwrap(), "lint ok");
        assert_eq!(router.run(request("code")).await.unwrap(), "patched");
    }

    #[tokio::test]
    async fn test_routing_without_fallback() {
        let router = RoutingExecutor::new();
        let err = router.run(request("code")).await.unwrap_err();
        assert!(matches!(err, WeftError::AgentExecution { .. }));
    }
}
