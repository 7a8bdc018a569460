use futures::future::BoxFuture;

use crate::error::Result;
use crate::steering::{Pause, SteeringCommand, SteeringNotice};
use crate::types::{AgentRequest, ConditionContext};

/// Runs one agent invocation and returns its textual output.
///
/// Timeouts, retries inside a single attempt and transport concerns belong to
/// the implementation; the scheduler only sees success or failure.
pub trait Executor: Send + Sync + 'static {
    fn run(&self, request: AgentRequest) -> BoxFuture<'_, Result<String>>;
}

/// Decides literal conditions such as `(if tests pass)`.
pub trait ConditionInterpreter: Send + Sync + 'static {
    fn evaluate(&self, condition: String, ctx: ConditionContext) -> BoxFuture<'_, bool>;
}

/// The operator side of steering.
///
/// The scheduler awaits `decide` while paused. `None` means no decision can
/// be made (channel closed, non-interactive run).
pub trait SteeringHandler: Send + Sync + 'static {
    fn decide(&self, pause: Pause) -> BoxFuture<'_, Option<SteeringCommand>>;

    /// Output views and rejected commands. Default: ignored.
    fn notify(&self, notice: SteeringNotice) -> BoxFuture<'_, ()> {
        let _ = notice;
        Box::pin(async {})
    }
}
