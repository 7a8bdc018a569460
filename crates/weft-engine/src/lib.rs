//! Runtime for compiled weft graphs.
//!
//! [`Engine`] owns scheduling: it resolves conditions, dispatches waves of
//! agent nodes through an [`Executor`](weft_core::traits::Executor) and
//! hands control to a steering handler at checkpoints and failures.

pub mod condition;
pub mod executor;
pub mod run_log;
pub mod scheduler;
pub mod state;
pub mod steering;
pub mod vars;

pub use condition::{evaluate_expression, ExpressionInterpreter};
pub use executor::{RoutingExecutor, TimeoutExecutor};
pub use run_log::RunLogger;
pub use scheduler::Engine;
pub use state::{ExecutionState, NodeFailure, RunPhase, RunResult};
pub use steering::{Applied, AutoSteering, ChannelSteering, SteeringController, SteeringMessage};
pub use vars::VariableStore;
