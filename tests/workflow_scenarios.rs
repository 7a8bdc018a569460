//! End-to-end runs through the public engine API with mocked agents.

use std::sync::Arc;

use weft_core::config::EngineConfig;
use weft_core::steering::{NodeSpec, Pause, SteeringCommand};
use weft_core::{
    CompileError, NodeId, Registry, RunStatus, TraceEvent, ValidationError, WeftError,
};
use weft_engine::{AutoSteering, ChannelSteering, Engine, SteeringMessage};
use weft_test_utils::{shared_executor, MockExecutor, ScriptedSteering, StaticInterpreter};

fn registry() -> Registry {
    Registry::default().with_agents(["weft:fix".to_string()])
}

#[tokio::test]
async fn test_explore_then_fix_passes_variable() {
    let (mock, exec) = shared_executor(
        MockExecutor::new()
            .respond("explore", "FOUND")
            .respond("weft:fix", "DONE"),
    );
    let result = Engine::new(exec, registry())
        .run_source(r#"explore:"scan":r -> fix:"use {r}""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.vars.len(), 1);
    assert_eq!(result.vars.get("r").map(String::as_str), Some("FOUND"));
    assert_eq!(result.completed, vec![NodeId(0), NodeId(1)]);

    let calls = mock.calls();
    assert_eq!(calls[0].agent_ref, "explore");
    assert_eq!(calls[0].instruction, "scan");
    assert_eq!(calls[1].agent_ref, "weft:fix");
    assert_eq!(calls[1].instruction, "use FOUND");
}

#[tokio::test]
async fn test_skipped_branch_does_not_count_as_success() {
    let (mock, exec) = shared_executor(MockExecutor::new().fail("explore", "crashed"));
    let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Skip]));
    let result = Engine::new(exec, registry())
        .with_steering(steering.clone())
        .run_source(r#"[explore:"a" || review:"b"] (all success)~> code:"c""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.skipped, vec![NodeId(0)]);
    assert_eq!(result.completed, vec![NodeId(1)]);
    assert_eq!(result.unreached, vec![NodeId(2)]);
    assert!(mock.calls().iter().all(|c| c.agent_ref != "code"));

    let pauses = steering.pauses();
    assert_eq!(pauses.len(), 1);
    assert!(matches!(&pauses[0], Pause::Failure(p) if p.node == NodeId(0)));
}

#[tokio::test]
async fn test_any_success_edge_fires_when_one_branch_fails() {
    let (mock, exec) = shared_executor(MockExecutor::new().fail("explore", "crashed"));
    let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Skip]));
    let result = Engine::new(exec, registry())
        .with_steering(steering)
        .run_source(r#"[explore:"a" || review:"b"] (any success)~> code:"c""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.skipped, vec![NodeId(0)]);
    assert_eq!(result.completed, vec![NodeId(1), NodeId(2)]);
    assert!(result.unreached.is_empty());
    assert_eq!(mock.called_nodes().last(), Some(&NodeId(2)));
}

#[tokio::test]
async fn test_loop_back_from_checkpoint() {
    let (mock, exec) = shared_executor(MockExecutor::new());
    let config = EngineConfig {
        max_loop_iterations: 1,
        ..EngineConfig::default()
    };
    let result = Engine::new(exec, registry())
        .with_config(config)
        .with_steering(Arc::new(AutoSteering::new()))
        .with_conditions(Arc::new(StaticInterpreter::new().with("again", true)))
        .run_source(r#"@start -> code:"x" -> @review (if again)~> @start"#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(mock.called_nodes(), vec![NodeId(1), NodeId(1)]);
    let taken: Vec<&TraceEvent> = result
        .trace
        .iter()
        .map(|e| &e.event)
        .filter(|e| matches!(e, TraceEvent::BackEdgeTaken { .. }))
        .collect();
    assert_eq!(
        taken,
        vec![&TraceEvent::BackEdgeTaken {
            to: NodeId(0),
            iteration: 1
        }]
    );
    assert!(result.trace.iter().any(|e| e.event
        == TraceEvent::LoopLimitReached {
            to: NodeId(0),
            limit: 1
        }));
}

#[tokio::test]
async fn test_duplicate_output_variable_never_executes() {
    let (mock, exec) = shared_executor(MockExecutor::new());
    let err = Engine::new(exec, registry())
        .run_source(r#"explore:"a":r -> code:"b":r"#)
        .await
        .unwrap_err();
    match err {
        WeftError::Compile(CompileError::Invalid(errors)) => {
            assert_eq!(
                errors,
                vec![ValidationError::DuplicateProducer {
                    name: "r".into(),
                    node: NodeId(1),
                    owner: Some(NodeId(0)),
                }]
            );
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_malformed_workflow_never_executes() {
    let (mock, exec) = shared_executor(MockExecutor::new());
    let err = Engine::new(exec, registry())
        .run_source(r#"[explore:"a" -> review:"b""#)
        .await
        .unwrap_err();
    assert!(matches!(err, WeftError::Compile(CompileError::Parse(_))));
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_unconditional_loop_is_rejected_before_running() {
    let (mock, exec) = shared_executor(MockExecutor::new());
    let err = Engine::new(exec, registry())
        .run_source(r#"@again -> code:"x" -> @again"#)
        .await
        .unwrap_err();
    match err {
        WeftError::Compile(CompileError::Invalid(errors)) => {
            assert!(errors
                .iter()
                .any(|e| matches!(e, ValidationError::IllegalCycle { .. })));
        }
        other => panic!("expected validation failure, got {:?}", other),
    }
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn test_jump_forward_from_checkpoint() {
    let (mock, exec) = shared_executor(MockExecutor::new());
    let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Jump(NodeId(3))]));
    let result = Engine::new(exec, registry())
        .with_steering(steering)
        .run_source(r#"explore:"e" -> @cp -> code:"c" -> test:"t""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(mock.called_nodes(), vec![NodeId(0), NodeId(3)]);
    assert_eq!(result.unreached, vec![NodeId(2)]);
}

#[tokio::test]
async fn test_repeat_reruns_previous_step() {
    let (mock, exec) = shared_executor(
        MockExecutor::new()
            .respond("explore", "first look")
            .respond("explore", "second look"),
    );
    let steering = Arc::new(ScriptedSteering::new([
        SteeringCommand::Repeat,
        SteeringCommand::Continue,
    ]));
    let result = Engine::new(exec, registry())
        .with_steering(steering.clone())
        .run_source(r#"explore:"e":notes -> @cp -> code:"{notes}""#)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(steering.pauses().len(), 2);
    assert_eq!(mock.called_nodes(), vec![NodeId(0), NodeId(0), NodeId(2)]);
    assert_eq!(mock.calls()[2].instruction, "second look");
}

#[tokio::test]
async fn test_edit_at_checkpoint_replaces_remaining_work() {
    let (mock, exec) = shared_executor(MockExecutor::new().respond("explore", "b1"));
    let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Edit(
        r#"review:"check {bugs}""#.to_string(),
    )]));
    let result = Engine::new(exec, registry())
        .with_steering(steering)
        .run_source(r#"explore:"e":bugs -> @cp -> code:"c""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let calls = mock.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].agent_ref, "review");
    assert_eq!(calls[1].instruction, "check b1");
    assert_eq!(calls[1].node, NodeId(3));
    // Checkpoint and explore ran before the edit and still count.
    assert_eq!(result.completed, vec![NodeId(0), NodeId(1), NodeId(3)]);
}

#[tokio::test]
async fn test_fork_replaces_failed_node() {
    let (mock, exec) = shared_executor(MockExecutor::new().fail("code", "stuck"));
    let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Fork(vec![
        NodeSpec::new("explore", "alt 1"),
        NodeSpec::new("test", "alt 2"),
    ])]));
    let result = Engine::new(exec, registry())
        .with_steering(steering)
        .run_source(r#"plan:"p" -> code:"c":patch -> review:"{patch}""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.skipped, vec![NodeId(1)]);
    assert_eq!(result.failures.len(), 1);
    let review = mock
        .calls()
        .into_iter()
        .find(|c| c.agent_ref == "review")
        .unwrap();
    // The first alternative inherits the failed node's output variable.
    assert_eq!(review.instruction, "explore done");
    assert_eq!(review.node, NodeId(2));
}

#[tokio::test]
async fn test_debug_inserts_step_before_retry() {
    let (mock, exec) = shared_executor(
        MockExecutor::new()
            .fail("code", "unclear requirements")
            .respond("code", "fixed"),
    );
    let steering = Arc::new(ScriptedSteering::new([SteeringCommand::Debug(
        NodeSpec::new("explore", "why did it fail?"),
    )]));
    let result = Engine::new(exec, registry())
        .with_steering(steering)
        .run_source(r#"plan:"p" -> code:"c""#)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(
        mock.called_nodes(),
        vec![NodeId(0), NodeId(1), NodeId(2), NodeId(1)]
    );
    assert_eq!(result.outputs.get(&NodeId(1)).map(String::as_str), Some("fixed"));
}

#[tokio::test]
async fn test_channel_steering_from_another_task() {
    let (mock, exec) = shared_executor(MockExecutor::new());
    let (steering, mut rx) = ChannelSteering::new();
    let steering = Arc::new(steering);

    let operator = {
        let steering = steering.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let SteeringMessage::Paused { id, pause } = message {
                    assert!(steering.respond(&id, SteeringCommand::Continue).await);
                    return Some(pause.node());
                }
            }
            None
        })
    };

    let result = Engine::new(exec, registry())
        .with_steering(steering)
        .run_source(r#"explore:"e" -> @approve -> code:"c""#)
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(mock.call_count(), 2);
    assert_eq!(operator.await.unwrap(), Some(NodeId(1)));
}
