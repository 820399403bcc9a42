// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Lifecycle-engine behavior against the mock substrate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use quantflow::error::ErrorKind;
use quantflow::{LifecycleEngine, OpCtx, WorkloadState};
use quantflow_testing::{sample_bot_spec, MockSubstrate};

fn engine_over(substrate: &MockSubstrate) -> LifecycleEngine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    LifecycleEngine::new(Arc::new(substrate.clone()))
}

#[tokio::test]
async fn create_then_status_lands_in_creating_or_running() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    let handle = engine.create(&ctx, &spec).await.unwrap();
    assert!(handle.as_str().starts_with("mock-"));
    assert_eq!(engine.advisory_state(&spec.id), Some(WorkloadState::Creating));

    // The substrate command carries the fixed config order with the
    // secure layer last.
    let command = substrate.command_of(&spec.id).unwrap();
    let configs: Vec<&String> = command
        .iter()
        .zip(command.iter().skip(1))
        .filter(|(flag, _)| *flag == "--config")
        .map(|(_, path)| path)
        .collect();
    assert_eq!(configs.len(), 4);
    assert!(configs[3].ends_with("config.secure.json"));

    let status = engine.reconcile(&ctx, &spec.id).await.unwrap();
    assert!(matches!(status.state, WorkloadState::Creating | WorkloadState::Running));
}

#[tokio::test]
async fn first_healthy_observation_moves_creating_to_running() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    substrate.observe_health(&spec.id, true);

    let status = engine.reconcile(&ctx, &spec.id).await.unwrap();
    assert_eq!(status.state, WorkloadState::Running);
    assert_eq!(engine.advisory_state(&spec.id), Some(WorkloadState::Running));
}

#[tokio::test]
async fn health_flaps_move_between_running_and_unhealthy() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    substrate.observe_health(&spec.id, true);
    engine.reconcile(&ctx, &spec.id).await.unwrap();

    substrate.observe_health(&spec.id, false);
    let status = engine.reconcile(&ctx, &spec.id).await.unwrap();
    assert_eq!(status.state, WorkloadState::Unhealthy);

    substrate.observe_health(&spec.id, true);
    let status = engine.reconcile(&ctx, &spec.id).await.unwrap();
    assert_eq!(status.state, WorkloadState::Running);
}

#[tokio::test]
async fn create_failure_never_enters_the_machine() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    substrate.fail_next(ErrorKind::Unreachable("connection refused".into()));
    let err = engine.create(&ctx, &spec).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.operation(), "create");
    assert_eq!(err.workload(), Some(spec.id.to_string().as_str()));
    assert_eq!(engine.advisory_state(&spec.id), None);
}

#[tokio::test]
async fn start_failure_leaves_stopped_with_the_error_recorded() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    engine.stop(&ctx, &spec.id).await.unwrap();

    substrate.fail_next(ErrorKind::Permanent("image vanished".into()));
    let err = engine.start(&ctx, &spec.id).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(engine.advisory_state(&spec.id), Some(WorkloadState::Stopped));
    assert!(engine.advisory_error(&spec.id).unwrap().contains("start failed"));
}

#[tokio::test]
async fn commands_are_gated_by_the_transition_table() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    substrate.observe_health(&spec.id, true);
    engine.reconcile(&ctx, &spec.id).await.unwrap();

    // Start on a running workload is an illegal transition.
    let err = engine.start(&ctx, &spec.id).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));

    // Stop, then start again: legal path through the machine.
    engine.stop(&ctx, &spec.id).await.unwrap();
    engine.start(&ctx, &spec.id).await.unwrap();
    assert_eq!(engine.advisory_state(&spec.id), Some(WorkloadState::Creating));
}

#[tokio::test]
async fn delete_is_idempotent_and_reaches_deleted() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    engine.delete(&ctx, &spec.id).await.unwrap();
    assert!(!substrate.has_object(&spec.id));
    assert_eq!(engine.advisory_state(&spec.id), None);

    // Second delete on the same id still succeeds.
    engine.delete(&ctx, &spec.id).await.unwrap();
}

#[tokio::test]
async fn unrecoverable_faults_reconcile_to_error() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    substrate.observe_fault(&spec.id);
    let status = engine.reconcile(&ctx, &spec.id).await.unwrap();
    assert_eq!(status.state, WorkloadState::Error);
}

#[tokio::test]
async fn substrate_unreachable_leaves_observed_state_unchanged() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    substrate.fail_next(ErrorKind::Unreachable("daemon restarting".into()));
    let err = engine.reconcile(&ctx, &spec.id).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.operation(), "get-status");
    assert_eq!(engine.advisory_state(&spec.id), Some(WorkloadState::Creating));
}

#[tokio::test]
async fn hooks_observe_transitions_and_panics_are_recovered() {
    let substrate = MockSubstrate::new();
    let transitions = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&transitions);
    let engine = LifecycleEngine::new(Arc::new(substrate.clone())).with_hook(Box::new(
        move |_id, _from, to| {
            counter.fetch_add(1, Ordering::SeqCst);
            if matches!(to, WorkloadState::Error) {
                panic!("observer crashed on error state");
            }
        },
    ));
    let ctx = OpCtx::new();
    let spec = sample_bot_spec();

    engine.create(&ctx, &spec).await.unwrap();
    assert_eq!(transitions.load(Ordering::SeqCst), 1);

    substrate.observe_fault(&spec.id);
    let err = engine.reconcile(&ctx, &spec.id).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::HookPanicked(msg) if msg.contains("observer crashed")));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn invalid_specs_are_rejected_before_any_side_effect() {
    let substrate = MockSubstrate::new();
    let engine = engine_over(&substrate);
    let ctx = OpCtx::new();

    let mut spec = sample_bot_spec();
    spec.strategy = "not pascal".into();
    let err = engine.create(&ctx, &spec).await.unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::Validation(_)));
    assert!(!substrate.has_object(&spec.id));
}
