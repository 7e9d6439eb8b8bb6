//! End-to-end engine tests against the in-memory stores
//!
//! These exercise the full loop: definition loading, transition selection,
//! context projection, task execution, event persistence, snapshots, and
//! recovery.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use capstan_engine::prelude::*;
use capstan_model::{
    Condition, FieldMapping, Node, OnFailure, RetryPolicy, Step, TaskDefinition, TaskRef,
    Transition, WorkflowDefinition,
};

// ============================================
// Fixtures
// ============================================

/// Two-node pipeline: A fetches, B persists; B is terminal.
fn pipeline_definition() -> WorkflowDefinition {
    WorkflowDefinition::new("pipeline", 1, "a")
        .with_nodes(vec![
            Node::new("a", TaskRef::new("fetch", 1))
                .with_input_mapping(vec![FieldMapping::new("input.url", "target")])
                .with_output_mapping(vec![FieldMapping::new("raw", "state.raw_content")]),
            Node::new("b", TaskRef::new("persist", 1))
                .with_input_mapping(vec![FieldMapping::new("state.raw_content", "content")])
                .with_output_mapping(vec![FieldMapping::new("doc_id", "output.doc_id")]),
        ])
        .with_transitions(vec![Transition::new("a", "b")])
}

fn pipeline_loader() -> InMemoryDefinitionLoader {
    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("fetch", 1)
                .with_steps(vec![Step::new(0, "http_get")
                    .with_input_mapping(vec![FieldMapping::new("input.target", "url")])
                    .with_output_mapping(vec![FieldMapping::new("raw", "output.raw")])])
                .with_timeout_ms(5_000),
        )
        .unwrap();
    loader
        .register_task(
            TaskDefinition::new("persist", 1)
                .with_steps(vec![Step::new(0, "store_doc")
                    .with_input_mapping(vec![FieldMapping::new("input.content", "payload")])
                    .with_output_mapping(vec![FieldMapping::new("id", "output.doc_id")])])
                .with_timeout_ms(5_000),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("http_get"));
    loader.register_action(ActionSpec::new("store_doc"));
    loader.register_workflow(pipeline_definition()).unwrap();
    loader
}

fn pipeline_actions() -> ActionRegistry {
    let registry = ActionRegistry::new();
    registry.register("http_get", |_ctx, _input| async move {
        Ok(json!({"raw": "hi"}))
    });
    registry.register("store_doc", |_ctx, input| async move {
        assert_eq!(input.get("payload"), Some(&json!("hi")));
        Ok(json!({"id": "doc-1"}))
    });
    registry
}

struct Harness {
    engine: Engine,
    log: Arc<InMemoryEventLog>,
    snapshots: Arc<InMemorySnapshotStore>,
}

fn harness(loader: InMemoryDefinitionLoader, registry: ActionRegistry) -> Harness {
    harness_with_config(loader, registry, EngineConfig::default())
}

fn harness_with_config(
    loader: InMemoryDefinitionLoader,
    registry: ActionRegistry,
    config: EngineConfig,
) -> Harness {
    let log = Arc::new(InMemoryEventLog::new());
    let snapshots = Arc::new(InMemorySnapshotStore::new());
    let engine = Engine::with_config(
        Arc::new(loader),
        Arc::new(registry),
        log.clone(),
        snapshots.clone(),
        config,
    );
    Harness {
        engine,
        log,
        snapshots,
    }
}

fn replay(def: &WorkflowDefinition, records: &[EventRecord]) -> RunState {
    let mut state = RunState::default();
    for record in records {
        state.apply(&record.event, def).expect("replay should apply");
    }
    state
}

// ============================================
// Happy Path
// ============================================

#[tokio::test]
async fn test_linear_run_completes_with_projected_output() {
    let h = harness(pipeline_loader(), pipeline_actions());

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .expect("should start");

    let output = h.engine.wait(run_id).await.expect("should complete");
    assert_eq!(output, json!({"doc_id": "doc-1"}));

    let view = h.engine.status(run_id).expect("should have status");
    assert_eq!(view.status, RunStatus::Completed);

    let events = h.engine.events(run_id).await.unwrap();
    let kinds: Vec<&str> = events
        .iter()
        .map(|r| match &r.event {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::TaskDispatched { .. } => "task_dispatched",
            RunEvent::TaskCompleted { .. } => "task_completed",
            RunEvent::RunCompleted { .. } => "run_completed",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "run_started",
            "task_dispatched",
            "task_completed",
            "task_dispatched",
            "task_completed",
            "run_completed",
        ]
    );
}

#[tokio::test]
async fn test_sequences_are_strictly_increasing_and_gapless() {
    let h = harness(pipeline_loader(), pipeline_actions());

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .unwrap();
    h.engine.wait(run_id).await.unwrap();

    let events = h.engine.events(run_id).await.unwrap();
    for (i, record) in events.iter().enumerate() {
        assert_eq!(record.sequence_number, i as u64 + 1);
    }
}

#[tokio::test]
async fn test_full_replay_reconstructs_live_state() {
    let h = harness(pipeline_loader(), pipeline_actions());

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .unwrap();
    let output = h.engine.wait(run_id).await.unwrap();

    let events = h.engine.events(run_id).await.unwrap();
    let state = replay(&pipeline_definition(), &events);

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.output, Some(output));
    assert_eq!(state.context.get("state.raw_content"), Some(&json!("hi")));
}

// ============================================
// Failure Propagation
// ============================================

#[tokio::test]
async fn test_failure_at_second_node_references_node_b() {
    let loader = pipeline_loader();
    let registry = ActionRegistry::new();
    registry.register("http_get", |_ctx, _input| async move {
        Ok(json!({"raw": "hi"}))
    });
    registry.register("store_doc", |_ctx, _input| async move {
        Err(ActionError::non_retryable("disk full"))
    });
    let h = harness(loader, registry);

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .unwrap();

    let err = h.engine.wait(run_id).await.unwrap_err();
    let EngineError::RunFailed(error) = err else {
        panic!("expected RunFailed, got {err:?}");
    };
    assert_eq!(error.kind, RunErrorKind::Action);
    assert_eq!(error.node_id.as_deref(), Some("b"));

    // A's output projection landed before B failed.
    let events = h.engine.events(run_id).await.unwrap();
    let state = replay(&pipeline_definition(), &events);
    assert_eq!(state.context.get("state.raw_content"), Some(&json!("hi")));
    assert_eq!(state.status, RunStatus::Failed);
}

#[tokio::test]
async fn test_no_eligible_transition_fails_the_run() {
    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("noop", 1).with_steps(vec![Step::new(0, "noop")]),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("noop"));
    loader
        .register_workflow(
            WorkflowDefinition::new("stuck", 1, "a")
                .with_nodes(vec![
                    Node::new("a", TaskRef::new("noop", 1)),
                    Node::new("b", TaskRef::new("noop", 1)),
                ])
                .with_transitions(vec![Transition::new("a", "b")
                    .with_condition(Condition::parse("state.never == true").unwrap())]),
        )
        .unwrap();
    let registry = ActionRegistry::new();
    registry.register("noop", |_ctx, _input| async move { Ok(json!({})) });
    let h = harness(loader, registry);

    let run_id = h.engine.start("stuck", 1, json!({})).await.unwrap();
    let err = h.engine.wait(run_id).await.unwrap_err();

    let EngineError::RunFailed(error) = err else {
        panic!("expected RunFailed, got {err:?}");
    };
    assert_eq!(error.kind, RunErrorKind::NoEligibleTransition);
    assert_eq!(error.node_id.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_retry_exhaustion_runs_exactly_three_attempts() {
    let calls = Arc::new(AtomicU32::new(0));

    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("flaky", 1)
                .with_steps(vec![Step::new(0, "always_fails").with_on_failure(OnFailure::Retry)])
                .with_retry(RetryPolicy::fixed(Duration::from_millis(1), 3))
                .with_timeout_ms(5_000),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("always_fails"));
    loader
        .register_workflow(
            WorkflowDefinition::new("retrying", 1, "a")
                .with_nodes(vec![Node::new("a", TaskRef::new("flaky", 1))]),
        )
        .unwrap();

    let registry = ActionRegistry::new();
    let counter = calls.clone();
    registry.register("always_fails", move |_ctx, _input| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(ActionError::retryable("still broken"))
        }
    });
    let h = harness(loader, registry);

    let run_id = h.engine.start("retrying", 1, json!({})).await.unwrap();
    let err = h.engine.wait(run_id).await.unwrap_err();

    let EngineError::RunFailed(error) = err else {
        panic!("expected RunFailed, got {err:?}");
    };
    assert_eq!(error.kind, RunErrorKind::RetryExhausted);
    assert_eq!(error.node_id.as_deref(), Some("a"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_task_timeout_fails_the_run() {
    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("slow", 1)
                .with_steps(vec![Step::new(0, "sleep_forever")])
                .with_timeout_ms(100),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("sleep_forever"));
    loader
        .register_workflow(
            WorkflowDefinition::new("sluggish", 1, "a")
                .with_nodes(vec![Node::new("a", TaskRef::new("slow", 1))]),
        )
        .unwrap();

    let registry = ActionRegistry::new();
    registry.register("sleep_forever", |_ctx, _input| async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(json!({}))
    });
    let h = harness_with_config(
        loader,
        registry,
        EngineConfig::new().with_dispatch_grace(Duration::from_millis(100)),
    );

    let run_id = h.engine.start("sluggish", 1, json!({})).await.unwrap();
    let err = h.engine.wait(run_id).await.unwrap_err();

    let EngineError::RunFailed(error) = err else {
        panic!("expected RunFailed, got {err:?}");
    };
    assert_eq!(error.kind, RunErrorKind::Timeout);
    assert_eq!(error.node_id.as_deref(), Some("a"));
}

// ============================================
// Transition Selection
// ============================================

#[tokio::test]
async fn test_higher_priority_transition_wins() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));

    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("mark", 1).with_steps(vec![Step::new(0, "mark")]),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("mark"));
    // Lower priority declared first; selection must not depend on order.
    loader
        .register_workflow(
            WorkflowDefinition::new("routed", 1, "a")
                .with_nodes(vec![
                    Node::new("a", TaskRef::new("mark", 1)),
                    Node::new("low", TaskRef::new("mark", 1)),
                    Node::new("high", TaskRef::new("mark", 1)),
                ])
                .with_transitions(vec![
                    Transition::new("a", "low").with_priority(5),
                    Transition::new("a", "high").with_priority(10),
                ]),
        )
        .unwrap();

    let registry = ActionRegistry::new();
    let visited = seen.clone();
    registry.register("mark", move |ctx, _input| {
        let visited = visited.clone();
        async move {
            visited.lock().push(ctx.node_id.clone());
            Ok(json!({}))
        }
    });
    let h = harness(loader, registry);

    let run_id = h.engine.start("routed", 1, json!({})).await.unwrap();
    h.engine.wait(run_id).await.unwrap();

    assert_eq!(*seen.lock(), vec!["a".to_string(), "high".to_string()]);
}

#[tokio::test]
async fn test_condition_routes_on_projected_state() {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));

    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("measure", 1).with_steps(vec![Step::new(0, "measure")
                .with_input_mapping(vec![FieldMapping::new("input.size", "size")])
                .with_output_mapping(vec![FieldMapping::new("size", "output.size")])]),
        )
        .unwrap();
    loader
        .register_task(
            TaskDefinition::new("mark", 1).with_steps(vec![Step::new(0, "mark")]),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("measure"));
    loader.register_action(ActionSpec::new("mark"));
    loader
        .register_workflow(
            WorkflowDefinition::new("sorter", 1, "a")
                .with_nodes(vec![
                    Node::new("a", TaskRef::new("measure", 1))
                        .with_input_mapping(vec![FieldMapping::new("input.size", "size")])
                        .with_output_mapping(vec![FieldMapping::new("size", "state.size")]),
                    Node::new("big", TaskRef::new("mark", 1)),
                    Node::new("small", TaskRef::new("mark", 1)),
                ])
                .with_transitions(vec![
                    Transition::new("a", "big")
                        .with_priority(10)
                        .with_condition(Condition::parse("state.size > 100").unwrap()),
                    Transition::new("a", "small"),
                ]),
        )
        .unwrap();

    let registry = ActionRegistry::new();
    registry.register("measure", |_ctx, input| async move {
        Ok(json!({"size": input.get("size").cloned().unwrap_or(Value::Null)}))
    });
    let visited = seen.clone();
    registry.register("mark", move |ctx, _input| {
        let visited = visited.clone();
        async move {
            visited.lock().push(ctx.node_id.clone());
            Ok(json!({}))
        }
    });
    let h = harness(loader, registry);

    let run_id = h.engine.start("sorter", 1, json!({"size": 150})).await.unwrap();
    h.engine.wait(run_id).await.unwrap();
    assert_eq!(seen.lock().last().map(String::as_str), Some("big"));

    let run_id = h.engine.start("sorter", 1, json!({"size": 50})).await.unwrap();
    h.engine.wait(run_id).await.unwrap();
    assert_eq!(seen.lock().last().map(String::as_str), Some("small"));
}

// ============================================
// Cancellation
// ============================================

#[tokio::test]
async fn test_cancel_while_task_outstanding() {
    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("slow", 1)
                .with_steps(vec![Step::new(0, "sleep_long")])
                .with_timeout_ms(60_000),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("sleep_long"));
    loader
        .register_workflow(
            WorkflowDefinition::new("cancellable", 1, "a")
                .with_nodes(vec![Node::new("a", TaskRef::new("slow", 1))]),
        )
        .unwrap();

    let registry = ActionRegistry::new();
    registry.register("sleep_long", |_ctx, _input| async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(json!({}))
    });
    let h = harness_with_config(
        loader,
        registry,
        EngineConfig::new().with_dispatch_grace(Duration::from_millis(50)),
    );

    let run_id = h.engine.start("cancellable", 1, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.engine.cancel(run_id, "operator request").await.unwrap();

    let err = h.engine.wait(run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::RunCancelled(reason) if reason == "operator request"));

    let events = h.engine.events(run_id).await.unwrap();
    assert!(matches!(
        events.last().map(|r| &r.event),
        Some(RunEvent::RunCancelled { .. })
    ));
}

#[tokio::test]
async fn test_cancel_after_completion_is_rejected() {
    let h = harness(pipeline_loader(), pipeline_actions());

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .unwrap();
    h.engine.wait(run_id).await.unwrap();

    let err = h.engine.cancel(run_id, "too late").await.unwrap_err();
    assert!(matches!(err, EngineError::RunFinished(_)));
}

// ============================================
// Snapshots and Recovery
// ============================================

#[tokio::test]
async fn test_snapshot_plus_tail_equals_full_replay() {
    let h = harness_with_config(
        pipeline_loader(),
        pipeline_actions(),
        EngineConfig::new().with_snapshot_interval(2),
    );

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .unwrap();
    h.engine.wait(run_id).await.unwrap();

    // Snapshot writes are spawned off the drive loop; give them a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = h
        .snapshots
        .get_latest(run_id)
        .await
        .unwrap()
        .expect("snapshot should exist");
    let events = h.engine.events(run_id).await.unwrap();
    assert!(snapshot.after_sequence_number <= events.len() as u64);

    let def = pipeline_definition();
    let full = replay(&def, &events);

    let mut from_snapshot = snapshot.state.clone();
    for record in &events {
        if record.sequence_number > snapshot.after_sequence_number {
            from_snapshot.apply(&record.event, &def).unwrap();
        }
    }

    assert_eq!(from_snapshot, full);
    assert_eq!(from_snapshot.context, full.context);
}

#[tokio::test]
async fn test_recovery_redispatches_inflight_task_with_same_dispatch_id() {
    let observed = Arc::new(Mutex::new(Vec::<Uuid>::new()));

    let loader = pipeline_loader();
    let registry = ActionRegistry::new();
    let ids = observed.clone();
    registry.register("http_get", move |ctx, _input| {
        let ids = ids.clone();
        async move {
            ids.lock().push(ctx.dispatch_id);
            Ok(json!({"raw": "hi"}))
        }
    });
    registry.register("store_doc", |_ctx, _input| async move {
        Ok(json!({"id": "doc-1"}))
    });
    let h = harness(loader, registry);

    // Seed the log as a crashed coordinator would have left it: started,
    // task dispatched, no completion.
    let run_id = Uuid::now_v7();
    let dispatch_id = Uuid::now_v7();
    h.log
        .append(
            run_id,
            0,
            vec![
                RunEvent::RunStarted {
                    workflow_id: "pipeline".to_string(),
                    workflow_version: 1,
                    input: json!({"url": "http://x"}),
                },
                RunEvent::TaskDispatched {
                    node_id: "a".to_string(),
                    task_id: "fetch".to_string(),
                    task_version: 1,
                    input: json!({"target": "http://x"}),
                    dispatch_id,
                },
            ],
        )
        .await
        .unwrap();

    let status = h.engine.recover(run_id).await.unwrap();
    assert_eq!(status, RunStatus::WaitingTask);

    let output = h.engine.wait(run_id).await.unwrap();
    assert_eq!(output, json!({"doc_id": "doc-1"}));

    // The re-dispatch reused the recorded dispatch identity.
    assert_eq!(*observed.lock(), vec![dispatch_id]);

    let events = h.engine.events(run_id).await.unwrap();
    for (i, record) in events.iter().enumerate() {
        assert_eq!(record.sequence_number, i as u64 + 1);
    }
    assert!(matches!(
        events.last().map(|r| &r.event),
        Some(RunEvent::RunCompleted { .. })
    ));
}

#[tokio::test]
async fn test_recover_completed_run_reports_terminal_status() {
    let h = harness(pipeline_loader(), pipeline_actions());

    let run_id = h
        .engine
        .start("pipeline", 1, json!({"url": "http://x"}))
        .await
        .unwrap();
    let output = h.engine.wait(run_id).await.unwrap();

    // A second engine instance over the same stores, as after a restart.
    let second = Engine::new(
        Arc::new(pipeline_loader()),
        Arc::new(pipeline_actions()),
        h.log.clone(),
        h.snapshots.clone(),
    );

    let status = second.recover(run_id).await.unwrap();
    assert_eq!(status, RunStatus::Completed);
    assert_eq!(second.wait(run_id).await.unwrap(), output);
}

#[tokio::test]
async fn test_recover_live_run_is_rejected() {
    let loader = InMemoryDefinitionLoader::new();
    loader
        .register_task(
            TaskDefinition::new("slow", 1)
                .with_steps(vec![Step::new(0, "sleep_long")])
                .with_timeout_ms(60_000),
        )
        .unwrap();
    loader.register_action(ActionSpec::new("sleep_long"));
    loader
        .register_workflow(
            WorkflowDefinition::new("busy", 1, "a")
                .with_nodes(vec![Node::new("a", TaskRef::new("slow", 1))]),
        )
        .unwrap();
    let registry = ActionRegistry::new();
    registry.register("sleep_long", |_ctx, _input| async move {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(json!({}))
    });
    let h = harness(loader, registry);

    let run_id = h.engine.start("busy", 1, json!({})).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = h.engine.recover(run_id).await.unwrap_err();
    assert!(matches!(err, EngineError::RunActive(_)));

    h.engine.cancel(run_id, "cleanup").await.unwrap();
}
