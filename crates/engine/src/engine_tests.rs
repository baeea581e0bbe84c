//! End-to-end engine tests.
//!
//! Everything runs against `MemoryStore` + `MemoryQueue` with a
//! `ManualClock`, so retry timing is exact and no Postgres is required.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use db::models::{
    NewRun, NewTask, RunStatus, RunTransition, TaskRow, TaskStatus, TaskTransition,
};
use db::{FailPoint, MemoryStore, Store};
use nodes::mock::MockNode;
use nodes::NodeRegistry;
use queue::{MemoryQueue, TaskQueue};

use crate::{
    BroadcastEventSink, Clock, DependencyScheduler, DispatchOutcome, EngineConfig, EngineContext,
    EngineError, EngineEvent, ManualClock, TaskDispatcher, cancel_run, start_run,
    models::{Edge, NodeDefinition, WorkflowDefinition},
    spawn::spawn_task,
};

struct Harness {
    ctx: EngineContext,
    store: Arc<MemoryStore>,
    queue: Arc<MemoryQueue>,
    clock: Arc<ManualClock>,
    scheduler: DependencyScheduler,
    dispatcher: TaskDispatcher,
}

fn harness_with(registry: NodeRegistry, config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let queue = Arc::new(MemoryQueue::new());
    let clock = Arc::new(ManualClock::starting_now());
    let ctx = EngineContext::new(store.clone(), queue.clone(), registry)
        .with_clock(clock.clone())
        .with_config(config);
    Harness {
        scheduler: DependencyScheduler::new(ctx.clone()),
        dispatcher: TaskDispatcher::new(ctx.clone()),
        ctx,
        store,
        queue,
        clock,
    }
}

fn harness(registry: NodeRegistry) -> Harness {
    harness_with(registry, EngineConfig::default())
}

impl Harness {
    async fn install(&self, nodes: Vec<NodeDefinition>, edges: Vec<Edge>) -> Uuid {
        let definition = WorkflowDefinition { nodes, edges }.to_json().unwrap();
        self.store.insert_workflow("test-wf", definition).await.unwrap().id
    }

    /// Dispatch until the queue has nothing claimable right now.
    async fn drain(&self) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.dispatcher.process_next().await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn task(&self, run_id: Uuid, node_id: &str) -> TaskRow {
        self.store
            .list_tasks_for_run(run_id)
            .await
            .unwrap()
            .into_iter()
            .find(|t| t.node_id == node_id)
            .unwrap_or_else(|| panic!("no task for node {node_id}"))
    }

    async fn run_status(&self, run_id: Uuid) -> RunStatus {
        self.store.get_run(run_id).await.unwrap().status
    }
}

fn node(id: &str, node_type: &str) -> NodeDefinition {
    NodeDefinition::new(id, node_type, json!({}))
}

fn register(registry: &mut NodeRegistry, node_type: &str, mock: &Arc<MockNode>) {
    registry.register(node_type, mock.clone());
}

// ============================================================
// Happy paths
// ============================================================

#[tokio::test]
async fn linear_workflow_runs_each_node_once_in_order() {
    let a = Arc::new(MockNode::returning("a", json!({ "step": 1 })));
    let b = Arc::new(MockNode::returning("b", json!({ "step": 2 })));
    let c = Arc::new(MockNode::returning("c", json!({ "step": 3 })));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "a", &a);
    register(&mut registry, "b", &b);
    register(&mut registry, "c", &c);
    let h = harness(registry);

    let wf = h
        .install(
            vec![node("a", "a"), node("b", "b"), node("c", "c")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({ "origin": "api" }), Some("tester".into()))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    // only the root exists before anything is dispatched
    assert_eq!(h.store.list_tasks_for_run(run.id).await.unwrap().len(), 1);

    let outcomes = h.drain().await;
    assert_eq!(outcomes, vec![DispatchOutcome::Succeeded; 3]);

    // each node ran once and received its predecessor's output
    assert_eq!((a.call_count(), b.call_count(), c.call_count()), (1, 1, 1));
    assert_eq!(a.inputs()[0]["origin"], "api");
    assert_eq!(b.inputs()[0]["node"], "a");
    assert_eq!(c.inputs()[0]["step"], 2);

    let finished = h.store.get_run(run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Success);
    assert!(finished.completed_at.is_some());
    assert_eq!(finished.output, Some(json!({ "c": { "node": "c", "step": 3 } })));

    let tasks = h.store.list_tasks_for_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Success));
}

#[tokio::test]
async fn diamond_fan_in_creates_join_once_with_merged_input() {
    let mut registry = NodeRegistry::new();
    let root = Arc::new(MockNode::returning("root", json!({})));
    let left = Arc::new(MockNode::returning("left", json!({ "left": true, "shared": "left" })));
    let right = Arc::new(MockNode::returning("right", json!({ "right": true, "shared": "right" })));
    let join = Arc::new(MockNode::returning("join", json!({})));
    register(&mut registry, "root", &root);
    register(&mut registry, "left", &left);
    register(&mut registry, "right", &right);
    register(&mut registry, "join", &join);
    let h = harness(registry);

    let wf = h
        .install(
            vec![node("a", "root"), node("b", "left"), node("c", "right"), node("d", "join")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.drain().await;

    assert_eq!(h.run_status(run.id).await, RunStatus::Success);
    assert_eq!(join.call_count(), 1);
    let input = &join.inputs()[0];
    assert_eq!(input["left"], true);
    assert_eq!(input["right"], true);
    // later edge wins
    assert_eq!(input["shared"], "right");
    assert_eq!(h.store.list_tasks_for_run(run.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn node_config_is_overlaid_by_task_input() {
    let sink = Arc::new(MockNode::returning("sink", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "sink", &sink);
    let h = harness(registry);

    let wf = h
        .install(
            vec![NodeDefinition::new("only", "sink", json!({ "url": "static", "method": "GET" }))],
            vec![],
        )
        .await;
    start_run(&h.ctx, wf, json!({ "url": "dynamic" }), None).await.unwrap();
    h.drain().await;

    assert_eq!(sink.inputs()[0], json!({ "url": "dynamic", "method": "GET" }));
}

#[tokio::test]
async fn empty_workflow_succeeds_immediately() {
    let h = harness(NodeRegistry::new());
    let wf = h.install(vec![], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
}

#[tokio::test]
async fn echo_log_message_is_recorded_at_its_level() {
    let h = harness(NodeRegistry::with_builtins(reqwest::Client::new()));
    let wf = h
        .install(
            vec![NodeDefinition::new("say", "echo", json!({ "message": "hello", "level": "warn" }))],
            vec![],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.drain().await;

    let task = h.task(run.id, "say").await;
    let logs = h.store.list_logs_for_task(task.id).await.unwrap();
    let levels: Vec<&str> = logs.iter().map(|l| l.level.as_str()).collect();
    assert_eq!(levels, vec!["INFO", "WARN"]);
    assert_eq!(logs[1].message, "[WARN] hello");
}

// ============================================================
// Retry and dead-letter paths
// ============================================================

#[tokio::test]
async fn unreachable_http_node_retries_twice_then_dead_letters() {
    let h = harness(NodeRegistry::with_builtins(reqwest::Client::new()));
    let wf = h
        .install(
            vec![NodeDefinition::new(
                "fetch",
                "http",
                json!({
                    "url": "http://127.0.0.1:1/unreachable",
                    "retryOnNetworkErrors": true,
                    "timeout": 2000
                }),
            )
            .with_max_retries(2)],
            vec![],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    // attempt 1 -> retry in 1s
    let start = h.clock.now();
    match h.dispatcher.process_next().await.unwrap() {
        Some(DispatchOutcome::Retrying { retry_at }) => {
            assert_eq!((retry_at - start).num_milliseconds(), 1_000);
        }
        other => panic!("expected retry, got {other:?}"),
    }
    // not yet matured
    assert!(h.dispatcher.process_next().await.unwrap().is_none());

    // attempt 2 -> retry in 2s
    h.clock.advance(Duration::from_secs(1));
    let now = h.clock.now();
    match h.dispatcher.process_next().await.unwrap() {
        Some(DispatchOutcome::Retrying { retry_at }) => {
            assert_eq!((retry_at - now).num_milliseconds(), 2_000);
        }
        other => panic!("expected retry, got {other:?}"),
    }

    // attempt 3 -> budget spent, dead letter
    h.clock.advance(Duration::from_secs(2));
    assert!(matches!(
        h.dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Failed { .. })
    ));

    let task = h.task(run.id, "fetch").await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(h.store.list_dead_letters_for_run(run.id).await.unwrap().len(), 1);
    assert_eq!(h.run_status(run.id).await, RunStatus::Failed);

    let levels: Vec<String> = h
        .store
        .list_logs_for_task(task.id)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.level)
        .collect();
    assert_eq!(levels, vec!["WARN", "WARN", "ERROR"]);
}

#[tokio::test]
async fn flaky_node_recovers_within_budget() {
    let flaky = Arc::new(MockNode::flaky("flaky", 2, json!({ "ok": true })));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "flaky", &flaky);
    let h = harness(registry);

    let wf = h.install(vec![node("f", "flaky")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    let mut delays = Vec::new();
    loop {
        let now = h.clock.now();
        match h.dispatcher.process_next().await.unwrap() {
            Some(DispatchOutcome::Retrying { retry_at }) => {
                let delay = (retry_at - now).to_std().unwrap();
                delays.push(delay);
                h.clock.advance(delay);
            }
            Some(DispatchOutcome::Succeeded) => break,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
    assert_eq!(flaky.call_count(), 3);
    assert_eq!(h.run_status(run.id).await, RunStatus::Success);
    assert!(h.store.list_dead_letters_for_run(run.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_fail_run_and_block_dependents() {
    let broken = Arc::new(MockNode::failing_retryable("broken", "upstream down"));
    let after = Arc::new(MockNode::returning("after", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "broken", &broken);
    register(&mut registry, "after", &after);
    let h = harness(registry);

    let wf = h
        .install(
            vec![node("x", "broken").with_max_retries(1), node("y", "after")],
            vec![Edge::new("x", "y")],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    h.drain().await;
    h.clock.advance(Duration::from_secs(1));
    h.drain().await;

    assert_eq!(broken.call_count(), 2);
    assert_eq!(after.call_count(), 0);

    let task = h.task(run.id, "x").await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.retry_count <= task.max_retries);
    assert!(task.error.as_deref().unwrap_or_default().contains("retries exhausted"));

    let dead = h.store.list_dead_letters_for_run(run.id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].node_id, "x");
    assert_eq!(dead[0].retry_count, 1);

    assert_eq!(h.run_status(run.id).await, RunStatus::Failed);
    // a scheduling pass never creates the blocked dependent
    h.scheduler.run_once().await;
    assert_eq!(h.store.list_tasks_for_run(run.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn fatal_error_skips_retry() {
    let boom = Arc::new(MockNode::failing_fatal("boom", "something broke irreparably"));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "boom", &boom);
    let h = harness(registry);

    let wf = h.install(vec![node("b", "boom")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    let outcomes = h.drain().await;
    assert_eq!(
        outcomes,
        vec![DispatchOutcome::Failed { error: "something broke irreparably".into() }]
    );
    assert_eq!(boom.call_count(), 1);
    assert_eq!(h.task(run.id, "b").await.retry_count, 0);
    assert_eq!(h.store.list_dead_letters_for_run(run.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn unknown_node_type_fails_without_retry() {
    let h = harness(NodeRegistry::new());
    let wf = h.install(vec![node("m", "email")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    let outcomes = h.drain().await;
    assert!(matches!(&outcomes[..], [DispatchOutcome::Failed { error }] if error.contains("email")));
    assert_eq!(h.run_status(run.id).await, RunStatus::Failed);
    assert_eq!(h.store.list_dead_letters_for_run(run.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn handler_timeout_is_retryable() {
    let slow = Arc::new(MockNode::slow("slow", Duration::from_secs(5), json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "slow", &slow);
    let config = EngineConfig {
        handler_timeout: Duration::from_millis(50),
        ..EngineConfig::default()
    };
    let h = harness_with(registry, config);

    let wf = h.install(vec![node("s", "slow")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    assert!(matches!(
        h.dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Retrying { .. })
    ));
    let task = h.task(run.id, "s").await;
    assert_eq!(task.status, TaskStatus::Retry);
    assert!(task.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn slow_http_request_is_cut_at_the_budget_and_classified_by_the_node() {
    // accepts connections but never answers
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = EngineConfig {
        handler_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let h = harness_with(NodeRegistry::with_builtins(reqwest::Client::new()), config);
    let wf = h
        .install(
            vec![NodeDefinition::new(
                "fetch",
                "http",
                json!({ "url": format!("http://{addr}/"), "timeout": 120_000, "retryOnNetworkErrors": false }),
            )],
            vec![],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    assert!(matches!(
        h.dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Failed { .. })
    ));
    let task = h.task(run.id, "fetch").await;
    assert_eq!(task.retry_count, 0);
    assert!(!task.error.unwrap_or_default().contains("handler timed out"));
    drop(listener);
}

#[tokio::test]
async fn panicking_handler_fails_task_and_keeps_dispatcher_alive() {
    let bad = Arc::new(MockNode::panicking("bad", "kaboom"));
    let good = Arc::new(MockNode::returning("good", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "bad", &bad);
    register(&mut registry, "good", &good);
    let h = harness(registry);

    let wf_bad = h.install(vec![node("p", "bad")], vec![]).await;
    let wf_good = h.install(vec![node("g", "good")], vec![]).await;
    let bad_run = start_run(&h.ctx, wf_bad, json!({}), None).await.unwrap();
    let good_run = start_run(&h.ctx, wf_good, json!({}), None).await.unwrap();

    h.drain().await;

    assert_eq!(h.task(bad_run.id, "p").await.status, TaskStatus::Failed);
    assert_eq!(h.run_status(bad_run.id).await, RunStatus::Failed);
    assert_eq!(h.run_status(good_run.id).await, RunStatus::Success);
}

// ============================================================
// Concurrency and cancel
// ============================================================

#[tokio::test]
async fn concurrent_scheduler_passes_create_one_task() {
    let h = harness(NodeRegistry::new());
    let wf = h
        .install(vec![node("a", "noop"), node("b", "noop")], vec![Edge::new("a", "b")])
        .await;
    let row = h.store.get_workflow(wf).await.unwrap();

    // a RUNNING run whose `a` already succeeded, so `b` is ready
    let run = h
        .store
        .create_run(NewRun {
            workflow_id: wf,
            workflow_version: row.version,
            input: json!({}),
            created_by: None,
        })
        .await
        .unwrap();
    h.store
        .transition_run(run.id, &[RunStatus::Pending], RunTransition::to(RunStatus::Running))
        .await
        .unwrap();
    let a = h
        .store
        .insert_task_if_absent(NewTask {
            run_id: run.id,
            workflow_id: wf,
            node_id: "a".into(),
            input: json!({}),
            max_retries: 3,
        })
        .await
        .unwrap()
        .unwrap();
    h.store.claim_task(a.id).await.unwrap();
    h.store
        .complete_task(a.id, TaskTransition::Succeeded { output: json!({ "a": 1 }) })
        .await
        .unwrap();

    let (s1, s2) = (DependencyScheduler::new(h.ctx.clone()), DependencyScheduler::new(h.ctx.clone()));
    let (r1, r2) = tokio::join!(s1.schedule_ready_tasks(), s2.schedule_ready_tasks());
    assert_eq!(r1.unwrap().1 + r2.unwrap().1, 1);

    let tasks = h.store.list_tasks_for_run(run.id).await.unwrap();
    assert_eq!(tasks.iter().filter(|t| t.node_id == "b").count(), 1);
    assert_eq!(h.queue.ready_len().await, 1);

    // a further pass with nothing new is a no-op
    assert_eq!(h.scheduler.schedule_ready_tasks().await.unwrap().1, 0);
    assert_eq!(h.queue.ready_len().await, 1);
    assert_eq!(h.task(run.id, "b").await.input, json!({ "a": 1 }));
}

#[tokio::test]
async fn concurrent_dispatchers_execute_a_task_once() {
    let slow = Arc::new(MockNode::slow("slow", Duration::from_millis(20), json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "slow", &slow);
    let h = harness(registry);

    let wf = h.install(vec![node("s", "slow")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    // a duplicate reference, as stale recovery might produce
    let task = h.task(run.id, "s").await;
    h.queue.enqueue(task.id).await.unwrap();

    let (d1, d2) = (TaskDispatcher::new(h.ctx.clone()), TaskDispatcher::new(h.ctx.clone()));
    let (o1, o2) = tokio::join!(d1.process_next(), d2.process_next());
    let ran = [o1.unwrap(), o2.unwrap()]
        .into_iter()
        .filter(|o| o.is_some())
        .count();

    assert_eq!(ran, 1);
    assert_eq!(slow.call_count(), 1);
    assert_eq!(h.run_status(run.id).await, RunStatus::Success);
}

#[tokio::test]
async fn cancel_stops_pending_tasks_and_further_scheduling() {
    let work = Arc::new(MockNode::returning("work", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "work", &work);
    let h = harness(registry);

    let wf = h
        .install(
            vec![node("a", "work"), node("b", "work"), node("c", "work"), node("d", "work")],
            vec![Edge::new("a", "d")],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    assert_eq!(h.store.list_tasks_for_run(run.id).await.unwrap().len(), 3);

    let canceled = cancel_run(&h.ctx, run.id).await.unwrap();
    assert_eq!(canceled.status, RunStatus::Canceled);
    assert!(canceled.completed_at.is_some());

    let tasks = h.store.list_tasks_for_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Canceled));

    // queued references are dropped, nothing executes, nothing new appears
    assert!(h.drain().await.is_empty());
    h.scheduler.run_once().await;
    assert_eq!(work.call_count(), 0);
    assert_eq!(h.store.list_tasks_for_run(run.id).await.unwrap().len(), 3);

    // a second cancel is rejected
    assert!(matches!(
        cancel_run(&h.ctx, run.id).await,
        Err(EngineError::RunNotCancelable { .. })
    ));
}

#[tokio::test]
async fn claimed_task_of_canceled_run_is_not_executed() {
    let work = Arc::new(MockNode::returning("work", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "work", &work);
    let h = harness(registry);

    let wf = h.install(vec![node("a", "work")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    let task = h.dispatcher.claim_next().await.unwrap().unwrap();

    // cancel lands between claim and dispatch
    h.store
        .transition_run(run.id, &[RunStatus::Running], RunTransition::to(RunStatus::Canceled))
        .await
        .unwrap();

    assert_eq!(h.dispatcher.dispatch(task).await.unwrap(), DispatchOutcome::Skipped);
    assert_eq!(work.call_count(), 0);
    assert_eq!(h.task(run.id, "a").await.status, TaskStatus::Canceled);
}

#[tokio::test]
async fn spawn_with_stale_run_view_after_cancel_creates_nothing_runnable() {
    let work = Arc::new(MockNode::returning("work", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "work", &work);
    let h = harness(registry);

    let wf = h
        .install(
            vec![node("a", "work"), node("b", "work"), node("c", "work")],
            vec![Edge::new("a", "b"), Edge::new("b", "c")],
        )
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    // a scheduling pass read the run while it was still RUNNING
    let stale_view = h.store.get_run(run.id).await.unwrap();
    let workflow = h.ctx.load_workflow(wf).await.unwrap();
    let ready_before = h.queue.ready_len().await;

    cancel_run(&h.ctx, run.id).await.unwrap();

    let spawned = spawn_task(&h.ctx, &stale_view, workflow.node("b").unwrap(), json!({}))
        .await
        .unwrap();
    assert!(spawned.is_none());
    assert_eq!(h.task(run.id, "b").await.status, TaskStatus::Canceled);
    assert_eq!(h.queue.ready_len().await, ready_before);

    assert!(h.drain().await.is_empty());
    h.scheduler.run_once().await;
    let tasks = h.store.list_tasks_for_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Canceled));
    assert_eq!(work.call_count(), 0);
}

#[tokio::test]
async fn cancel_during_handler_discards_its_result() {
    let slow = Arc::new(MockNode::slow("slow", Duration::from_millis(100), json!({})));
    let after = Arc::new(MockNode::returning("after", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "slow", &slow);
    register(&mut registry, "after", &after);
    let h = harness(registry);

    let wf = h
        .install(vec![node("s", "slow"), node("t", "after")], vec![Edge::new("s", "t")])
        .await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    let (outcome, canceled) = tokio::join!(h.dispatcher.process_next(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_run(&h.ctx, run.id).await
    });

    assert_eq!(outcome.unwrap(), Some(DispatchOutcome::Skipped));
    assert_eq!(canceled.unwrap().status, RunStatus::Canceled);
    assert_eq!(slow.call_count(), 1);

    let task = h.task(run.id, "s").await;
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(task.output.is_none());
    assert!(h.store.list_dead_letters_for_run(run.id).await.unwrap().is_empty());
    assert_eq!(h.store.list_tasks_for_run(run.id).await.unwrap().len(), 1);
    assert_eq!(h.run_status(run.id).await, RunStatus::Canceled);
}

// ============================================================
// Store write failures
// ============================================================

#[tokio::test]
async fn failed_log_write_still_dead_letters_the_task() {
    let boom = Arc::new(MockNode::failing_fatal("boom", "bad input"));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "boom", &boom);
    let h = harness(registry);

    let wf = h.install(vec![node("b", "boom")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.store.fail_next(FailPoint::AppendLog, 1).await;

    assert_eq!(
        h.dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Failed { error: "bad input".into() })
    );
    h.scheduler.run_once().await;

    let task = h.task(run.id, "b").await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(h.store.list_dead_letters_for_run(run.id).await.unwrap().len(), 1);
    assert_eq!(h.run_status(run.id).await, RunStatus::Failed);
}

#[tokio::test]
async fn failed_dead_letter_write_is_completed_on_the_fallback_path() {
    let boom = Arc::new(MockNode::failing_fatal("boom", "bad input"));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "boom", &boom);
    let h = harness(registry);

    let wf = h.install(vec![node("b", "boom")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.store.fail_next(FailPoint::AppendDeadLetter, 1).await;

    assert!(matches!(
        h.dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Failed { .. })
    ));

    let dead = h.store.list_dead_letters_for_run(run.id).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].error, "bad input");
    assert_eq!(h.run_status(run.id).await, RunStatus::Failed);
}

#[tokio::test]
async fn failed_log_write_still_schedules_the_retry() {
    let flaky = Arc::new(MockNode::flaky("flaky", 1, json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "flaky", &flaky);
    let h = harness(registry);

    let wf = h.install(vec![node("f", "flaky")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.store.fail_next(FailPoint::AppendLog, 1).await;

    assert!(matches!(
        h.dispatcher.process_next().await.unwrap(),
        Some(DispatchOutcome::Retrying { .. })
    ));
    assert_eq!(h.queue.delayed_len().await, 1);

    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.dispatcher.process_next().await.unwrap(), Some(DispatchOutcome::Succeeded));
    assert_eq!(h.run_status(run.id).await, RunStatus::Success);
}

// ============================================================
// Run boundaries and housekeeping
// ============================================================

#[tokio::test]
async fn inactive_or_cyclic_workflows_cannot_start() {
    let h = harness(NodeRegistry::new());

    let inactive = h.install(vec![node("a", "x")], vec![]).await;
    h.store.set_workflow_active(inactive, false).await.unwrap();
    assert!(matches!(
        start_run(&h.ctx, inactive, json!({}), None).await,
        Err(EngineError::WorkflowInactive(id)) if id == inactive
    ));

    let cyclic = h
        .install(
            vec![node("a", "x"), node("b", "x")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
        )
        .await;
    assert!(matches!(
        start_run(&h.ctx, cyclic, json!({}), None).await,
        Err(EngineError::CycleDetected)
    ));

    assert!(start_run(&h.ctx, Uuid::new_v4(), json!({}), None)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn matured_retries_are_promoted_by_the_scheduler() {
    let flaky = Arc::new(MockNode::flaky("flaky", 1, json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "flaky", &flaky);
    let h = harness(registry);

    let wf = h.install(vec![node("f", "flaky")], vec![]).await;
    start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.drain().await;
    assert_eq!(h.queue.delayed_len().await, 1);

    assert_eq!(h.scheduler.process_retry_queue().await.unwrap(), 0);
    h.clock.advance(Duration::from_secs(1));
    assert_eq!(h.scheduler.process_retry_queue().await.unwrap(), 1);
    assert_eq!((h.queue.delayed_len().await, h.queue.ready_len().await), (0, 1));

    h.drain().await;
    assert_eq!(flaky.call_count(), 2);
}

#[tokio::test]
async fn stale_pending_tasks_are_requeued() {
    let work = Arc::new(MockNode::returning("work", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "work", &work);
    let h = harness(registry);

    let wf = h.install(vec![node("a", "work")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    // lose the queue reference
    assert!(h.queue.dequeue().await.unwrap().is_some());

    let task = h.task(run.id, "a").await;
    let old = h.clock.now() - chrono::Duration::minutes(10);
    h.store.set_task_updated_at(task.id, old).await.unwrap();

    assert_eq!(h.scheduler.recover_stale_tasks().await.unwrap(), 1);
    h.drain().await;
    assert_eq!(work.call_count(), 1);
    assert_eq!(h.run_status(run.id).await, RunStatus::Success);
}

#[tokio::test]
async fn cleanup_removes_old_runs_but_keeps_dead_letters() {
    let boom = Arc::new(MockNode::failing_fatal("boom", "nope"));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "boom", &boom);
    let h = harness(registry);

    let wf = h.install(vec![node("b", "boom")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.drain().await;
    assert_eq!(h.run_status(run.id).await, RunStatus::Failed);

    // within retention: kept
    assert_eq!(h.scheduler.cleanup_completed_runs().await.unwrap(), 0);

    let long_ago = h.clock.now() - chrono::Duration::hours(25);
    h.store.set_run_completed_at(run.id, long_ago).await.unwrap();
    assert_eq!(h.scheduler.cleanup_completed_runs().await.unwrap(), 1);

    assert!(h.store.get_run(run.id).await.unwrap_err().is_not_found());
    assert!(h.store.list_tasks_for_run(run.id).await.unwrap().is_empty());
    assert_eq!(h.store.list_dead_letters_for_run(run.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn state_changes_are_published() {
    let work = Arc::new(MockNode::returning("work", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "work", &work);
    let mut h = harness(registry);
    let sink = Arc::new(BroadcastEventSink::new(64));
    let mut rx = sink.subscribe();
    h.ctx = h.ctx.clone().with_events(sink.clone());
    h.dispatcher = TaskDispatcher::new(h.ctx.clone());

    let wf = h.install(vec![node("a", "work")], vec![]).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();
    h.drain().await;

    let mut run_statuses = Vec::new();
    let mut task_statuses = Vec::new();
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::RunChanged { run_id, status } if run_id == run.id => run_statuses.push(status),
            EngineEvent::TaskChanged { status, .. } => task_statuses.push(status),
            _ => {}
        }
    }
    assert_eq!(run_statuses, vec![RunStatus::Running, RunStatus::Success]);
    assert_eq!(
        task_statuses,
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Success]
    );
}

#[tokio::test]
async fn successful_runs_have_one_task_per_node() {
    let work = Arc::new(MockNode::returning("work", json!({})));
    let mut registry = NodeRegistry::new();
    register(&mut registry, "work", &work);
    let h = harness(registry);

    let nodes: Vec<NodeDefinition> = ["a", "b", "c", "d", "e"].iter().map(|id| node(id, "work")).collect();
    let edges = vec![
        Edge::new("a", "c"),
        Edge::new("b", "c"),
        Edge::new("c", "d"),
        Edge::new("c", "e"),
        Edge::new("a", "e"),
    ];
    let wf = h.install(nodes, edges).await;
    let run = start_run(&h.ctx, wf, json!({}), None).await.unwrap();

    // interleave scheduler passes with dispatching
    loop {
        h.scheduler.run_once().await;
        if h.drain().await.is_empty() {
            break;
        }
    }

    assert_eq!(h.run_status(run.id).await, RunStatus::Success);
    let tasks = h.store.list_tasks_for_run(run.id).await.unwrap();
    assert_eq!(tasks.len(), 5);
    assert_eq!(work.call_count(), 5);
    let mut node_ids: Vec<&str> = tasks.iter().map(|t| t.node_id.as_str()).collect();
    node_ids.sort();
    node_ids.dedup();
    assert_eq!(node_ids.len(), 5);
    assert!(tasks.iter().all(|t| t.output.as_ref().is_some_and(Value::is_object)));
}
