//! Integration tests for deeply nested programs
//!
//! The position encoding has to stay injective once constructs nest:
//! branches inside branches, loops inside branches, fan-outs inside
//! switch cases. These tests walk such trees end to end and resume them
//! from mid-nesting snapshots.

use sagaflow_core::{
    CancelToken, ExecutorConfig, FailurePolicy, FlowExecutor, FlowOutcome, FlowPosition,
    FlowStatus, FlowStore, MemoryFlowStore, Message, Program, RecordingMediator, RetryPolicy,
    WaitCoordinator,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn harness(
    program: Program<Value>,
) -> (MemoryFlowStore, Arc<RecordingMediator>, Arc<FlowExecutor<Value>>) {
    let store = MemoryFlowStore::new();
    let mediator = Arc::new(RecordingMediator::new());
    let config = ExecutorConfig::new("node-a")
        .with_claim_timeout(Duration::from_secs(2))
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_retry(RetryPolicy::new(1).with_initial_interval(0.01).with_jitter(false));
    let executor = Arc::new(
        FlowExecutor::new(program, Arc::new(store.clone()), mediator.clone(), config).unwrap(),
    );
    (store, mediator, executor)
}

fn send(name: &'static str) -> impl Fn(&Value) -> Message + Send + Sync + 'static {
    move |_| Message::new(name, json!({}))
}

#[tokio::test]
async fn test_if_nested_inside_if() {
    // [0] if outer:
    //   then: [0] send then-pre
    //         [1] if inner: then [send inner-then] else [send inner-else]
    //         [2] send then-post
    //   else: [0] send outer-else
    let program = Program::<Value>::build("nested-if", |flow| {
        flow.if_(
            |s: &Value| s["outer"].as_bool().unwrap_or(false),
            |then| {
                then.send("then-pre", send("then.pre"))
                    .if_(
                        |s: &Value| s["inner"].as_bool().unwrap_or(false),
                        |inner| inner.send("inner-then", send("inner.then")),
                    )
                    .else_(|inner| inner.send("inner-else", send("inner.else")))
                    .send("then-post", send("then.post"))
            },
        )
        .else_(|els| els.send("outer-else", send("outer.else")))
    })
    .unwrap();
    let (_store, mediator, executor) = harness(program);

    let outcome = executor
        .execute(
            "f-1",
            json!({"outer": true, "inner": false}),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, FlowOutcome::Completed);
    assert_eq!(
        mediator.sent_names().await,
        vec!["then.pre", "inner.else", "then.post"]
    );
}

#[tokio::test]
async fn test_foreach_inside_switch_case() {
    let program = Program::<Value>::build("switch-loop", |flow| {
        flow.switch(
            |s: &Value| s["mode"].as_str().map(String::from),
            |sw| {
                sw.case("bulk", |b| {
                    b.for_each(
                        "bulk-items",
                        |s: &Value| s["items"].as_array().map(|i| i.to_vec()),
                        |fe| {
                            fe.batch_size(2)
                                .policy(FailurePolicy::ContinueOnFailure)
                                .send("bulk-item", |_, item| Message::new("bulk.item", item.clone()))
                        },
                    )
                    .send("bulk-done", send("bulk.done"))
                })
                .default(|b| b.send("single", send("single.item")))
            },
        )
    })
    .unwrap();
    let (store, mediator, executor) = harness(program);

    let outcome = executor
        .execute(
            "f-1",
            json!({"mode": "bulk", "items": [1, 2, 3]}),
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome, FlowOutcome::Completed);
    assert_eq!(
        mediator.sent_names().await,
        vec!["bulk.item", "bulk.item", "bulk.item", "bulk.done"]
    );

    // The loop's progress row was keyed by its nested position and cleared.
    assert!(store.progress("f-1", "0.0.0").await.unwrap().is_none());
}

#[tokio::test]
async fn test_when_all_inside_branch_suspends_with_nested_correlation() {
    let program = Program::<Value>::build("branch-fanout", |flow| {
        flow.send("pre", send("step.pre"))
            .if_(
                |_: &Value| true,
                |then| {
                    then.when_all("fan", Duration::from_secs(30), |w| {
                        w.child(send("child.start"))
                    })
                    .send("joined", send("step.joined"))
                },
            )
            .end_if()
            .send("post", send("step.post"))
    })
    .unwrap();
    let (store, mediator, executor) = harness(program.clone());

    let outcome = executor
        .execute("f-1", json!({}), &CancelToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, FlowOutcome::Suspended);

    // The wait step sits at [1, 0, 0]; the correlation id carries the path.
    let parent = store.get("f-1").await.unwrap().unwrap();
    assert_eq!(parent.position, FlowPosition::from_path(vec![1, 0, 0]));
    let condition = store
        .wait_condition("f-1-step-1.0.0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(condition.step, "1.0.0");

    // Child completes; the parent resumes inside the branch and runs out
    // through the branch exit to the top level.
    let coordinator = WaitCoordinator::new(Arc::clone(&executor));
    let event = sagaflow_core::FlowCompletedEvent {
        flow_id: condition.child_flow_ids[0].clone(),
        parent_flow_id: Some("f-1".to_string()),
        correlation_id: Some("f-1-step-1.0.0".to_string()),
        success: true,
        error: None,
        result: None,
    };
    coordinator
        .handle_child_completed(event, &CancelToken::new())
        .await
        .unwrap();

    let parent = store.get("f-1").await.unwrap().unwrap();
    assert_eq!(parent.status, FlowStatus::Completed);
    assert_eq!(
        mediator.sent_names().await,
        vec!["step.pre", "child.start", "step.joined", "step.post"]
    );
}

#[tokio::test]
async fn test_resume_lands_in_nested_branch_without_reevaluation() {
    let program = Program::<Value>::build("deep-resume", |flow| {
        flow.if_(
            |s: &Value| s["take"].as_bool().unwrap_or(false),
            |then| {
                then.switch(
                    |s: &Value| s["kind"].as_str().map(String::from),
                    |sw| {
                        sw.case("x", |b| {
                            b.send("x-0", send("x.0")).send("x-1", send("x.1"))
                        })
                        .default(|b| b.send("d-0", send("d.0")))
                    },
                )
            },
        )
        .end_if()
    })
    .unwrap();
    let (store, mediator, executor) = harness(program);

    // Seed a snapshot parked between x-0 and x-1, four levels deep, with
    // state that would route to default if anything were re-evaluated.
    let mut parked =
        sagaflow_core::FlowSnapshot::new("f-1", "deep-resume", json!({"take": false, "kind": "y"}))
            .with_position(FlowPosition::from_path(vec![0, 0, 0, 0, 1]));
    parked.status = FlowStatus::Suspended;
    store.create(&parked).await.unwrap();

    let outcome = executor.resume("f-1", &CancelToken::new()).await.unwrap();
    assert_eq!(outcome, FlowOutcome::Completed);

    // Only the remaining step of the stored path ran.
    assert_eq!(mediator.sent_names().await, vec!["x.1"]);
}
