//! End-to-end demo: an order fulfillment flow over the in-memory store.
//!
//! Run with: cargo run --example order_flow -p sagaflow-core

use sagaflow_core::{
    CancelToken, ExecutorConfig, FailurePolicy, FlowExecutor, FlowState, MemoryFlowStore, Message,
    Program, RecordingMediator,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderState {
    order_id: String,
    total: i64,
    items: Vec<String>,
    shipped: Vec<String>,
    reviewed: bool,
}

impl FlowState for OrderState {}

#[tokio::main]
async fn main() -> sagaflow_core::Result<()> {
    let program = Program::<OrderState>::build("order-fulfillment", |flow| {
        flow.send("create-order", |s| {
            Message::new("order.create", json!({"order_id": s.order_id, "total": s.total}))
        })
        .if_(
            |s: &OrderState| s.total > 500,
            |then| {
                then.send("flag-review", |s| {
                    Message::new("review.flag", json!({"order_id": s.order_id}))
                })
                .on_completed(|s| s.reviewed = true)
            },
        )
        .end_if()
        .for_each(
            "ship-items",
            |s: &OrderState| Some(s.items.iter().map(|i| json!(i)).collect()),
            |fe| {
                fe.batch_size(2)
                    .parallelism(2)
                    .policy(FailurePolicy::ContinueOnFailure)
                    .send("ship", |s, item| {
                        Message::new("item.ship", json!({"order_id": s.order_id, "item": item}))
                    })
                    .on_item_success(|s, _index, item| {
                        if let Some(name) = item.as_str() {
                            s.shipped.push(name.to_string());
                        }
                    })
            },
        )
        .publish("order-shipped", |s| {
            Message::new("order.shipped", json!({"order_id": s.order_id}))
        })
    })?;

    let store = MemoryFlowStore::new();
    let mediator = Arc::new(RecordingMediator::new());
    let executor = FlowExecutor::new(
        program,
        Arc::new(store.clone()),
        mediator.clone(),
        ExecutorConfig::new("demo-node"),
    )?;

    let state = OrderState {
        order_id: "order-42".to_string(),
        total: 750,
        items: vec!["book".into(), "lamp".into(), "mug".into()],
        ..Default::default()
    };

    let outcome = executor
        .execute("order-42", state, &CancelToken::new())
        .await?;
    println!("outcome: {:?}", outcome);

    for message in mediator.sent().await {
        println!("dispatched: {}", message.name);
    }
    for event in mediator.published().await {
        println!("published:  {}", event.name);
    }
    Ok(())
}
