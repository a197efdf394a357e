//! Demo: a checkout saga whose payment step fails, triggering the
//! reverse-order compensation sweep.
//!
//! Run with: cargo run --example checkout_saga -p sagaflow-saga

use sagaflow_core::{CancelToken, ExecutorConfig, MemoryFlowStore, Message, RecordingMediator};
use sagaflow_saga::{SagaContext, SagaExecutor, SagaRunner};
use serde_json::json;
use std::sync::Arc;

#[tokio::main]
async fn main() -> sagaflow_core::Result<()> {
    let runner = SagaRunner::new("checkout")
        .compensated_step(
            "create-order",
            |ctx: SagaContext| async move {
                ctx.dispatch(Message::new("order.create", json!({}))).await
            },
            |ctx: SagaContext| async move {
                ctx.dispatch(Message::new("order.cancel", json!({}))).await
            },
        )
        .compensated_step(
            "reserve-stock",
            |ctx: SagaContext| async move {
                ctx.dispatch(Message::new("stock.reserve", json!({}))).await
            },
            |ctx: SagaContext| async move {
                ctx.dispatch(Message::new("stock.release", json!({}))).await
            },
        )
        .step("pay", |ctx: SagaContext| async move {
            ctx.dispatch(Message::new("payment.charge", json!({}))).await
        })
        .step("confirm", |ctx: SagaContext| async move {
            ctx.dispatch(Message::new("order.confirm", json!({}))).await
        });

    let store = MemoryFlowStore::new();
    let mediator = Arc::new(RecordingMediator::new());
    mediator.fail_on("payment.charge", "card declined").await;

    let executor = SagaExecutor::new(
        Arc::new(store.clone()),
        mediator.clone(),
        ExecutorConfig::new("demo-node"),
    )?;

    let outcome = executor
        .execute("checkout-1", "checkout", json!({}), &runner, &CancelToken::new())
        .await?;
    println!("outcome: {:?}", outcome);

    // The trace shows the forward sweep stopping at the payment and the
    // compensations unwinding in reverse order.
    for message in mediator.sent().await {
        println!("dispatched: {}", message.name);
    }
    Ok(())
}
