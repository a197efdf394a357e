//! # sagaflow-saga - Linear Sagas over the Flow Store
//!
//! The simpler of sagaflow's two execution models: an ordered sequence of
//! forward steps, each optionally paired with a compensating action,
//! executed under the same durable-ownership protocol as the DSL engine.
//!
//! - [`SagaRunner`] - the in-memory sweep: forward steps in order,
//!   reverse-order compensation on the first failure, resumable at any
//!   step index.
//! - [`SagaExecutor`] - durable supervision: snapshot create-or-claim,
//!   heartbeat lease, idempotent re-entry, CAS-persisted outcome.
//!
//! ## Example
//!
//! ```rust,no_run
//! use sagaflow_core::{CancelToken, ExecutorConfig, MemoryFlowStore, Message, RecordingMediator};
//! use sagaflow_saga::{SagaContext, SagaExecutor, SagaRunner};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> sagaflow_core::Result<()> {
//!     let runner = SagaRunner::new("checkout")
//!         .compensated_step(
//!             "create-order",
//!             |ctx: SagaContext| async move {
//!                 ctx.dispatch(Message::new("order.create", json!({}))).await
//!             },
//!             |ctx: SagaContext| async move {
//!                 ctx.dispatch(Message::new("order.cancel", json!({}))).await
//!             },
//!         )
//!         .step("confirm", |ctx: SagaContext| async move {
//!             ctx.dispatch(Message::new("order.confirm", json!({}))).await
//!         });
//!
//!     let executor = SagaExecutor::new(
//!         Arc::new(MemoryFlowStore::new()),
//!         Arc::new(RecordingMediator::new()),
//!         ExecutorConfig::new("node-a"),
//!     )?;
//!     let outcome = executor
//!         .execute("order-42", "checkout", json!({}), &runner, &CancelToken::new())
//!         .await?;
//!     println!("saga finished: {:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod executor;
pub mod runner;

pub use executor::SagaExecutor;
pub use runner::{SagaContext, SagaOutcome, SagaRunner};
