//! Scoped compensation contexts
//!
//! A [`FlowContext`] wraps a sequence of handler calls with a LIFO
//! compensation stack. Work executed through the context registers its
//! undo actions as it goes; [`FlowContext::commit`] marks the scope
//! successful, and any exit without a commit - error, early return,
//! cancellation - unwinds the stack in reverse registration order.
//!
//! An exception during one compensation is recorded but never aborts the
//! remaining compensations. Nested scopes are independent: an inner
//! scope's rollback does not touch an outer scope's stack.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_core::{run_flow, CancelToken, Message, MessageIdGenerator, RecordingMediator};
//! use std::sync::Arc;
//! use serde_json::json;
//!
//! # async fn example() -> sagaflow_core::Result<()> {
//! let mediator = Arc::new(RecordingMediator::new());
//! let ids = Arc::new(MessageIdGenerator::new(1));
//! let ct = CancelToken::new();
//!
//! let outcome: sagaflow_core::Result<()> =
//!     run_flow("checkout", mediator.clone(), ids, ct, |ctx| async move {
//!         ctx.execute(Message::new("order.create", json!({}))).await?;
//!         ctx.register_compensation(Message::new("order.cancel", json!({}))).await;
//!
//!         ctx.commit();
//!         Ok(())
//!     })
//!     .await;
//! assert!(outcome.is_ok());
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::mediator::{DispatchResult, Mediator, QueryResult};
use crate::message::{Message, MessageIdGenerator};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Compensation action closure; errors are reported as strings
pub type CompensationAction =
    Arc<dyn Fn(CancelToken) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

enum Compensation {
    Message(Message),
    Action(CompensationAction),
}

/// Per-invocation scope with a LIFO compensation stack
pub struct FlowContext {
    name: String,
    correlation_id: String,
    mediator: Arc<dyn Mediator>,
    ids: Arc<MessageIdGenerator>,
    ct: CancelToken,
    steps: AtomicU32,
    committed: AtomicBool,
    compensations: Mutex<Vec<Compensation>>,
}

impl FlowContext {
    /// Open a scope with a fresh correlation id and an empty stack
    pub fn begin(
        name: impl Into<String>,
        mediator: Arc<dyn Mediator>,
        ids: Arc<MessageIdGenerator>,
        ct: CancelToken,
    ) -> Self {
        Self {
            name: name.into(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
            mediator,
            ids,
            ct,
            steps: AtomicU32::new(0),
            committed: AtomicBool::new(false),
            compensations: Mutex::new(Vec::new()),
        }
    }

    /// Scope name given at `begin`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unique correlation id of this scope
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Number of handler calls executed through this scope
    pub fn step_count(&self) -> u32 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Dispatch a command through the mediator and count the step
    pub async fn execute(&self, message: Message) -> Result<DispatchResult> {
        let stamped = self.ids.stamp(message);
        let result = self.mediator.send(stamped, &self.ct).await?;
        self.steps.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Dispatch a request through the mediator and count the step
    pub async fn query(&self, message: Message) -> Result<QueryResult> {
        let stamped = self.ids.stamp(message);
        let result = self.mediator.query(stamped, &self.ct).await?;
        self.steps.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    /// Push a compensation message onto the stack
    pub async fn register_compensation(&self, message: Message) {
        self.compensations
            .lock()
            .await
            .push(Compensation::Message(message));
    }

    /// Push a compensation action onto the stack
    pub async fn register_compensation_action<F, Fut>(&self, action: F)
    where
        F: Fn(CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        let boxed: CompensationAction = Arc::new(move |ct| Box::pin(action(ct)));
        self.compensations
            .lock()
            .await
            .push(Compensation::Action(boxed));
    }

    /// Mark the scope successful; scope close will not run compensations
    pub fn commit(&self) {
        self.committed.store(true, Ordering::Release);
    }

    /// Whether `commit` was called
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire)
    }

    /// Run all registered compensations in reverse registration order
    ///
    /// Returns the number of compensations that themselves failed. Failures
    /// are logged and recorded but never stop the sweep.
    pub async fn rollback(&self) -> usize {
        let mut stack = {
            let mut guard = self.compensations.lock().await;
            std::mem::take(&mut *guard)
        };

        debug!(scope = %self.name, count = stack.len(), "rolling back flow scope");
        let mut failures = 0;

        while let Some(compensation) = stack.pop() {
            let outcome = match compensation {
                Compensation::Message(message) => {
                    let stamped = self.ids.stamp(message);
                    let name = stamped.name.clone();
                    match self.mediator.send(stamped, &self.ct).await {
                        Ok(result) if result.success => Ok(()),
                        Ok(result) => {
                            Err(result.error.unwrap_or_else(|| format!("'{}' rejected", name)))
                        }
                        Err(e) => Err(e.to_string()),
                    }
                }
                Compensation::Action(action) => action(self.ct.clone()).await,
            };

            if let Err(error) = outcome {
                failures += 1;
                warn!(scope = %self.name, %error, "compensation failed; continuing rollback");
            }
        }
        failures
    }
}

/// Run a closure inside a fresh [`FlowContext`] scope
///
/// Compensations run on every exit path where the scope was not committed:
/// the closure returned an error, or it returned success without calling
/// [`FlowContext::commit`].
pub async fn run_flow<T, F, Fut>(
    name: impl Into<String>,
    mediator: Arc<dyn Mediator>,
    ids: Arc<MessageIdGenerator>,
    ct: CancelToken,
    f: F,
) -> Result<T>
where
    F: FnOnce(Arc<FlowContext>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let ctx = Arc::new(FlowContext::begin(name, mediator, ids, ct));
    let result = f(Arc::clone(&ctx)).await;
    if !ctx.is_committed() {
        ctx.rollback().await;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FlowError;
    use crate::mediator::RecordingMediator;
    use serde_json::json;

    fn harness() -> (Arc<RecordingMediator>, Arc<MessageIdGenerator>, CancelToken) {
        (
            Arc::new(RecordingMediator::new()),
            Arc::new(MessageIdGenerator::new(7)),
            CancelToken::new(),
        )
    }

    #[tokio::test]
    async fn test_committed_scope_skips_compensations() {
        let (mediator, ids, ct) = harness();
        let outcome: Result<()> = run_flow(
            "checkout",
            mediator.clone(),
            ids,
            ct,
            |ctx| async move {
                ctx.execute(Message::new("order.create", json!({}))).await?;
                ctx.register_compensation(Message::new("order.cancel", json!({})))
                    .await;
                ctx.commit();
                Ok(())
            },
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(mediator.sent_names().await, vec!["order.create"]);
    }

    #[tokio::test]
    async fn test_error_exit_runs_compensations_in_reverse_order() {
        let (mediator, ids, ct) = harness();
        let outcome: Result<()> = run_flow(
            "checkout",
            mediator.clone(),
            ids,
            ct,
            |ctx| async move {
                ctx.execute(Message::new("order.create", json!({}))).await?;
                ctx.register_compensation(Message::new("order.cancel", json!({})))
                    .await;
                ctx.execute(Message::new("stock.reserve", json!({}))).await?;
                ctx.register_compensation(Message::new("stock.release", json!({})))
                    .await;
                Err(FlowError::Custom("payment declined".into()))
            },
        )
        .await;

        assert!(outcome.is_err());
        assert_eq!(
            mediator.sent_names().await,
            vec!["order.create", "stock.reserve", "stock.release", "order.cancel"]
        );
    }

    #[tokio::test]
    async fn test_uncommitted_success_still_rolls_back() {
        let (mediator, ids, ct) = harness();
        let outcome: Result<()> = run_flow(
            "checkout",
            mediator.clone(),
            ids,
            ct,
            |ctx| async move {
                ctx.register_compensation(Message::new("undo", json!({}))).await;
                Ok(())
            },
        )
        .await;

        assert!(outcome.is_ok());
        assert_eq!(mediator.sent_names().await, vec!["undo"]);
    }

    #[tokio::test]
    async fn test_failing_compensation_does_not_abort_sweep() {
        let (mediator, ids, ct) = harness();
        mediator.fail_on("stock.release", "stock service down").await;

        let ctx = Arc::new(FlowContext::begin(
            "checkout",
            mediator.clone() as Arc<dyn Mediator>,
            ids,
            ct,
        ));
        ctx.register_compensation(Message::new("order.cancel", json!({})))
            .await;
        ctx.register_compensation(Message::new("stock.release", json!({})))
            .await;

        let failures = ctx.rollback().await;
        assert_eq!(failures, 1);
        assert_eq!(
            mediator.sent_names().await,
            vec!["stock.release", "order.cancel"]
        );
    }

    #[tokio::test]
    async fn test_compensation_actions_run_lifo_with_messages() {
        let (mediator, ids, ct) = harness();
        let order = Arc::new(Mutex::new(Vec::<&'static str>::new()));

        let ctx = Arc::new(FlowContext::begin(
            "mixed",
            mediator.clone() as Arc<dyn Mediator>,
            ids,
            ct,
        ));

        let order_a = Arc::clone(&order);
        ctx.register_compensation_action(move |_| {
            let order = Arc::clone(&order_a);
            async move {
                order.lock().await.push("first-registered");
                Ok(())
            }
        })
        .await;

        let order_b = Arc::clone(&order);
        ctx.register_compensation_action(move |_| {
            let order = Arc::clone(&order_b);
            async move {
                order.lock().await.push("second-registered");
                Ok(())
            }
        })
        .await;

        ctx.rollback().await;
        assert_eq!(
            *order.lock().await,
            vec!["second-registered", "first-registered"]
        );
    }

    #[tokio::test]
    async fn test_nested_scopes_are_independent() {
        let (mediator, ids, ct) = harness();

        let outer = Arc::new(FlowContext::begin(
            "outer",
            mediator.clone() as Arc<dyn Mediator>,
            ids.clone(),
            ct.clone(),
        ));
        outer
            .register_compensation(Message::new("outer.undo", json!({})))
            .await;

        // Inner scope fails and rolls back without touching the outer stack.
        let inner: Result<()> = run_flow(
            "inner",
            mediator.clone(),
            ids,
            ct,
            |ctx| async move {
                ctx.register_compensation(Message::new("inner.undo", json!({})))
                    .await;
                Err(FlowError::Custom("inner failed".into()))
            },
        )
        .await;
        assert!(inner.is_err());
        assert_eq!(mediator.sent_names().await, vec!["inner.undo"]);

        outer.commit();
        assert!(outer.is_committed());
    }

    #[tokio::test]
    async fn test_step_counter_tracks_executions() {
        let (mediator, ids, ct) = harness();
        let ctx = FlowContext::begin("count", mediator as Arc<dyn Mediator>, ids, ct);
        ctx.execute(Message::new("a", json!({}))).await.unwrap();
        ctx.query(Message::new("b", json!({}))).await.unwrap();
        assert_eq!(ctx.step_count(), 2);
    }
}
