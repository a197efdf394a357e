//! Linear saga runner
//!
//! A [`SagaRunner`] drives an ordered list of forward steps, each
//! optionally paired with a compensating action. The forward sweep stops
//! at the first failure and unwinds the compensations of every previously
//! successful step in reverse registration order. A compensation that
//! itself fails is logged and recorded but never aborts the remaining
//! compensations - the original forward error is preserved as the
//! outcome.
//!
//! [`SagaRunner::run_from`] resumes a saga at step `k`: the first `k`
//! forward steps are skipped entirely and no compensations are registered
//! for them.
//!
//! # Example
//!
//! ```rust
//! use sagaflow_saga::{SagaContext, SagaRunner};
//! use sagaflow_core::{CancelToken, Message, MessageIdGenerator, RecordingMediator};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() {
//! let runner = SagaRunner::new("checkout")
//!     .compensated_step(
//!         "create-order",
//!         |ctx: SagaContext| async move {
//!             ctx.dispatch(Message::new("order.create", json!({}))).await
//!         },
//!         |ctx: SagaContext| async move {
//!             ctx.dispatch(Message::new("order.cancel", json!({}))).await
//!         },
//!     )
//!     .step("confirm", |ctx: SagaContext| async move {
//!         ctx.dispatch(Message::new("order.confirm", json!({}))).await
//!     });
//!
//! let ctx = SagaContext::new(
//!     Arc::new(RecordingMediator::new()),
//!     Arc::new(MessageIdGenerator::new(1)),
//!     CancelToken::new(),
//! );
//! let outcome = runner.run(ctx).await;
//! assert!(outcome.success);
//! assert_eq!(outcome.completed_steps, 2);
//! # }
//! ```

use futures::future::BoxFuture;
use sagaflow_core::{CancelToken, Mediator, Message, MessageIdGenerator, RetryPolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Shared capability handle passed to every saga step
#[derive(Clone)]
pub struct SagaContext {
    mediator: Arc<dyn Mediator>,
    ids: Arc<MessageIdGenerator>,
    ct: CancelToken,
    retry: RetryPolicy,
}

impl SagaContext {
    /// Create a context with the default transient-retry policy
    pub fn new(
        mediator: Arc<dyn Mediator>,
        ids: Arc<MessageIdGenerator>,
        ct: CancelToken,
    ) -> Self {
        Self {
            mediator,
            ids,
            ct,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the transient-retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The cancellation token threaded through this saga
    pub fn cancel_token(&self) -> &CancelToken {
        &self.ct
    }

    /// Dispatch a command; transient transport errors retry with backoff
    ///
    /// A handler rejection or an exhausted retry budget is a step failure.
    pub async fn dispatch(&self, message: Message) -> Result<(), String> {
        let message = self.ids.stamp(message);
        let mut attempt = 0;
        loop {
            match self.mediator.send(message.clone(), &self.ct).await {
                Ok(result) if result.success => return Ok(()),
                Ok(result) => {
                    return Err(result
                        .error
                        .unwrap_or_else(|| format!("'{}' rejected", message.name)))
                }
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    warn!(message = %message.name, error = %e, attempt, "transient dispatch error");
                    let delay = self.retry.calculate_delay(attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

type StepFn =
    Arc<dyn Fn(SagaContext) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

struct SagaStep {
    name: String,
    forward: StepFn,
    compensation: Option<StepFn>,
}

/// Outcome of one saga sweep
///
/// `completed_steps` is the index one past the last forward step that was
/// invoked - for a failure at step *k* (0-indexed) it is *k* + 1, for a
/// clean run it is the step count, and for a cancellation it is the index
/// of the step that never started.
#[derive(Debug, Clone)]
pub struct SagaOutcome {
    /// Whether every forward step succeeded
    pub success: bool,
    /// Index one past the last invoked forward step
    pub completed_steps: usize,
    /// Wall-clock duration of the sweep, compensations included
    pub duration: Duration,
    /// Forward error that stopped the sweep
    pub error: Option<String>,
    /// Whether the sweep stopped on cancellation
    pub cancelled: bool,
}

/// Ordered list of forward/compensation pairs
pub struct SagaRunner {
    name: String,
    steps: Vec<SagaStep>,
}

impl SagaRunner {
    /// Create an empty runner
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Saga name, used in traces
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of forward steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the runner has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a forward step with no compensation
    pub fn step<F, Fut>(mut self, name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            forward: Arc::new(move |ctx| Box::pin(forward(ctx))),
            compensation: None,
        });
        self
    }

    /// Append a forward step paired with a compensating action
    pub fn compensated_step<F, FFut, C, CFut>(
        mut self,
        name: impl Into<String>,
        forward: F,
        compensation: C,
    ) -> Self
    where
        F: Fn(SagaContext) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<(), String>> + Send + 'static,
        C: Fn(SagaContext) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.steps.push(SagaStep {
            name: name.into(),
            forward: Arc::new(move |ctx| Box::pin(forward(ctx))),
            compensation: Some(Arc::new(move |ctx| Box::pin(compensation(ctx)))),
        });
        self
    }

    /// Run every step from the beginning
    pub async fn run(&self, ctx: SagaContext) -> SagaOutcome {
        self.run_from(0, ctx).await
    }

    /// Run from step `from`, skipping earlier steps entirely
    ///
    /// Skipped steps register no compensations: a failure later in the
    /// sweep only unwinds work done by this invocation.
    pub async fn run_from(&self, from: usize, ctx: SagaContext) -> SagaOutcome {
        let start = Instant::now();
        let mut registered: Vec<usize> = Vec::new();

        for (index, step) in self.steps.iter().enumerate().skip(from) {
            if ctx.ct.is_cancelled() {
                debug!(saga = %self.name, step = %step.name, "saga cancelled before step");
                self.compensate(&registered, &ctx).await;
                return SagaOutcome {
                    success: false,
                    completed_steps: index,
                    duration: start.elapsed(),
                    error: None,
                    cancelled: true,
                };
            }

            debug!(saga = %self.name, step = %step.name, index, "running saga step");
            match (step.forward)(ctx.clone()).await {
                Ok(()) => {
                    if step.compensation.is_some() {
                        registered.push(index);
                    }
                }
                Err(error) => {
                    warn!(saga = %self.name, step = %step.name, %error, "saga step failed; compensating");
                    self.compensate(&registered, &ctx).await;
                    return SagaOutcome {
                        success: false,
                        completed_steps: index + 1,
                        duration: start.elapsed(),
                        error: Some(format!("step '{}' failed: {}", step.name, error)),
                        cancelled: false,
                    };
                }
            }
        }

        SagaOutcome {
            success: true,
            completed_steps: self.steps.len(),
            duration: start.elapsed(),
            error: None,
            cancelled: false,
        }
    }

    async fn compensate(&self, registered: &[usize], ctx: &SagaContext) {
        for &index in registered.iter().rev() {
            let step = &self.steps[index];
            let Some(compensation) = &step.compensation else {
                continue;
            };
            if let Err(error) = compensation(ctx.clone()).await {
                warn!(
                    saga = %self.name,
                    step = %step.name,
                    %error,
                    "compensation failed; continuing"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sagaflow_core::RecordingMediator;
    use serde_json::json;

    fn context(mediator: &Arc<RecordingMediator>) -> SagaContext {
        SagaContext::new(
            mediator.clone(),
            Arc::new(MessageIdGenerator::new(1)),
            CancelToken::new(),
        )
        .with_retry(RetryPolicy::new(1).with_initial_interval(0.01).with_jitter(false))
    }

    fn payment_saga() -> SagaRunner {
        SagaRunner::new("order")
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
            })
    }

    #[tokio::test]
    async fn test_clean_run_executes_all_steps() {
        let mediator = Arc::new(RecordingMediator::new());
        let outcome = payment_saga().run(context(&mediator)).await;

        assert!(outcome.success);
        assert_eq!(outcome.completed_steps, 4);
        assert_eq!(
            mediator.sent_names().await,
            vec!["order.create", "stock.reserve", "payment.charge", "order.confirm"]
        );
    }

    #[tokio::test]
    async fn test_payment_failure_unwinds_in_reverse_order() {
        let mediator = Arc::new(RecordingMediator::new());
        mediator.fail_on("payment.charge", "card declined").await;

        let outcome = payment_saga().run(context(&mediator)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.completed_steps, 3);
        assert!(outcome.error.as_deref().unwrap().contains("card declined"));

        assert_eq!(
            mediator.sent_names().await,
            vec![
                "order.create",
                "stock.reserve",
                "payment.charge",
                "stock.release",
                "order.cancel"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_from_skips_earlier_compensations() {
        let mediator = Arc::new(RecordingMediator::new());
        mediator.fail_on("order.confirm", "confirmation refused").await;

        let outcome = payment_saga().run_from(2, context(&mediator)).await;
        assert!(!outcome.success);
        assert_eq!(outcome.completed_steps, 4);

        // Steps 0 and 1 were skipped, so their compensations never run.
        assert_eq!(
            mediator.sent_names().await,
            vec!["payment.charge", "order.confirm"]
        );
    }

    #[tokio::test]
    async fn test_failing_compensation_does_not_stop_the_sweep() {
        let mediator = Arc::new(RecordingMediator::new());
        mediator.fail_on("payment.charge", "card declined").await;
        mediator.fail_on("stock.release", "stock service down").await;

        let outcome = payment_saga().run(context(&mediator)).await;
        assert!(!outcome.success);
        // The original forward error is preserved.
        assert!(outcome.error.as_deref().unwrap().contains("card declined"));

        // order.cancel still ran after stock.release failed.
        let names = mediator.sent_names().await;
        assert!(names.contains(&"stock.release".to_string()));
        assert!(names.contains(&"order.cancel".to_string()));
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_next_step() {
        let mediator = Arc::new(RecordingMediator::new());
        let ctx = SagaContext::new(
            mediator.clone(),
            Arc::new(MessageIdGenerator::new(1)),
            CancelToken::new(),
        );
        ctx.cancel_token().cancel();

        let outcome = payment_saga().run(ctx).await;
        assert!(!outcome.success);
        assert!(outcome.cancelled);
        assert_eq!(outcome.completed_steps, 0);
        assert!(mediator.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_transport_errors_retry() {
        let mediator = Arc::new(RecordingMediator::new());
        mediator.fail_transport("order.create", 1).await;

        let runner = SagaRunner::new("retrying").step("create", |ctx: SagaContext| async move {
            ctx.dispatch(Message::new("order.create", json!({}))).await
        });
        let ctx = context(&mediator).with_retry(
            RetryPolicy::new(2).with_initial_interval(0.01).with_jitter(false),
        );

        let outcome = runner.run(ctx).await;
        assert!(outcome.success);
    }
}
