//! Batch and parallelism mechanics for ForEach steps
//!
//! The executor owns the durable loop (progress rows, snapshot persistence,
//! failure policy); this module owns the in-memory mechanics of one batch:
//! selecting unattempted indices, running item sub-programs with bounded
//! concurrency, and serializing the state hooks through the parent-state
//! mutex.
//!
//! Ordering: items within a batch are unordered under `parallelism > 1`;
//! batches execute strictly in order because the executor persists progress
//! between them.

use crate::cancel::CancelToken;
use crate::mediator::Mediator;
use crate::message::MessageIdGenerator;
use crate::program::{FailurePolicy, ForEachStep, ItemStep};
use crate::state::FlowState;
use futures::stream::{self, StreamExt};
use sagaflow_store::ForEachProgress;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Why an item did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ItemError {
    /// The item's sub-program failed
    Failed(String),
    /// Cancellation was observed mid-item
    Cancelled,
}

/// Result of one item within a batch
#[derive(Debug)]
pub(crate) struct ItemOutcome {
    pub index: usize,
    pub error: Option<ItemError>,
}

/// Pick the next batch of unattempted indices, starting at the cursor
pub(crate) fn select_batch(progress: &ForEachProgress, batch_size: usize) -> Vec<usize> {
    (progress.current_index..progress.total_count)
        .filter(|i| !progress.is_attempted(*i))
        .take(batch_size.max(1))
        .collect()
}

/// Run one item's sub-program against the shared state
async fn run_item<S: FlowState>(
    body: &[ItemStep<S>],
    state: &Arc<Mutex<S>>,
    item: &Value,
    mediator: &Arc<dyn Mediator>,
    ids: &Arc<MessageIdGenerator>,
    ct: &CancelToken,
) -> Result<(), ItemError> {
    for step in body {
        if ct.is_cancelled() {
            return Err(ItemError::Cancelled);
        }

        let dispatch = step.dispatch();
        let message = {
            let guard = state.lock().await;
            if let Some(only_when) = &dispatch.only_when {
                if !only_when(&guard, item) {
                    continue;
                }
            }
            (dispatch.message)(&guard, item)
        };
        let message = ids.stamp(message);

        let failure = match step {
            ItemStep::Send(_) => match mediator.send(message, ct).await {
                Ok(result) if result.success => None,
                Ok(result) => Some(result.error.unwrap_or_else(|| "handler failed".into())),
                Err(e) => Some(e.to_string()),
            },
            ItemStep::Query(_) => match mediator.query(message, ct).await {
                Ok(result) if result.success => None,
                Ok(result) => Some(result.error.unwrap_or_else(|| "handler failed".into())),
                Err(e) => Some(e.to_string()),
            },
            ItemStep::Publish(_) => match mediator.publish(message, ct).await {
                Ok(()) => None,
                Err(e) => Some(e.to_string()),
            },
        };

        if let Some(error) = failure {
            return Err(ItemError::Failed(format!(
                "{}: {}",
                dispatch.name, error
            )));
        }
    }
    Ok(())
}

/// Run one indexed item and its hooks, serialized over the state mutex
async fn run_indexed_item<S: FlowState>(
    step: &ForEachStep<S>,
    items: &[Value],
    index: usize,
    state: &Arc<Mutex<S>>,
    mediator: &Arc<dyn Mediator>,
    ids: &Arc<MessageIdGenerator>,
    ct: &CancelToken,
) -> ItemOutcome {
    let item = &items[index];
    let result = run_item(&step.body, state, item, mediator, ids, ct).await;

    match &result {
        Ok(()) => {
            if let Some(hook) = &step.on_item_success {
                let mut guard = state.lock().await;
                hook(&mut guard, index, item);
            }
        }
        Err(ItemError::Failed(error)) => {
            let mut guard = state.lock().await;
            if let Some(hook) = &step.on_item_fail {
                hook(&mut guard, index, error);
            }
            if step.policy == FailurePolicy::CollectErrors {
                guard.record_item_error(index, error);
            }
        }
        Err(ItemError::Cancelled) => {}
    }

    ItemOutcome {
        index,
        error: result.err(),
    }
}

/// Execute one batch with bounded concurrency and serialized hooks
///
/// Per-item hooks run under the state mutex as each item finishes, so
/// mutations never interleave even under `parallelism > 1`.
///
/// Under `StopOnFirstFailure` no item beyond a failure is dispatched: the
/// batch runs in waves of at most `parallelism` items and stops scheduling
/// once a wave reports a failure. With `parallelism == 1` that is an exact
/// short-circuit at the failing index; with more, wave-mates already in
/// flight still complete.
pub(crate) async fn execute_batch<S: FlowState>(
    step: &ForEachStep<S>,
    items: &[Value],
    batch: &[usize],
    state: &Arc<Mutex<S>>,
    mediator: &Arc<dyn Mediator>,
    ids: &Arc<MessageIdGenerator>,
    ct: &CancelToken,
) -> Vec<ItemOutcome> {
    debug!(step = %step.name, size = batch.len(), "executing foreach batch");
    let parallelism = step.parallelism.max(1);

    if step.policy == FailurePolicy::StopOnFirstFailure {
        let mut outcomes = Vec::with_capacity(batch.len());
        for wave in batch.chunks(parallelism) {
            let wave_outcomes: Vec<ItemOutcome> = stream::iter(wave.iter().copied())
                .map(|index| run_indexed_item(step, items, index, state, mediator, ids, ct))
                .buffer_unordered(parallelism)
                .collect()
                .await;
            let failed = wave_outcomes
                .iter()
                .any(|o| matches!(o.error, Some(ItemError::Failed(_))));
            outcomes.extend(wave_outcomes);
            if failed {
                break;
            }
        }
        return outcomes;
    }

    stream::iter(batch.iter().copied())
        .map(|index| run_indexed_item(step, items, index, state, mediator, ids, ct))
        .buffer_unordered(parallelism)
        .collect()
        .await
}
