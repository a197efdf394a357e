//! Wait coordinator - resumes parents suspended on fan-out
//!
//! The executor's spawn phase writes a durable [`WaitCondition`] and
//! suspends the parent; from then on nothing in memory is waiting. This
//! coordinator is the other half of the handshake: child completion events
//! update the condition, and once its predicate holds the coordinator
//! clears it, transitions the parent, and re-enters the executor.
//!
//! A periodic sweep fails parents whose waits expired. Duplicate and stale
//! events are dropped: a child already present in the condition's results
//! is discarded, and an event whose condition is gone (already satisfied
//! or timed out) is ignored.

use crate::cancel::CancelToken;
use crate::error::{FlowError, Result};
use crate::events::FlowCompletedEvent;
use crate::executor::FlowExecutor;
use crate::message::Message;
use crate::program::Step;
use crate::state::FlowState;
use chrono::{DateTime, Utc};
use sagaflow_store::{ChildResult, FlowPosition, FlowStatus, WaitCondition, WaitKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Coordinates suspended parents with their spawned children
pub struct WaitCoordinator<S: FlowState> {
    executor: Arc<FlowExecutor<S>>,
}

impl<S: FlowState> WaitCoordinator<S> {
    /// Create a coordinator over the executor driving the parent program
    pub fn new(executor: Arc<FlowExecutor<S>>) -> Self {
        Self { executor }
    }

    /// Feed a raw mediator message; non-completion messages are ignored
    pub async fn handle_message(&self, message: &Message, ct: &CancelToken) -> Result<()> {
        match FlowCompletedEvent::from_message(message) {
            Some(event) => self.handle_child_completed(event, ct).await,
            None => Ok(()),
        }
    }

    /// Apply one child completion event to its wait condition
    ///
    /// Satisfying the predicate clears the condition, transitions the
    /// parent, and resumes it through the executor.
    pub async fn handle_child_completed(
        &self,
        event: FlowCompletedEvent,
        ct: &CancelToken,
    ) -> Result<()> {
        let Some(correlation_id) = event.correlation_id.clone() else {
            return Ok(());
        };
        let store = self.executor.store();

        let Some(mut condition) = store.wait_condition(&correlation_id).await? else {
            debug!(%correlation_id, child = %event.flow_id, "no wait condition; dropping event");
            return Ok(());
        };

        let recorded = condition.record_result(ChildResult {
            child_flow_id: event.flow_id.clone(),
            success: event.success,
            error: event.error.clone(),
            result: event.result.clone(),
        });
        if !recorded {
            debug!(%correlation_id, child = %event.flow_id, "duplicate completion; dropped");
            return Ok(());
        }

        if !condition.is_satisfied() {
            store.update_wait_condition(&condition).await?;
            return Ok(());
        }

        self.complete_wait(condition, ct).await
    }

    /// Fail parents whose wait expired before the predicate held
    ///
    /// Returns the number of conditions swept.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>, ct: &CancelToken) -> Result<usize> {
        let store = self.executor.store();
        let expired = store.timed_out_wait_conditions(now).await?;
        let count = expired.len();

        for condition in expired {
            store.clear_wait_condition(&condition.correlation_id).await?;

            let Some(mut parent) = store.get(&condition.flow_id).await? else {
                continue;
            };
            if parent.status != FlowStatus::Suspended
                || parent.position.to_string() != condition.step
            {
                continue;
            }

            parent.mark_failed("WaitTimeout");
            if !store.update(&mut parent).await? {
                warn!(flow_id = %parent.flow_id, "parent moved during timeout sweep");
                continue;
            }
            info!(
                flow_id = %parent.flow_id,
                correlation_id = %condition.correlation_id,
                "wait timed out; parent failed"
            );

            self.dispatch_on_any_fail(&condition, &parent.state, ct).await;
            self.executor.publish_completion(&parent).await;
        }
        Ok(count)
    }

    /// Run the timeout sweep on a timer until the token cancels
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, ct: CancelToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.sweep_timeouts(Utc::now(), &ct).await {
                            warn!(error = %e, "wait timeout sweep failed");
                        }
                    }
                }
            }
        })
    }

    async fn complete_wait(&self, condition: WaitCondition, ct: &CancelToken) -> Result<()> {
        let store = self.executor.store();
        store.clear_wait_condition(&condition.correlation_id).await?;

        let Some(mut parent) = store.get(&condition.flow_id).await? else {
            warn!(flow_id = %condition.flow_id, "wait satisfied for a missing parent");
            return Ok(());
        };
        if parent.status != FlowStatus::Suspended || parent.position.to_string() != condition.step
        {
            debug!(
                flow_id = %parent.flow_id,
                "parent no longer suspended at the waiting step; dropping resolution"
            );
            return Ok(());
        }

        let position: FlowPosition = condition
            .step
            .parse()
            .map_err(|_| FlowError::Custom(format!("malformed wait step '{}'", condition.step)))?;
        let step = self.executor.program().step_at(&position);

        let failed = match condition.kind {
            WaitKind::All => condition.has_failure(),
            WaitKind::Any => condition.first_success().is_none(),
        };

        if failed {
            let error = match condition.kind {
                WaitKind::All => match condition.results.iter().find(|r| !r.success) {
                    Some(first) => format!(
                        "child '{}' failed: {}",
                        first.child_flow_id,
                        first.error.as_deref().unwrap_or("unknown error")
                    ),
                    None => "child failed".to_string(),
                },
                WaitKind::Any => condition.aggregated_error(),
            };

            parent.mark_failed(&error);
            if !store.update(&mut parent).await? {
                warn!(flow_id = %parent.flow_id, "parent CAS failed during wait failure");
                return Ok(());
            }
            warn!(flow_id = %parent.flow_id, %error, "fan-out failed; parent failed");

            self.dispatch_on_any_fail(&condition, &parent.state, ct).await;
            self.executor.publish_completion(&parent).await;
            return Ok(());
        }

        // Success: map the winner's result into state (WhenAny), advance
        // past the wait step, then hand the parent back to the executor.
        if let Some(Step::WhenAny(when_any)) = step {
            if let Some(into) = &when_any.into {
                if let Some(winner) = condition.first_success() {
                    let mut state: S = serde_json::from_value(parent.state.clone())?;
                    let value = winner.result.clone().unwrap_or(serde_json::Value::Null);
                    into(&mut state, &value);
                    parent.state = serde_json::to_value(&state)?;
                }
            }
        }

        parent.status = FlowStatus::Running;
        parent.position = position.advance();
        parent.wake_at = None;
        if !store.update(&mut parent).await? {
            warn!(flow_id = %parent.flow_id, "parent CAS failed during wait resolution");
            return Ok(());
        }
        info!(
            flow_id = %parent.flow_id,
            correlation_id = %condition.correlation_id,
            "wait satisfied; resuming parent"
        );

        if condition.kind == WaitKind::Any && condition.cancel_others {
            let winner = condition.first_success().map(|r| r.child_flow_id.clone());
            for child_id in &condition.child_flow_ids {
                if Some(child_id) == winner.as_ref() {
                    continue;
                }
                let cancel = self.executor.ids().stamp(Message::cancel_flow(child_id));
                if let Err(e) = self.executor.mediator().send(cancel, ct).await {
                    warn!(child = %child_id, error = %e, "failed to dispatch child cancel");
                }
            }
        }

        let outcome = self.executor.resume(&condition.flow_id, ct).await?;
        debug!(flow_id = %condition.flow_id, ?outcome, "parent resumed after wait");
        Ok(())
    }

    async fn dispatch_on_any_fail(
        &self,
        condition: &WaitCondition,
        parent_state: &serde_json::Value,
        ct: &CancelToken,
    ) {
        let position: FlowPosition = match condition.step.parse() {
            Ok(p) => p,
            Err(_) => return,
        };
        let Some(Step::WhenAll(when_all)) = self.executor.program().step_at(&position) else {
            return;
        };
        let Some(factory) = &when_all.on_any_fail else {
            return;
        };

        let state: S = match serde_json::from_value(parent_state.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot deserialize parent state for compensation");
                return;
            }
        };
        let message = self.executor.ids().stamp(factory(&state));
        match self.executor.mediator().send(message, ct).await {
            Ok(result) if result.success => {}
            Ok(result) => warn!(error = ?result.error, "fan-out compensation rejected"),
            Err(e) => warn!(error = %e, "fan-out compensation dispatch failed"),
        }
    }
}
