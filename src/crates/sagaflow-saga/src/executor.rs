//! Saga executor - durable ownership around a linear saga run
//!
//! [`SagaExecutor`] wraps a [`SagaRunner`] sweep in the same lease
//! discipline the DSL executor uses: create-or-claim the snapshot,
//! heartbeat on a timer while the runner works, abort on a lost lease,
//! and persist the outcome through version CAS. Re-entry for a terminal
//! snapshot returns the stored result without re-running anything, and a
//! snapshot owned by another live node yields
//! [`FlowOutcome::NotOwned`] - the caller treats that as success, the
//! other node is handling it.
//!
//! The snapshot position tracks saga progress as `[completed_steps]`, so
//! a claimed, half-finished saga resumes its forward sweep at the stored
//! index; compensations for steps before the resume index are never
//! registered.

use crate::runner::{SagaContext, SagaRunner};
use sagaflow_core::{
    CancelToken, ExecutorConfig, FlowError, FlowOutcome, Mediator, MessageIdGenerator, Result,
};
use sagaflow_store::{
    unix_millis_now, FlowPosition, FlowSnapshot, FlowStatus, FlowStore,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct Lease {
    version: Arc<Mutex<u64>>,
    lost: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

/// Durable executor for linear sagas
pub struct SagaExecutor {
    store: Arc<dyn FlowStore>,
    mediator: Arc<dyn Mediator>,
    ids: Arc<MessageIdGenerator>,
    config: ExecutorConfig,
}

impl SagaExecutor {
    /// Create an executor; fails on invalid lease configuration
    pub fn new(
        store: Arc<dyn FlowStore>,
        mediator: Arc<dyn Mediator>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ids = Arc::new(config.id_generator());
        Ok(Self {
            store,
            mediator,
            ids,
            config,
        })
    }

    /// Execute (or idempotently re-enter) a saga under durable ownership
    pub async fn execute(
        &self,
        flow_id: &str,
        flow_type: &str,
        data: serde_json::Value,
        runner: &SagaRunner,
        ct: &CancelToken,
    ) -> Result<FlowOutcome> {
        let snapshot = FlowSnapshot::new(flow_id, flow_type, data)
            .with_status(FlowStatus::Running)
            .with_owner(&self.config.node_id);

        let snapshot = if self.store.create(&snapshot).await? {
            info!(flow_id, flow_type, "saga created");
            snapshot
        } else {
            let Some(existing) = self.store.get(flow_id).await? else {
                return Err(FlowError::NotFound(flow_id.to_string()));
            };

            match existing.status {
                FlowStatus::Completed => return Ok(FlowOutcome::Completed),
                FlowStatus::Failed => {
                    return Ok(FlowOutcome::Failed(existing.error.unwrap_or_default()))
                }
                FlowStatus::Cancelled => return Ok(FlowOutcome::Cancelled),
                _ => {}
            }

            let now = unix_millis_now();
            if !existing.is_owned_by(&self.config.node_id)
                && existing.has_live_owner(now, self.config.claim_timeout.as_millis() as i64)
            {
                return Ok(FlowOutcome::NotOwned);
            }

            let mut claimed = existing;
            claimed.owner = Some(self.config.node_id.clone());
            claimed.heartbeat_at = now;
            claimed.status = FlowStatus::Running;
            if !self.store.update(&mut claimed).await? {
                return Ok(FlowOutcome::NotOwned);
            }
            claimed
        };

        self.run(snapshot, runner, ct).await
    }

    async fn run(
        &self,
        mut snapshot: FlowSnapshot,
        runner: &SagaRunner,
        ct: &CancelToken,
    ) -> Result<FlowOutcome> {
        let lease = self.start_lease(snapshot.flow_id.clone(), snapshot.version);

        let from = snapshot.position.current_index() as usize;
        let saga_ctx = SagaContext::new(
            Arc::clone(&self.mediator),
            Arc::clone(&self.ids),
            ct.clone(),
        )
        .with_retry(self.config.retry.clone());

        let outcome = runner.run_from(from, saga_ctx).await;

        if lease.lost.load(Ordering::Acquire) {
            warn!(flow_id = %snapshot.flow_id, "lease lost during saga run; aborting without writes");
            return Ok(FlowOutcome::NotOwned);
        }

        snapshot.position = FlowPosition::from_path(vec![outcome.completed_steps as u32]);
        let flow_outcome = if outcome.cancelled {
            snapshot.mark_cancelled();
            FlowOutcome::Cancelled
        } else if outcome.success {
            snapshot.mark_completed();
            FlowOutcome::Completed
        } else {
            let error = outcome.error.clone().unwrap_or_default();
            snapshot.mark_failed(&error);
            FlowOutcome::Failed(error)
        };

        // Persist the result; a CAS miss gets one refresh-and-retry before
        // the run is written off as taken over.
        {
            let mut version = lease.version.lock().await;
            snapshot.version = *version;
            if !self.store.update(&mut snapshot).await? {
                let Some(stored) = self.store.get(&snapshot.flow_id).await? else {
                    return Ok(FlowOutcome::NotOwned);
                };
                if stored.status.is_terminal() {
                    return Ok(match stored.status {
                        FlowStatus::Completed => FlowOutcome::Completed,
                        FlowStatus::Cancelled => FlowOutcome::Cancelled,
                        _ => FlowOutcome::Failed(stored.error.unwrap_or_default()),
                    });
                }
                if !stored.is_owned_by(&self.config.node_id) {
                    return Ok(FlowOutcome::NotOwned);
                }
                snapshot.version = stored.version;
                if !self.store.update(&mut snapshot).await? {
                    return Ok(FlowOutcome::NotOwned);
                }
            }
            *version = snapshot.version;
        }

        info!(
            flow_id = %snapshot.flow_id,
            completed_steps = outcome.completed_steps,
            duration_ms = outcome.duration.as_millis() as u64,
            success = outcome.success,
            "saga finished"
        );
        Ok(flow_outcome)
    }

    fn start_lease(&self, flow_id: String, version: u64) -> Lease {
        let version = Arc::new(Mutex::new(version));
        let lost = Arc::new(AtomicBool::new(false));

        let store = Arc::clone(&self.store);
        let node_id = self.config.node_id.clone();
        let interval = self.config.heartbeat_interval;
        let ticker_version = Arc::clone(&version);
        let ticker_lost = Arc::clone(&lost);

        let ticker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut v = ticker_version.lock().await;
                match store.heartbeat(&flow_id, &node_id, *v).await {
                    Ok(true) => *v += 1,
                    Ok(false) => {
                        warn!(%flow_id, "saga heartbeat rejected; lease lost");
                        ticker_lost.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => warn!(%flow_id, error = %e, "saga heartbeat transport error"),
                }
            }
        });

        Lease {
            version,
            lost,
            ticker,
        }
    }
}
