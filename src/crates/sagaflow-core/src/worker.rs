//! Worker host - claims abandoned flows and sweeps expired waits
//!
//! A [`FlowWorker`] is the long-running host-side loop of one node: it
//! periodically asks the store for abandoned flows of its program type and
//! drives them, and runs the wait-timeout sweep on the same cadence. One
//! worker per program type per node is the intended shape; the store's
//! claim protocol keeps concurrent workers from double-executing a flow.
//!
//! The worker is deliberately dumb: all correctness lives in the executor
//! and the coordinator. Stopping is cooperative through the cancel token.
//!
//! # Example
//!
//! ```rust,no_run
//! use sagaflow_core::{
//!     CancelToken, ExecutorConfig, FlowExecutor, FlowWorker, MemoryFlowStore, Message, Program,
//!     RecordingMediator, WaitCoordinator,
//! };
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> sagaflow_core::Result<()> {
//! let program = Program::<Value>::build("order-flow", |flow| {
//!     flow.send("create", |_| Message::new("order.create", json!({})))
//! })?;
//! let executor = Arc::new(FlowExecutor::new(
//!     program,
//!     Arc::new(MemoryFlowStore::new()),
//!     Arc::new(RecordingMediator::new()),
//!     ExecutorConfig::new("node-a"),
//! )?);
//! let coordinator = Arc::new(WaitCoordinator::new(Arc::clone(&executor)));
//!
//! let ct = CancelToken::new();
//! let worker = FlowWorker::new(executor)
//!     .with_coordinator(coordinator)
//!     .with_poll_interval(Duration::from_secs(1));
//! let handle = worker.spawn(ct.clone());
//!
//! // ... node runs ...
//! ct.cancel();
//! handle.await.ok();
//! # Ok(())
//! # }
//! ```

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::executor::FlowExecutor;
use crate::state::FlowState;
use crate::wait::WaitCoordinator;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Host-side loop claiming abandoned flows and sweeping expired waits
pub struct FlowWorker<S: FlowState> {
    executor: Arc<FlowExecutor<S>>,
    coordinator: Option<Arc<WaitCoordinator<S>>>,
    poll_interval: Duration,
}

impl<S: FlowState> FlowWorker<S> {
    /// Create a worker over an executor
    pub fn new(executor: Arc<FlowExecutor<S>>) -> Self {
        Self {
            executor,
            coordinator: None,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Also run the wait-timeout sweep each poll
    pub fn with_coordinator(mut self, coordinator: Arc<WaitCoordinator<S>>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// How often to poll for abandoned flows (default 5s)
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// One poll round: drain every claimable flow, then sweep timeouts
    ///
    /// Returns the number of flows driven this round.
    pub async fn poll_once(&self, ct: &CancelToken) -> Result<usize> {
        let mut driven = 0;
        while !ct.is_cancelled() {
            match self.executor.claim_next(ct).await {
                Ok(Some(outcome)) => {
                    driven += 1;
                    debug!(?outcome, "worker drove a claimed flow");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "worker claim round failed");
                    break;
                }
            }
        }

        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = coordinator.sweep_timeouts(Utc::now(), ct).await {
                warn!(error = %e, "worker timeout sweep failed");
            }
        }
        Ok(driven)
    }

    /// Run the poll loop until the token cancels
    pub async fn run(&self, ct: CancelToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ct.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once(&ct).await {
                        warn!(error = %e, "worker poll failed");
                    }
                }
            }
        }
    }

    /// Spawn the poll loop on the runtime
    pub fn spawn(self, ct: CancelToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(ct).await })
    }
}
