//! The flow executor - interprets program trees under a durable lease
//!
//! [`FlowExecutor`] drives one program tree against the flow store. Each
//! entry point first checks for a terminal snapshot and returns the stored
//! result (re-entry is always idempotent), then acquires ownership -
//! create-if-absent for new flows, CAS-claim for abandoned ones - and
//! interprets the program from the stored position.
//!
//! # Interpretation loop
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  loop {                                                  │
//! │    1. cancellation / lease checks                        │
//! │    2. resolve step := program_at(position)               │
//! │       • past branch end → exit branch / complete flow    │
//! │    3. dispatch by kind                                   │
//! │       • Send/Query/Publish → mediator, advance           │
//! │       • If/Switch         → enter encoded branch         │
//! │       • ForEach           → durable batch loop           │
//! │       • WhenAll/WhenAny   → spawn children, suspend      │
//! │       • Delay             → persist wakeup, suspend      │
//! │    4. persist snapshot (CAS) at every boundary           │
//! │  }                                                       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lease discipline
//!
//! A heartbeat ticker shares the snapshot version with the main loop
//! through a mutex; both the ticker and every persist CAS on that version
//! and bump it on success. A failed heartbeat or a CAS miss on a
//! non-terminal row means the lease is lost: the run aborts with
//! [`FlowOutcome::NotOwned`] and writes nothing further. Because every
//! mutation is version-CAS'd, late writes from a former owner are
//! rejected by the store.
//!
//! # Resume determinism
//!
//! Branch predicates are evaluated exactly once, when the branch is
//! entered; the taken slot is encoded into the position. Resume reads the
//! slot back from the position and re-enters the branch directly, so a
//! resumed flow is a function of the snapshot and the program only.

use crate::cancel::CancelToken;
use crate::error::{FlowError, Result};
use crate::events::FlowCompletedEvent;
use crate::foreach::{execute_batch, select_batch, ItemError};
use crate::mediator::{Mediator, QueryResult};
use crate::message::{FlowRouting, Message, MessageIdGenerator};
use crate::program::{
    DelaySpec, DispatchStep, FailurePolicy, ForEachStep, IfStep, Program, PublishStep, Step,
    SwitchStep, WhenAllStep, WhenAnyStep,
};
use crate::retry::RetryPolicy;
use crate::state::FlowState;
use chrono::Utc;
use sagaflow_store::{
    unix_millis_now, FlowSnapshot, FlowStatus, FlowStore, StoreError, WaitCondition, WaitKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Node-level executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Identity of this node in owner/heartbeat fields
    pub node_id: String,
    /// Staleness threshold after which another node may claim a flow
    pub claim_timeout: Duration,
    /// Heartbeat period; must stay under a third of the claim timeout
    pub heartbeat_interval: Duration,
    /// Backoff for transient store/mediator failures
    pub retry: RetryPolicy,
}

impl ExecutorConfig {
    /// Create a configuration with production-shaped defaults
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            claim_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    /// Set the claim timeout
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = claim_timeout;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Set the retry policy for transient failures
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Check the lease invariant: the heartbeat period must stay under a
    /// third of the claim timeout
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.as_millis() * 3 >= self.claim_timeout.as_millis() {
            return Err(FlowError::Configuration(format!(
                "heartbeat_interval ({:?}) must be under a third of claim_timeout ({:?})",
                self.heartbeat_interval, self.claim_timeout
            )));
        }
        Ok(())
    }

    /// Build a message-id generator whose node bits derive from `node_id`
    pub fn id_generator(&self) -> MessageIdGenerator {
        MessageIdGenerator::new(self.message_node_bits())
    }

    fn message_node_bits(&self) -> u16 {
        self.node_id
            .bytes()
            .fold(0u16, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u16))
            & 0x3ff
    }
}

/// Business-level outcome of one executor entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    /// The flow reached Completed
    Completed,
    /// The flow reached Failed with this error
    Failed(String),
    /// The flow reached Cancelled
    Cancelled,
    /// The flow parked on a wait condition or delay
    Suspended,
    /// Another node owns the flow (or took it mid-run); treat as success
    NotOwned,
}

/// Ownership lease held while driving one flow
///
/// The heartbeat ticker and the persist path share `version` so their CAS
/// bumps never race each other.
struct Lease {
    version: Arc<Mutex<u64>>,
    lost: Arc<AtomicBool>,
    ticker: JoinHandle<()>,
}

impl Lease {
    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.ticker.abort();
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

enum PersistOutcome {
    Saved,
    Terminal(FlowSnapshot),
    LeaseLost,
}

/// Executor for one program tree
pub struct FlowExecutor<S: FlowState> {
    program: Program<S>,
    store: Arc<dyn FlowStore>,
    mediator: Arc<dyn Mediator>,
    ids: Arc<MessageIdGenerator>,
    config: ExecutorConfig,
}

impl<S: FlowState> FlowExecutor<S> {
    /// Create an executor; fails on invalid lease configuration
    pub fn new(
        program: Program<S>,
        store: Arc<dyn FlowStore>,
        mediator: Arc<dyn Mediator>,
        config: ExecutorConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ids = Arc::new(config.id_generator());
        Ok(Self {
            program,
            store,
            mediator,
            ids,
            config,
        })
    }

    /// The program this executor interprets
    pub fn program(&self) -> &Program<S> {
        &self.program
    }

    pub(crate) fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub(crate) fn mediator(&self) -> &Arc<dyn Mediator> {
        &self.mediator
    }

    pub(crate) fn ids(&self) -> &Arc<MessageIdGenerator> {
        &self.ids
    }

    pub(crate) fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start (or idempotently re-enter) a flow
    pub async fn execute(
        &self,
        flow_id: &str,
        initial_state: S,
        ct: &CancelToken,
    ) -> Result<FlowOutcome> {
        self.execute_inner(flow_id, initial_state, None, ct).await
    }

    /// Start a child flow spawned into a parent's wait condition
    ///
    /// On terminal transition the child publishes a completion event
    /// carrying the parent linkage.
    pub async fn execute_spawned(
        &self,
        flow_id: &str,
        initial_state: S,
        parent_flow_id: &str,
        correlation_id: &str,
        ct: &CancelToken,
    ) -> Result<FlowOutcome> {
        self.execute_inner(
            flow_id,
            initial_state,
            Some((parent_flow_id.to_string(), correlation_id.to_string())),
            ct,
        )
        .await
    }

    async fn execute_inner(
        &self,
        flow_id: &str,
        initial_state: S,
        parent: Option<(String, String)>,
        ct: &CancelToken,
    ) -> Result<FlowOutcome> {
        let state_value = serde_json::to_value(&initial_state)?;
        let mut snapshot = FlowSnapshot::new(flow_id, self.program.flow_type(), state_value)
            .with_status(FlowStatus::Running)
            .with_owner(&self.config.node_id);
        if let Some((parent_flow_id, correlation_id)) = parent {
            snapshot = snapshot.with_parent(parent_flow_id, correlation_id);
        }

        if self.store.create(&snapshot).await? {
            info!(flow_id, flow_type = %self.program.flow_type(), "flow created");
            return self.run(snapshot, ct).await;
        }
        // Lost the create race or re-entering an existing flow.
        self.resume(flow_id, ct).await
    }

    /// Re-enter an existing flow: terminal snapshots short-circuit, owned
    /// snapshots yield `NotOwned`, abandoned ones are claimed and driven
    pub async fn resume(&self, flow_id: &str, ct: &CancelToken) -> Result<FlowOutcome> {
        let Some(snapshot) = self.store.get(flow_id).await? else {
            return Err(FlowError::NotFound(flow_id.to_string()));
        };

        if let Some(outcome) = Self::terminal_outcome(&snapshot) {
            return Ok(outcome);
        }

        if let Some(wake_at) = snapshot.wake_at {
            if Utc::now() < wake_at {
                return Ok(FlowOutcome::Suspended);
            }
        }

        let now = unix_millis_now();
        if !snapshot.is_owned_by(&self.config.node_id)
            && snapshot.has_live_owner(now, self.config.claim_timeout.as_millis() as i64)
        {
            return Ok(FlowOutcome::NotOwned);
        }

        // Claim by id: install ownership through CAS. Losing the race means
        // another node is handling it.
        let mut claimed = snapshot;
        claimed.owner = Some(self.config.node_id.clone());
        claimed.heartbeat_at = now;
        if !claimed.status.is_terminal() {
            claimed.status = FlowStatus::Running;
        }
        if !self.store.update(&mut claimed).await? {
            return Ok(FlowOutcome::NotOwned);
        }

        self.run(claimed, ct).await
    }

    /// Claim one abandoned flow of this program's type and drive it
    ///
    /// Returns `None` when nothing qualifies. Intended for worker scavenger
    /// loops picking up flows whose owner died.
    pub async fn claim_next(&self, ct: &CancelToken) -> Result<Option<FlowOutcome>> {
        let claimed = self
            .store
            .try_claim(
                self.program.flow_type(),
                &self.config.node_id,
                self.config.claim_timeout,
            )
            .await?;

        match claimed {
            Some(snapshot) => {
                info!(flow_id = %snapshot.flow_id, "claimed abandoned flow");
                Ok(Some(self.run(snapshot, ct).await?))
            }
            None => Ok(None),
        }
    }

    fn terminal_outcome(snapshot: &FlowSnapshot) -> Option<FlowOutcome> {
        match snapshot.status {
            FlowStatus::Completed => Some(FlowOutcome::Completed),
            FlowStatus::Failed => Some(FlowOutcome::Failed(
                snapshot.error.clone().unwrap_or_default(),
            )),
            FlowStatus::Cancelled => Some(FlowOutcome::Cancelled),
            _ => None,
        }
    }

    // --- lease ----------------------------------------------------------

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
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                let mut v = ticker_version.lock().await;
                match store.heartbeat(&flow_id, &node_id, *v).await {
                    Ok(true) => *v += 1,
                    Ok(false) => {
                        warn!(%flow_id, "heartbeat rejected; lease lost");
                        ticker_lost.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => {
                        warn!(%flow_id, error = %e, "heartbeat transport error");
                    }
                }
            }
        });

        Lease {
            version,
            lost,
            ticker,
        }
    }

    async fn persist(&self, lease: &Lease, snapshot: &mut FlowSnapshot) -> Result<PersistOutcome> {
        let mut version = lease.version.lock().await;
        snapshot.version = *version;

        let mut attempt = 0;
        loop {
            match self.store.update(snapshot).await {
                Ok(true) => {
                    *version = snapshot.version;
                    return Ok(PersistOutcome::Saved);
                }
                Ok(false) => {
                    let stored = self.store.get(&snapshot.flow_id).await?;
                    return Ok(match stored {
                        Some(s) if s.status.is_terminal() => PersistOutcome::Terminal(s),
                        _ => {
                            lease.lost.store(true, Ordering::Release);
                            PersistOutcome::LeaseLost
                        }
                    });
                }
                Err(StoreError::Storage(e)) if self.config.retry.should_retry(attempt) => {
                    warn!(flow_id = %snapshot.flow_id, error = %e, attempt, "transient store error on persist");
                    let delay = self.config.retry.calculate_delay(attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // --- main loop ------------------------------------------------------

    async fn run(&self, snapshot: FlowSnapshot, ct: &CancelToken) -> Result<FlowOutcome> {
        let state: S = serde_json::from_value(snapshot.state.clone())?;
        let state = Arc::new(Mutex::new(state));
        let lease = self.start_lease(snapshot.flow_id.clone(), snapshot.version);

        let mut snapshot = snapshot;
        let outcome = self.drive(&mut snapshot, &state, &lease, ct).await;
        lease.stop();
        outcome
    }

    async fn drive(
        &self,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<FlowOutcome> {
        loop {
            if ct.is_cancelled() {
                return self.finalize(snapshot, state, lease, FlowStatus::Cancelled, None).await;
            }
            if lease.is_lost() {
                return Ok(FlowOutcome::NotOwned);
            }

            let position = snapshot.position.clone();
            let step = match self.program.step_at(&position) {
                Some(step) => step,
                None => {
                    if position.depth() == 0 {
                        return self
                            .finalize(snapshot, state, lease, FlowStatus::Completed, None)
                            .await;
                    }
                    // Past the end of a nested branch: pop the cursor and
                    // the branch slot, then advance the enclosing step.
                    snapshot.position = position.exit_branch().exit_branch().advance();
                    if let Some(outcome) = self.checkpoint(snapshot, state, lease).await? {
                        return Ok(outcome);
                    }
                    continue;
                }
            };

            debug!(
                flow_id = %snapshot.flow_id,
                position = %position,
                kind = step.kind(),
                name = step.name(),
                "interpreting step"
            );

            let control = match step {
                Step::Send(d) => self.run_dispatch(d, false, snapshot, state, lease, ct).await?,
                Step::Query(d) => self.run_dispatch(d, true, snapshot, state, lease, ct).await?,
                Step::Publish(p) => self.run_publish(p, snapshot, state, lease, ct).await?,
                Step::If(s) => self.run_if(s, snapshot, state, lease).await?,
                Step::Switch(s) => self.run_switch(s, snapshot, state, lease).await?,
                Step::ForEach(s) => self.run_foreach(s, snapshot, state, lease, ct).await?,
                Step::WhenAll(s) => {
                    self.run_when_all(s, snapshot, state, lease, ct).await?
                }
                Step::WhenAny(s) => {
                    self.run_when_any(s, snapshot, state, lease, ct).await?
                }
                Step::Delay(s) => {
                    let until = s.until;
                    self.run_delay(until, snapshot, state, lease).await?
                }
            };

            if let Some(outcome) = control {
                return Ok(outcome);
            }
        }
    }

    /// Serialize state into the snapshot and persist at a step boundary
    ///
    /// `Some(outcome)` means the run must stop with that outcome.
    async fn checkpoint(
        &self,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
    ) -> Result<Option<FlowOutcome>> {
        {
            let guard = state.lock().await;
            snapshot.state = serde_json::to_value(&*guard)?;
        }
        match self.persist(lease, snapshot).await? {
            PersistOutcome::Saved => Ok(None),
            PersistOutcome::Terminal(stored) => Ok(Self::terminal_outcome(&stored)),
            PersistOutcome::LeaseLost => Ok(Some(FlowOutcome::NotOwned)),
        }
    }

    /// Write a terminal or suspended status and stop the run
    async fn finalize(
        &self,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        status: FlowStatus,
        error: Option<String>,
    ) -> Result<FlowOutcome> {
        match status {
            FlowStatus::Completed => snapshot.mark_completed(),
            FlowStatus::Cancelled => snapshot.mark_cancelled(),
            FlowStatus::Failed => {
                snapshot.mark_failed(error.clone().unwrap_or_default());
            }
            _ => {
                snapshot.status = status;
                snapshot.owner = None;
            }
        }

        if let Some(outcome) = self.checkpoint(snapshot, state, lease).await? {
            return Ok(outcome);
        }

        let outcome = match status {
            FlowStatus::Completed => {
                info!(flow_id = %snapshot.flow_id, "flow completed");
                FlowOutcome::Completed
            }
            FlowStatus::Cancelled => {
                info!(flow_id = %snapshot.flow_id, "flow cancelled");
                FlowOutcome::Cancelled
            }
            FlowStatus::Failed => {
                let error = error.unwrap_or_default();
                warn!(flow_id = %snapshot.flow_id, %error, "flow failed");
                FlowOutcome::Failed(error)
            }
            _ => FlowOutcome::Suspended,
        };

        if snapshot.status.is_terminal() {
            self.publish_completion(snapshot).await;
        }
        Ok(outcome)
    }

    /// Publish a completion event for flows spawned into a wait condition
    pub(crate) async fn publish_completion(&self, snapshot: &FlowSnapshot) {
        if snapshot.parent_flow_id.is_none() {
            return;
        }
        let event = FlowCompletedEvent {
            flow_id: snapshot.flow_id.clone(),
            parent_flow_id: snapshot.parent_flow_id.clone(),
            correlation_id: snapshot.correlation_id.clone(),
            success: snapshot.status == FlowStatus::Completed,
            error: snapshot.error.clone(),
            result: (snapshot.status == FlowStatus::Completed).then(|| snapshot.state.clone()),
        };
        let message = self.ids.stamp(event.into_message());
        // A cancelled run must still report back to its parent.
        if let Err(e) = self.mediator.publish(message, &CancelToken::new()).await {
            warn!(flow_id = %snapshot.flow_id, error = %e, "failed to publish completion event");
        }
    }

    // --- step handlers --------------------------------------------------

    async fn run_dispatch(
        &self,
        step: &DispatchStep<S>,
        is_query: bool,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<Option<FlowOutcome>> {
        let message = {
            let guard = state.lock().await;
            if let Some(only_when) = &step.only_when {
                if !only_when(&guard) {
                    drop(guard);
                    snapshot.position = snapshot.position.advance();
                    return self.checkpoint(snapshot, state, lease).await;
                }
            }
            (step.message)(&guard)
        };
        let message = self.ids.stamp(message);

        let result = self.dispatch_with_retry(message, is_query, step.timeout, ct).await?;

        if result.success {
            {
                let mut guard = state.lock().await;
                if let Some(into) = &step.into {
                    let value = result.value.clone().unwrap_or(serde_json::Value::Null);
                    into(&mut guard, &value);
                }
                if let Some(hook) = &step.on_completed {
                    hook(&mut guard);
                }
            }
            snapshot.position = snapshot.position.advance();
            return self.checkpoint(snapshot, state, lease).await;
        }

        let error = result
            .error
            .unwrap_or_else(|| format!("'{}' failed", step.name));
        {
            let mut guard = state.lock().await;
            if let Some(hook) = &step.on_failed {
                hook(&mut guard);
            }
        }

        if let Some(if_fail) = &step.if_fail {
            let compensation = {
                let guard = state.lock().await;
                (if_fail)(&guard)
            };
            let compensation = self.ids.stamp(compensation);
            if let Err(e) = self.mediator.send(compensation, ct).await {
                warn!(step = %step.name, error = %e, "if_fail compensation dispatch failed");
            }
            snapshot.position = snapshot.position.advance();
            return self.checkpoint(snapshot, state, lease).await;
        }

        if step.optional {
            debug!(step = %step.name, %error, "optional step failed; advancing");
            snapshot.position = snapshot.position.advance();
            return self.checkpoint(snapshot, state, lease).await;
        }

        let step_error = FlowError::step_failed(snapshot.position.to_string(), error).to_string();
        self.finalize(snapshot, state, lease, FlowStatus::Failed, Some(step_error))
            .await
            .map(Some)
    }

    async fn dispatch_with_retry(
        &self,
        message: Message,
        is_query: bool,
        timeout: Option<Duration>,
        ct: &CancelToken,
    ) -> Result<QueryResult> {
        let mut attempt = 0;
        loop {
            let call = async {
                if is_query {
                    self.mediator.query(message.clone(), ct).await
                } else {
                    self.mediator.send(message.clone(), ct).await.map(|r| QueryResult {
                        success: r.success,
                        value: None,
                        error: r.error,
                    })
                }
            };

            let result = match timeout {
                Some(t) => match tokio::time::timeout(t, call).await {
                    Ok(r) => r,
                    // The step's own budget elapsed: handler-level failure.
                    Err(_) => return Ok(QueryResult::fail("timed out")),
                },
                None => call.await,
            };

            match result {
                Ok(r) => return Ok(r),
                Err(e) if e.is_transient() && self.config.retry.should_retry(attempt) => {
                    warn!(message = %message.name, error = %e, attempt, "transient dispatch error");
                    let delay = self.config.retry.calculate_delay(attempt);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_publish(
        &self,
        step: &PublishStep<S>,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<Option<FlowOutcome>> {
        let event = {
            let guard = state.lock().await;
            if let Some(only_when) = &step.only_when {
                if !only_when(&guard) {
                    drop(guard);
                    snapshot.position = snapshot.position.advance();
                    return self.checkpoint(snapshot, state, lease).await;
                }
            }
            (step.event)(&guard)
        };
        let event = self.ids.stamp(event);

        if let Err(e) = self.mediator.publish(event, ct).await {
            if step.fails_flow {
                let error =
                    FlowError::step_failed(snapshot.position.to_string(), e.to_string()).to_string();
                return self
                    .finalize(snapshot, state, lease, FlowStatus::Failed, Some(error))
                    .await
                    .map(Some);
            }
            warn!(step = %step.name, error = %e, "publish failed; flow continues");
        }

        snapshot.position = snapshot.position.advance();
        self.checkpoint(snapshot, state, lease).await
    }

    async fn run_if(
        &self,
        step: &IfStep<S>,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
    ) -> Result<Option<FlowOutcome>> {
        let Some(condition) = &step.condition else {
            return self
                .finalize(
                    snapshot,
                    state,
                    lease,
                    FlowStatus::Failed,
                    Some("no condition".to_string()),
                )
                .await
                .map(Some);
        };

        let slot = {
            let guard = state.lock().await;
            if condition(&guard) {
                Some(0u32)
            } else if let Some(i) = step.else_ifs.iter().position(|(p, _)| p(&guard)) {
                Some(i as u32 + 1)
            } else if step.else_branch.is_some() {
                Some(step.else_ifs.len() as u32 + 1)
            } else {
                None
            }
        };

        snapshot.position = match slot {
            Some(slot) => snapshot.position.enter_branch(slot).enter_branch(0),
            None => snapshot.position.advance(),
        };
        self.checkpoint(snapshot, state, lease).await
    }

    async fn run_switch(
        &self,
        step: &SwitchStep<S>,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
    ) -> Result<Option<FlowOutcome>> {
        let key = match &step.selector {
            Some(selector) => {
                let guard = state.lock().await;
                selector(&guard)
            }
            None => None,
        };

        let slot = key
            .and_then(|k| step.cases.iter().position(|(case, _)| case == &k))
            .map(|i| i as u32)
            .or_else(|| {
                step.default
                    .as_ref()
                    .map(|_| step.cases.len() as u32)
            });

        let Some(slot) = slot else {
            let error = FlowError::MissingDefault {
                step: snapshot.position.to_string(),
            }
            .to_string();
            return self
                .finalize(snapshot, state, lease, FlowStatus::Failed, Some(error))
                .await
                .map(Some);
        };

        snapshot.position = snapshot.position.enter_branch(slot).enter_branch(0);
        self.checkpoint(snapshot, state, lease).await
    }

    async fn run_delay(
        &self,
        spec: DelaySpec,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
    ) -> Result<Option<FlowOutcome>> {
        if let Some(wake_at) = snapshot.wake_at {
            if Utc::now() >= wake_at {
                snapshot.wake_at = None;
                snapshot.position = snapshot.position.advance();
                return self.checkpoint(snapshot, state, lease).await;
            }
            return self
                .finalize(snapshot, state, lease, FlowStatus::Suspended, None)
                .await
                .map(Some);
        }

        let wake_at = match spec {
            DelaySpec::For(duration) => {
                Utc::now() + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
            }
            DelaySpec::Until(at) => at,
        };
        snapshot.wake_at = Some(wake_at);
        info!(flow_id = %snapshot.flow_id, %wake_at, "flow suspended on delay");
        self.finalize(snapshot, state, lease, FlowStatus::Suspended, None)
            .await
            .map(Some)
    }

    async fn run_foreach(
        &self,
        step: &ForEachStep<S>,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<Option<FlowOutcome>> {
        let step_key = snapshot.position.to_string();
        let flow_id = snapshot.flow_id.clone();

        let items: Vec<serde_json::Value> = {
            let guard = state.lock().await;
            (step.collection)(&guard).unwrap_or_default()
        };

        let mut progress = match self.store.progress(&flow_id, &step_key).await? {
            Some(progress) => progress,
            None => sagaflow_store::ForEachProgress::new(&flow_id, &step_key, items.len()),
        };

        while !progress.is_complete() {
            if ct.is_cancelled() {
                return self
                    .finalize(snapshot, state, lease, FlowStatus::Cancelled, None)
                    .await
                    .map(Some);
            }
            if lease.is_lost() {
                return Ok(Some(FlowOutcome::NotOwned));
            }

            let batch = select_batch(&progress, step.batch_size);
            if batch.is_empty() {
                break;
            }

            let outcomes = execute_batch(
                step,
                &items,
                &batch,
                state,
                &self.mediator,
                &self.ids,
                ct,
            )
            .await;

            let mut stop_error: Option<(usize, String)> = None;
            let mut cancelled = false;

            for outcome in outcomes {
                match outcome.error {
                    None => progress.record_success(outcome.index),
                    Some(ItemError::Cancelled) => cancelled = true,
                    Some(ItemError::Failed(error)) => {
                        // CollectErrors already recorded the error into
                        // state when the item finished.
                        progress.record_failure(outcome.index);
                        if step.policy == FailurePolicy::StopOnFirstFailure
                            && stop_error.as_ref().map_or(true, |(i, _)| outcome.index < *i)
                        {
                            stop_error = Some((outcome.index, error));
                        }
                    }
                }
            }

            self.store.save_progress(&progress).await?;
            if let Some(outcome) = self.checkpoint(snapshot, state, lease).await? {
                return Ok(Some(outcome));
            }

            if let Some((index, error)) = stop_error {
                // Progress is retained for forensics.
                let message = format!("item {} failed: {}", index, error);
                let error = FlowError::step_failed(step_key.clone(), message).to_string();
                return self
                    .finalize(snapshot, state, lease, FlowStatus::Failed, Some(error))
                    .await
                    .map(Some);
            }
            if cancelled {
                return self
                    .finalize(snapshot, state, lease, FlowStatus::Cancelled, None)
                    .await
                    .map(Some);
            }
        }

        if let Some(hook) = &step.on_complete {
            let mut guard = state.lock().await;
            hook(&mut guard);
        }
        self.store.clear_progress(&flow_id, &step_key).await?;
        snapshot.position = snapshot.position.advance();
        self.checkpoint(snapshot, state, lease).await
    }

    async fn run_when_all(
        &self,
        step: &WhenAllStep<S>,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<Option<FlowOutcome>> {
        self.spawn_wait(
            WaitKind::All,
            &step.children,
            step.timeout,
            false,
            snapshot,
            state,
            lease,
            ct,
        )
        .await
    }

    async fn run_when_any(
        &self,
        step: &WhenAnyStep<S>,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<Option<FlowOutcome>> {
        self.spawn_wait(
            WaitKind::Any,
            &step.children,
            step.timeout,
            step.cancel_others,
            snapshot,
            state,
            lease,
            ct,
        )
        .await
    }

    /// Fan-out spawn phase
    ///
    /// The wait condition and the parent's Suspended status are both
    /// durable before any child start message is dispatched, so a child
    /// completion event can never observe a missing condition for a live
    /// wait.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_wait(
        &self,
        kind: WaitKind,
        children: &[crate::program::MessageFactory<S>],
        timeout: Duration,
        cancel_others: bool,
        snapshot: &mut FlowSnapshot,
        state: &Arc<Mutex<S>>,
        lease: &Lease,
        ct: &CancelToken,
    ) -> Result<Option<FlowOutcome>> {
        let step_key = snapshot.position.to_string();
        let correlation_id = format!("{}-step-{}", snapshot.flow_id, step_key);

        // Idempotent re-entry: children were already spawned.
        if self.store.wait_condition(&correlation_id).await?.is_some() {
            return self
                .finalize(snapshot, state, lease, FlowStatus::Suspended, None)
                .await
                .map(Some);
        }

        let mut condition = WaitCondition::new(
            &correlation_id,
            kind,
            children.len() as u32,
            timeout.as_millis() as i64,
            &snapshot.flow_id,
            &snapshot.flow_type,
            &step_key,
        )
        .with_cancel_others(cancel_others);

        let mut starts = Vec::with_capacity(children.len());
        {
            let guard = state.lock().await;
            for factory in children {
                let child_flow_id = Uuid::new_v4().to_string();
                let message = factory(&guard).with_routing(FlowRouting {
                    parent_flow_id: snapshot.flow_id.clone(),
                    correlation_id: correlation_id.clone(),
                    child_flow_id: child_flow_id.clone(),
                });
                condition.add_child(child_flow_id);
                starts.push(message);
            }
        }

        self.store.put_wait_condition(&condition).await?;
        info!(
            flow_id = %snapshot.flow_id,
            %correlation_id,
            children = condition.child_flow_ids.len(),
            "flow suspending on fan-out"
        );

        snapshot.status = FlowStatus::Suspended;
        snapshot.owner = None;
        if let Some(outcome) = self.checkpoint(snapshot, state, lease).await? {
            return Ok(Some(outcome));
        }

        for message in starts {
            let message = self.ids.stamp(message);
            let name = message.name.clone();
            match self.dispatch_with_retry(message, false, None, ct).await {
                Ok(result) if result.success => {}
                Ok(result) => warn!(
                    message = %name,
                    error = ?result.error,
                    "child start rejected; wait will rely on its timeout"
                ),
                Err(e) => warn!(
                    message = %name,
                    error = %e,
                    "child start dispatch failed; wait will rely on its timeout"
                ),
            }
        }

        Ok(Some(FlowOutcome::Suspended))
    }
}
