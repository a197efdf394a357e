//! Mediator port - the engine's outbound dispatch capability
//!
//! The engine never talks to handlers directly; every step dispatch goes
//! through the **[`Mediator`]** trait. Concrete bindings (in-memory bus,
//! Redis, NATS JetStream) live outside the core - this module defines the
//! contract they must satisfy plus [`RecordingMediator`], an in-memory test
//! double used throughout the engine's own tests.
//!
//! Handler-level failure and transport-level failure are distinct:
//! a handler that rejects a command yields `Ok(DispatchResult { success:
//! false, .. })`, while a broker timeout yields `Err(FlowError::Mediator)`.
//! The executor retries the latter with backoff and converts the former
//! into step-failure semantics (optional steps advance, `if_fail` steps
//! dispatch their compensation, everything else fails the flow).

use crate::cancel::CancelToken;
use crate::error::{FlowError, Result};
use crate::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Outcome of a fire-and-acknowledge dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    /// Whether the handler reported success
    pub success: bool,
    /// Handler error message when `success` is false
    pub error: Option<String>,
}

impl DispatchResult {
    /// Successful dispatch
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// Failed dispatch with a handler error
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Outcome of a request/response dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Whether the handler reported success
    pub success: bool,
    /// Handler-provided value on success
    pub value: Option<serde_json::Value>,
    /// Handler error message when `success` is false
    pub error: Option<String>,
}

impl QueryResult {
    /// Successful query with a value
    pub fn ok(value: serde_json::Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    /// Failed query with a handler error
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}

/// Capability set the executor uses to reach handlers
///
/// Errors from these methods are transport-level; business failure travels
/// inside [`DispatchResult`] / [`QueryResult`].
#[async_trait]
pub trait Mediator: Send + Sync {
    /// Dispatch a command and await its acknowledgement
    async fn send(&self, message: Message, ct: &CancelToken) -> Result<DispatchResult>;

    /// Dispatch a request and await its typed response
    async fn query(&self, message: Message, ct: &CancelToken) -> Result<QueryResult>;

    /// Publish an event, fire-and-forget
    async fn publish(&self, event: Message, ct: &CancelToken) -> Result<()>;
}

#[derive(Debug, Default)]
struct RecordingInner {
    sent: Vec<Message>,
    published: Vec<Message>,
    handler_failures: HashMap<String, String>,
    transport_failures: HashMap<String, usize>,
    publish_failures: HashMap<String, String>,
    query_responses: HashMap<String, serde_json::Value>,
}

/// In-memory mediator double that records every dispatch
///
/// Defaults to succeeding on everything. Tests program failures per message
/// name and inspect the recorded traffic afterwards.
///
/// # Example
///
/// ```rust
/// use sagaflow_core::{CancelToken, Mediator, Message, RecordingMediator};
/// use serde_json::json;
///
/// # async fn example() -> sagaflow_core::Result<()> {
/// let mediator = RecordingMediator::new();
/// mediator.fail_on("payment.charge", "card declined").await;
///
/// let ct = CancelToken::new();
/// let result = mediator
///     .send(Message::new("payment.charge", json!({})), &ct)
///     .await?;
/// assert!(!result.success);
/// assert_eq!(mediator.sent_names().await, vec!["payment.charge"]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct RecordingMediator {
    inner: Mutex<RecordingInner>,
}

impl RecordingMediator {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Program a handler failure for every dispatch of the given name
    pub async fn fail_on(&self, name: &str, error: &str) {
        self.inner
            .lock()
            .await
            .handler_failures
            .insert(name.to_string(), error.to_string());
    }

    /// Program `times` transport failures for the given name, then success
    pub async fn fail_transport(&self, name: &str, times: usize) {
        self.inner
            .lock()
            .await
            .transport_failures
            .insert(name.to_string(), times);
    }

    /// Program a transport failure for every publish of the given name
    pub async fn fail_publish_on(&self, name: &str, error: &str) {
        self.inner
            .lock()
            .await
            .publish_failures
            .insert(name.to_string(), error.to_string());
    }

    /// Program the value returned by queries of the given name
    pub async fn respond_on(&self, name: &str, value: serde_json::Value) {
        self.inner
            .lock()
            .await
            .query_responses
            .insert(name.to_string(), value);
    }

    /// Every message dispatched via `send` or `query`, in order
    pub async fn sent(&self) -> Vec<Message> {
        self.inner.lock().await.sent.clone()
    }

    /// Names of dispatched messages, in order
    pub async fn sent_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .await
            .sent
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    /// Every published event, in order
    pub async fn published(&self) -> Vec<Message> {
        self.inner.lock().await.published.clone()
    }

    async fn record(&self, message: &Message) -> Result<Option<String>> {
        let mut inner = self.inner.lock().await;

        if let Some(remaining) = inner.transport_failures.get_mut(&message.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(FlowError::Mediator(format!(
                    "transport unavailable for '{}'",
                    message.name
                )));
            }
        }

        inner.sent.push(message.clone());
        Ok(inner.handler_failures.get(&message.name).cloned())
    }
}

#[async_trait]
impl Mediator for RecordingMediator {
    async fn send(&self, message: Message, ct: &CancelToken) -> Result<DispatchResult> {
        if ct.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        match self.record(&message).await? {
            Some(error) => Ok(DispatchResult::fail(error)),
            None => Ok(DispatchResult::ok()),
        }
    }

    async fn query(&self, message: Message, ct: &CancelToken) -> Result<QueryResult> {
        if ct.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let name = message.name.clone();
        match self.record(&message).await? {
            Some(error) => Ok(QueryResult::fail(error)),
            None => {
                let value = self
                    .inner
                    .lock()
                    .await
                    .query_responses
                    .get(&name)
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                Ok(QueryResult::ok(value))
            }
        }
    }

    async fn publish(&self, event: Message, ct: &CancelToken) -> Result<()> {
        if ct.is_cancelled() {
            return Err(FlowError::Cancelled);
        }
        let mut inner = self.inner.lock().await;
        if let Some(error) = inner.publish_failures.get(&event.name) {
            return Err(FlowError::Mediator(error.clone()));
        }
        inner.published.push(event);
        Ok(())
    }
}
