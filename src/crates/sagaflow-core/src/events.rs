//! Flow-completion events
//!
//! When a flow with a recorded parent linkage reaches a terminal status the
//! engine publishes a [`FlowCompletedEvent`]. The wait coordinator consumes
//! these to update wait conditions and resume suspended parents. A failed
//! child never raises an error across the flow boundary - it arrives here
//! as data.

use crate::message::Message;
use serde::{Deserialize, Serialize};

/// Event name used for flow-completion messages
pub const FLOW_COMPLETED_EVENT: &str = "flow.completed";

/// Published when a flow reaches a terminal status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowCompletedEvent {
    /// Flow id of the completed flow
    pub flow_id: String,

    /// Parent flow id, when this flow was spawned into a fan-out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_flow_id: Option<String>,

    /// Correlation id of the parent's wait condition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Whether the flow completed successfully
    pub success: bool,

    /// Error message when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Opaque result payload for the parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl FlowCompletedEvent {
    /// Wrap this event in a publishable message
    pub fn into_message(self) -> Message {
        let body = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        Message::new(FLOW_COMPLETED_EVENT, body)
    }

    /// Parse a completion event out of a message, if it is one
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.name != FLOW_COMPLETED_EVENT {
            return None;
        }
        serde_json::from_value(message.body.clone()).ok()
    }
}
