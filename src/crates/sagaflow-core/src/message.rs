//! Message envelope and process-unique message ids
//!
//! Every dispatch through the mediator carries a [`Message`]: a named JSON
//! body with a `u64` id unique within the process lifetime, plus optional
//! [`FlowRouting`] fields when the message starts or cancels a spawned
//! child flow.
//!
//! Ids come from a [`MessageIdGenerator`] using a Snowflake-style layout -
//! unix-millis in the high bits, a node discriminator, and an atomic
//! sequence in the low bits - so concurrent tasks never collide and ids
//! sort roughly by creation time.

use sagaflow_store::unix_millis_now;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Message name used to cancel a spawned child flow
pub const CANCEL_FLOW_MESSAGE: &str = "flow.cancel";

/// Routing fields linking a message to a fan-out wait
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRouting {
    /// Flow id of the spawning parent
    pub parent_flow_id: String,
    /// Correlation id of the parent's wait condition
    pub correlation_id: String,
    /// Flow id assigned to the spawned child
    pub child_flow_id: String,
}

/// Envelope dispatched through the mediator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Process-unique id; 0 until stamped by a [`MessageIdGenerator`]
    pub id: u64,

    /// Message name; selects the handler on the other side
    pub name: String,

    /// JSON payload
    pub body: serde_json::Value,

    /// Present on child-start and child-cancel messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing: Option<FlowRouting>,
}

impl Message {
    /// Create an unstamped message
    pub fn new(name: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            id: 0,
            name: name.into(),
            body,
            routing: None,
        }
    }

    /// Attach routing fields
    pub fn with_routing(mut self, routing: FlowRouting) -> Self {
        self.routing = Some(routing);
        self
    }

    /// Build a cancellation message for a spawned child flow
    pub fn cancel_flow(child_flow_id: &str) -> Self {
        Self::new(
            CANCEL_FLOW_MESSAGE,
            serde_json::json!({ "flow_id": child_flow_id }),
        )
    }
}

/// Snowflake-style generator of process-unique `u64` message ids
///
/// Layout: 41 bits of unix-millis, 10 bits of node id, 12 bits of
/// sequence. Uniqueness holds within a process lifetime; two processes
/// stay disjoint as long as their node ids differ.
#[derive(Debug)]
pub struct MessageIdGenerator {
    node_id: u64,
    sequence: AtomicU64,
}

impl MessageIdGenerator {
    /// Millisecond epoch the timestamp bits count from (2024-01-01 UTC)
    const EPOCH_MILLIS: i64 = 1_704_067_200_000;

    /// Create a generator for the given node (only the low 10 bits are used)
    pub fn new(node_id: u16) -> Self {
        Self {
            node_id: (node_id as u64) & 0x3ff,
            sequence: AtomicU64::new(0),
        }
    }

    /// Produce the next id
    pub fn next_id(&self) -> u64 {
        let millis = (unix_millis_now() - Self::EPOCH_MILLIS).max(0) as u64;
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) & 0xfff;
        (millis << 22) | (self.node_id << 12) | seq
    }

    /// Stamp a message with a fresh id, consuming and returning it
    pub fn stamp(&self, mut message: Message) -> Message {
        message.id = self.next_id();
        message
    }
}
