//! Durable flow snapshot rows
//!
//! This module defines **[`FlowSnapshot`]** - the durable record of one flow
//! instance and the unit of compare-and-swap in the store - together with the
//! [`FlowStatus`] lifecycle.
//!
//! # Overview
//!
//! A snapshot carries everything needed to resume a flow on any node:
//!
//! - **Identity** - `flow_id` (unique, immutable) and `flow_type` (selects
//!   which program the executor interprets)
//! - **Progress** - the serialized application state and the tree-indexed
//!   [`FlowPosition`](crate::FlowPosition) program counter
//! - **Ownership** - the owning node id and its last heartbeat, driving the
//!   cooperative lease protocol
//! - **Versioning** - a `u64` version incremented by exactly one on every
//!   successful mutation; all writes are CAS on this version
//!
//! # Lifecycle
//!
//! ```text
//! NotStarted → Running
//! Running    → Suspended | WaitingForResponse | Completed | Failed | Cancelled
//! Suspended  → Running | Cancelled | Failed
//! WaitingForResponse → Running | Failed | Cancelled
//! Completed, Failed, Cancelled   (terminal, absorbing)
//! ```
//!
//! Terminal statuses are absorbing: once a snapshot is Completed, Failed or
//! Cancelled no further transition is legal, and every entry point returns
//! the stored result instead of re-executing. A snapshot with an owner is
//! always in an active status (`Running`, `Suspended` or
//! `WaitingForResponse`).
//!
//! # Example
//!
//! ```rust
//! use sagaflow_store::{FlowSnapshot, FlowStatus};
//! use serde_json::json;
//!
//! let snapshot = FlowSnapshot::new("order-42", "order-fulfillment", json!({"total": 99}))
//!     .with_status(FlowStatus::Running)
//!     .with_owner("node-a");
//!
//! assert_eq!(snapshot.version, 0);
//! assert!(!snapshot.status.is_terminal());
//! ```

use crate::position::FlowPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current unix time in milliseconds, the clock used for heartbeats
pub fn unix_millis_now() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle status of a flow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Row created but execution has not begun
    NotStarted,
    /// A node is actively interpreting the program
    Running,
    /// Parked on a wait condition or delay; resumed from the outside
    Suspended,
    /// Parked on a request/response round trip
    WaitingForResponse,
    /// Finished successfully
    Completed,
    /// Finished with an error (recorded on the snapshot)
    Failed,
    /// Cooperatively cancelled
    Cancelled,
}

impl FlowStatus {
    /// Whether this status is terminal (absorbing)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a node may hold ownership of a snapshot in this status
    pub fn is_ownable(&self) -> bool {
        matches!(
            self,
            Self::Running | Self::Suspended | Self::WaitingForResponse
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::Running => write!(f, "running"),
            Self::Suspended => write!(f, "suspended"),
            Self::WaitingForResponse => write!(f, "waiting_for_response"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Durable record of one flow instance
///
/// The snapshot is the unit of optimistic concurrency: every successful
/// store mutation increments `version` by exactly one, and every write is a
/// compare-and-swap against the version the writer last observed. Late
/// writes from a node that lost its lease are therefore rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Unique, immutable flow identity
    pub flow_id: String,

    /// Program identity; tells the executor which tree to interpret
    pub flow_type: String,

    /// Serialized application state (canonical typed blob)
    pub state: serde_json::Value,

    /// Tree-indexed program counter
    pub position: FlowPosition,

    /// Lifecycle status
    pub status: FlowStatus,

    /// Error message; set iff status is Failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Owning node identity; None iff unowned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Unix-millis of the owner's last heartbeat; non-decreasing while owned
    pub heartbeat_at: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Timestamp of the last successful mutation
    pub updated_at: DateTime<Utc>,

    /// CAS version; incremented by exactly one per successful mutation
    pub version: u64,

    /// Opaque payload carried across resumes, independent of `state`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<u8>>,

    /// Wakeup marker for a suspended Delay step
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,

    /// Flow id of the parent that spawned this flow, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_flow_id: Option<String>,

    /// Correlation id of the parent's wait condition, if spawned into one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl FlowSnapshot {
    /// Create a fresh snapshot at the initial position
    pub fn new(
        flow_id: impl Into<String>,
        flow_type: impl Into<String>,
        state: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            flow_id: flow_id.into(),
            flow_type: flow_type.into(),
            state,
            position: FlowPosition::initial(),
            status: FlowStatus::NotStarted,
            error: None,
            owner: None,
            heartbeat_at: unix_millis_now(),
            created_at: now,
            updated_at: now,
            version: 0,
            data: None,
            wake_at: None,
            parent_flow_id: None,
            correlation_id: None,
        }
    }

    /// Set the status
    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the owning node
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Set the position
    pub fn with_position(mut self, position: FlowPosition) -> Self {
        self.position = position;
        self
    }

    /// Attach an opaque payload
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    /// Record the parent linkage for a spawned child flow
    pub fn with_parent(
        mut self,
        parent_flow_id: impl Into<String>,
        correlation_id: impl Into<String>,
    ) -> Self {
        self.parent_flow_id = Some(parent_flow_id.into());
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Whether the given node currently appears as the owner
    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.owner.as_deref() == Some(node_id)
    }

    /// Whether the owner's heartbeat is fresh with respect to the claim timeout
    pub fn has_live_owner(&self, now_millis: i64, claim_timeout_ms: i64) -> bool {
        self.owner.is_some() && self.heartbeat_at >= now_millis - claim_timeout_ms
    }

    /// Transition into a terminal failure, recording the error
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = FlowStatus::Failed;
        self.error = Some(error.into());
        self.owner = None;
    }

    /// Transition into successful completion
    pub fn mark_completed(&mut self) {
        self.status = FlowStatus::Completed;
        self.error = None;
        self.owner = None;
    }

    /// Transition into cancellation
    pub fn mark_cancelled(&mut self) {
        self.status = FlowStatus::Cancelled;
        self.owner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_snapshot_defaults() {
        let s = FlowSnapshot::new("f-1", "demo", json!({}));
        assert_eq!(s.version, 0);
        assert_eq!(s.status, FlowStatus::NotStarted);
        assert_eq!(s.position, FlowPosition::initial());
        assert!(s.owner.is_none());
        assert!(s.error.is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(FlowStatus::Completed.is_terminal());
        assert!(FlowStatus::Failed.is_terminal());
        assert!(FlowStatus::Cancelled.is_terminal());
        assert!(!FlowStatus::Running.is_terminal());
        assert!(!FlowStatus::Suspended.is_terminal());
        assert!(!FlowStatus::NotStarted.is_terminal());
    }

    #[test]
    fn test_ownable_statuses() {
        assert!(FlowStatus::Running.is_ownable());
        assert!(FlowStatus::Suspended.is_ownable());
        assert!(FlowStatus::WaitingForResponse.is_ownable());
        assert!(!FlowStatus::NotStarted.is_ownable());
        assert!(!FlowStatus::Completed.is_ownable());
    }

    #[test]
    fn test_live_owner_detection() {
        let now = unix_millis_now();
        let mut s = FlowSnapshot::new("f-1", "demo", json!({})).with_owner("node-a");
        s.heartbeat_at = now;
        assert!(s.has_live_owner(now, 30_000));

        s.heartbeat_at = now - 60_000;
        assert!(!s.has_live_owner(now, 30_000));

        s.owner = None;
        s.heartbeat_at = now;
        assert!(!s.has_live_owner(now, 30_000));
    }

    #[test]
    fn test_mark_failed_records_error_and_releases_owner() {
        let mut s = FlowSnapshot::new("f-1", "demo", json!({})).with_owner("node-a");
        s.mark_failed("boom");
        assert_eq!(s.status, FlowStatus::Failed);
        assert_eq!(s.error.as_deref(), Some("boom"));
        assert!(s.owner.is_none());
    }

    #[test]
    fn test_snapshot_serde_round_trip() {
        let s = FlowSnapshot::new("f-1", "demo", json!({"count": 3}))
            .with_status(FlowStatus::Suspended)
            .with_parent("parent-1", "parent-1-step-2")
            .with_data(vec![1, 2, 3]);

        let bytes = serde_json::to_vec(&s).unwrap();
        let restored: FlowSnapshot = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(restored.flow_id, s.flow_id);
        assert_eq!(restored.status, s.status);
        assert_eq!(restored.state, s.state);
        assert_eq!(restored.data, s.data);
        assert_eq!(restored.parent_flow_id, s.parent_flow_id);
        assert_eq!(restored.correlation_id, s.correlation_id);
    }
}
