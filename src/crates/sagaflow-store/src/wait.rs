//! Durable wait-condition rows for fan-out coordination
//!
//! A [`WaitCondition`] is the durable handshake between a suspended parent
//! flow and the child flows it spawned. The parent writes the condition
//! before dispatching any child; child completion events update it; the
//! coordinator clears it when the predicate is satisfied and resumes the
//! parent. There is no in-memory future blocked anywhere - the row itself
//! is the rendezvous.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fan-in predicate of a wait condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Satisfied when every expected child has reported
    All,
    /// Satisfied by the first successful child, or by exhaustion when all
    /// children have reported without a success (the parent then fails with
    /// an aggregated error)
    Any,
}

/// One child's reported outcome, in arrival order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildResult {
    /// Flow id of the reporting child
    pub child_flow_id: String,
    /// Whether the child completed successfully
    pub success: bool,
    /// Error message when `success` is false
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Opaque result payload from the child
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Durable record linking a suspended parent to its outstanding children
///
/// Keyed by `correlation_id`, conventionally
/// `"{parent_flow_id}-step-{position}"`. Invariants:
/// `completed_count == results.len()` and `completed_count <= expected_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitCondition {
    /// Unique key of this condition
    pub correlation_id: String,

    /// All / Any predicate
    pub kind: WaitKind,

    /// Number of children spawned
    pub expected_count: u32,

    /// Number of children that have reported so far
    pub completed_count: u32,

    /// Child flow ids in spawn order
    pub child_flow_ids: Vec<String>,

    /// Reported outcomes in arrival order
    pub results: Vec<ChildResult>,

    /// Milliseconds after `created_at` at which the wait expires
    pub timeout_ms: i64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Whether remaining children are cancelled once the predicate holds
    pub cancel_others: bool,

    /// Flow id of the suspended parent
    pub flow_id: String,

    /// Program identity of the suspended parent
    pub flow_type: String,

    /// Position string of the waiting step in the parent program
    pub step: String,
}

impl WaitCondition {
    /// Create a new, empty condition for a parent about to spawn children
    pub fn new(
        correlation_id: impl Into<String>,
        kind: WaitKind,
        expected_count: u32,
        timeout_ms: i64,
        flow_id: impl Into<String>,
        flow_type: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            kind,
            expected_count,
            completed_count: 0,
            child_flow_ids: Vec::new(),
            results: Vec::new(),
            timeout_ms,
            created_at: Utc::now(),
            cancel_others: false,
            flow_id: flow_id.into(),
            flow_type: flow_type.into(),
            step: step.into(),
        }
    }

    /// Enable cancellation of remaining children on satisfaction
    pub fn with_cancel_others(mut self, cancel_others: bool) -> Self {
        self.cancel_others = cancel_others;
        self
    }

    /// Register a spawned child
    pub fn add_child(&mut self, child_flow_id: impl Into<String>) {
        self.child_flow_ids.push(child_flow_id.into());
    }

    /// Record a child's outcome; returns false for duplicate reports
    ///
    /// The same completion event may be delivered more than once; a child
    /// already present in `results` is discarded.
    pub fn record_result(&mut self, result: ChildResult) -> bool {
        if self
            .results
            .iter()
            .any(|r| r.child_flow_id == result.child_flow_id)
        {
            return false;
        }
        self.results.push(result);
        self.completed_count = self.results.len() as u32;
        true
    }

    /// Whether the fan-in predicate currently holds
    pub fn is_satisfied(&self) -> bool {
        match self.kind {
            WaitKind::All => self.completed_count == self.expected_count,
            WaitKind::Any => {
                self.results.iter().any(|r| r.success)
                    || self.completed_count == self.expected_count
            }
        }
    }

    /// Whether any reported child failed
    pub fn has_failure(&self) -> bool {
        self.results.iter().any(|r| !r.success)
    }

    /// The first successful result, in arrival order
    pub fn first_success(&self) -> Option<&ChildResult> {
        self.results.iter().find(|r| r.success)
    }

    /// Children that have not yet reported, in spawn order
    pub fn pending_children(&self) -> Vec<&str> {
        self.child_flow_ids
            .iter()
            .filter(|id| !self.results.iter().any(|r| &r.child_flow_id == *id))
            .map(String::as_str)
            .collect()
    }

    /// Whether the wait has expired and the predicate never held
    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        !self.is_satisfied()
            && (now - self.created_at).num_milliseconds() > self.timeout_ms
    }

    /// Joined error text of every failed child, in arrival order
    pub fn aggregated_error(&self) -> String {
        let errors: Vec<String> = self
            .results
            .iter()
            .filter(|r| !r.success)
            .map(|r| {
                format!(
                    "{}: {}",
                    r.child_flow_id,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();
        format!("all {} children failed: {}", errors.len(), errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(kind: WaitKind, expected: u32) -> WaitCondition {
        WaitCondition::new("p-step-0", kind, expected, 60_000, "p", "demo", "0")
    }

    fn success(id: &str) -> ChildResult {
        ChildResult {
            child_flow_id: id.to_string(),
            success: true,
            error: None,
            result: None,
        }
    }

    fn failure(id: &str, error: &str) -> ChildResult {
        ChildResult {
            child_flow_id: id.to_string(),
            success: false,
            error: Some(error.to_string()),
            result: None,
        }
    }

    #[test]
    fn test_all_satisfied_only_when_every_child_reported() {
        let mut c = condition(WaitKind::All, 2);
        assert!(!c.is_satisfied());

        assert!(c.record_result(failure("c2", "oops")));
        assert!(!c.is_satisfied());

        assert!(c.record_result(success("c1")));
        assert!(c.is_satisfied());
        assert!(c.has_failure());
        assert_eq!(c.completed_count, 2);
    }

    #[test]
    fn test_any_satisfied_by_first_success() {
        let mut c = condition(WaitKind::Any, 2);
        assert!(c.record_result(success("c1")));
        assert!(c.is_satisfied());
        assert_eq!(c.first_success().unwrap().child_flow_id, "c1");
    }

    #[test]
    fn test_any_satisfied_by_exhaustion_without_success() {
        let mut c = condition(WaitKind::Any, 2);
        assert!(c.record_result(failure("c1", "a")));
        assert!(!c.is_satisfied());
        assert!(c.record_result(failure("c2", "b")));
        assert!(c.is_satisfied());
        assert!(c.first_success().is_none());
        assert_eq!(c.aggregated_error(), "all 2 children failed: c1: a; c2: b");
    }

    #[test]
    fn test_duplicate_results_discarded() {
        let mut c = condition(WaitKind::All, 2);
        assert!(c.record_result(success("c1")));
        assert!(!c.record_result(success("c1")));
        assert_eq!(c.completed_count, 1);
        assert_eq!(c.results.len(), 1);
    }

    #[test]
    fn test_pending_children_in_spawn_order() {
        let mut c = condition(WaitKind::All, 3);
        c.add_child("c1");
        c.add_child("c2");
        c.add_child("c3");
        c.record_result(success("c2"));
        assert_eq!(c.pending_children(), vec!["c1", "c3"]);
    }

    #[test]
    fn test_timeout_only_when_unsatisfied() {
        let mut c = condition(WaitKind::All, 1);
        let later = c.created_at + chrono::Duration::milliseconds(120_000);
        assert!(c.is_timed_out(later));

        c.record_result(success("c1"));
        assert!(!c.is_timed_out(later));
    }

    #[test]
    fn test_wait_condition_serde_round_trip() {
        let mut c = condition(WaitKind::Any, 2).with_cancel_others(true);
        c.add_child("c1");
        c.record_result(failure("c1", "nope"));

        let bytes = serde_json::to_vec(&c).unwrap();
        let restored: WaitCondition = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.correlation_id, c.correlation_id);
        assert_eq!(restored.kind, c.kind);
        assert_eq!(restored.completed_count, 1);
        assert!(restored.cancel_others);
        assert_eq!(restored.results[0].error.as_deref(), Some("nope"));
    }
}
